//! Deep-copy report models and mutable report builder.

use std::collections::BTreeMap;
use std::fmt;

/// Aggregate counters for one top-level copy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReportDeepCopy {
    /// Graph nodes entered (fields, elements, keys, values, targets).
    pub cnt_nodes: u64,
    /// Pointer targets, slice storages and maps newly allocated.
    pub cnt_allocated: u64,
    /// Funcs, channels and resources shared with the source.
    pub cnt_shared: u64,
    /// Nodes copied by a custom hook.
    pub cnt_hooked: u64,
    /// Hidden record members left at their zero value.
    pub cnt_hidden_fields: u64,
    /// Seen-set lookups performed past the detection threshold.
    pub cnt_identity_checks: u64,
    /// Deepest recursion depth reached.
    pub n_depth_max: u64,
}

impl ReportDeepCopy {
    /// Machine-readable counters.
    pub fn to_dict(&self) -> BTreeMap<String, u64> {
        let mut dict_counts = BTreeMap::new();
        dict_counts.insert("cnt_nodes".to_string(), self.cnt_nodes);
        dict_counts.insert("cnt_allocated".to_string(), self.cnt_allocated);
        dict_counts.insert("cnt_shared".to_string(), self.cnt_shared);
        dict_counts.insert("cnt_hooked".to_string(), self.cnt_hooked);
        dict_counts.insert("cnt_hidden_fields".to_string(), self.cnt_hidden_fields);
        dict_counts.insert("cnt_identity_checks".to_string(), self.cnt_identity_checks);
        dict_counts.insert("n_depth_max".to_string(), self.n_depth_max);
        dict_counts
    }

    /// Human-readable one-line summary.
    pub fn format(&self, prefix: &str) -> String {
        format!(
            "{prefix} nodes={} allocated={} shared={} hooked={} hidden={} identity_checks={} depth_max={}",
            self.cnt_nodes,
            self.cnt_allocated,
            self.cnt_shared,
            self.cnt_hooked,
            self.cnt_hidden_fields,
            self.cnt_identity_checks,
            self.n_depth_max
        )
    }
}

impl fmt::Display for ReportDeepCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format("[DEEPCOPY]"))
    }
}

/// Mutable accumulator threaded through one traversal.
#[derive(Debug, Default, Clone)]
pub struct ReportDeepCopyBuilder {
    report: ReportDeepCopy,
}

impl ReportDeepCopyBuilder {
    /// Count one entered node at `n_depth`.
    pub fn add_node(&mut self, n_depth: usize) {
        self.report.cnt_nodes += 1;
        self.report.n_depth_max = self.report.n_depth_max.max(n_depth as u64);
    }

    pub fn add_allocated(&mut self) {
        self.report.cnt_allocated += 1;
    }

    pub fn add_shared(&mut self) {
        self.report.cnt_shared += 1;
    }

    pub fn add_hooked(&mut self) {
        self.report.cnt_hooked += 1;
    }

    pub fn add_hidden_field(&mut self) {
        self.report.cnt_hidden_fields += 1;
    }

    pub fn add_identity_check(&mut self) {
        self.report.cnt_identity_checks += 1;
    }

    /// Finalize builder into immutable report.
    pub fn build(self) -> ReportDeepCopy {
        self.report
    }
}
