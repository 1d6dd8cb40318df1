//! Copy options, value categories and top-level error types.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conf::{N_DEPTH_MAX_REFERENCE_CHAIN, N_DEPTH_START_DETECTING_CYCLES};
use crate::value::DeepValue;

////////////////////////////////////////////////////////////////////////////////
// #region EnumsInit

/// Structural category of a value, deciding its reconstruction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumValueCategory {
    /// Copied by value.
    Primitive,
    /// Exported members copied recursively, hidden members left at zero.
    Record,
    /// Same arity, element by element.
    FixedSequence,
    /// New backing storage of equal length and capacity.
    DynamicSequence,
    /// New mapping with deep-copied keys and values.
    Associative,
    /// New target holding a copy of the pointee.
    Reference,
    /// Concrete value copied and re-wrapped.
    Polymorphic,
    /// Shared with the source, never cloned.
    OpaqueShared,
    /// Copied by value; the location reference stays shared.
    Timestamp,
    /// Copied by the value's own hook.
    Custom,
}

impl EnumValueCategory {
    /// Categories that can close a cycle through shared storage.
    pub fn is_cycle_tracked(self) -> bool {
        matches!(
            self,
            Self::Reference | Self::DynamicSequence | Self::Associative
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primitive => "primitive",
            Self::Record => "record",
            Self::FixedSequence => "fixed_sequence",
            Self::DynamicSequence => "dynamic_sequence",
            Self::Associative => "associative",
            Self::Reference => "reference",
            Self::Polymorphic => "polymorphic",
            Self::OpaqueShared => "opaque_shared",
            Self::Timestamp => "timestamp",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for EnumValueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region StructsAndErrors

/// Input options for [`crate::DeepCopier`].
///
/// Deserializable so hosts can carry it in their own config files; omitted
/// keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecDeepCopyOptions {
    /// Depth past which reference identities are tracked for cycle detection.
    /// `0` tracks every reference node.
    pub depth_start_detecting_cycles: usize,
    /// Hard recursion ceiling. Must be >= 1.
    pub depth_max_reference_chain: usize,
    /// Maximum worker threads for [`crate::DeepCopier::copy_batch`].
    pub num_workers_max: Option<usize>,
}

impl Default for SpecDeepCopyOptions {
    fn default() -> Self {
        Self {
            depth_start_detecting_cycles: N_DEPTH_START_DETECTING_CYCLES,
            depth_max_reference_chain: N_DEPTH_MAX_REFERENCE_CHAIN,
            num_workers_max: None,
        }
    }
}

impl SpecDeepCopyOptions {
    pub fn validate(&self) -> Result<(), DeepCopyError> {
        if self.depth_max_reference_chain == 0 {
            return Err(DeepCopyError::InvalidOptions(
                "Arg `depth_max_reference_chain` must be >= 1.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-type copy override registered on a [`crate::DeepCopier`].
pub type TypeCopyHook = Arc<dyn Fn(&DeepValue) -> DeepValue + Send + Sync>;

/// Failure of a whole copy. No partial graph is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeepCopyError {
    /// Recursion depth exceeded the configured ceiling.
    #[error("excessive reference chain happened via {type_name}")]
    ChainTooLong {
        /// Type being entered when the ceiling was hit.
        type_name: String,
    },
    /// The same reference identity was met twice on one path.
    #[error("encountered a circular reference via {type_name}")]
    CircularReference {
        /// Type whose identity repeated.
        type_name: String,
    },
    /// Panic or poisoned lock surfaced during traversal.
    #[error("unexpected failure during deep copy: {0}")]
    Unexpected(String),
    /// Rejected options.
    #[error("{0}")]
    InvalidOptions(String),
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
