//! Value-graph traversal and copy orchestration.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::conf::{N_BYTES_STACK_PER_GROW, N_BYTES_STACK_RED_ZONE};
use crate::report::{ReportDeepCopy, ReportDeepCopyBuilder};
use crate::spec::{DeepCopyError, SpecDeepCopyOptions, TypeCopyHook};
use crate::util::{TypeRefIdentity, calculate_worker_limit, describe_panic_payload};
use crate::value::{
    DeepValue, MapTable, SliceBacking, ValueArray, ValueField, ValueInterface, ValueMap,
    ValuePointer, ValueRecord, ValueSlice,
};

/// Traversal state owned by one top-level copy.
struct SpecCopyState<'a> {
    n_depth: usize,
    /// Identities on the current root-to-node path (past the threshold only).
    set_seen: HashSet<TypeRefIdentity>,
    spec_dc_options: &'a SpecDeepCopyOptions,
    dict_hooks: &'a HashMap<String, TypeCopyHook>,
    builder_dc_report: ReportDeepCopyBuilder,
}

impl<'a> SpecCopyState<'a> {
    fn new(
        spec_dc_options: &'a SpecDeepCopyOptions,
        dict_hooks: &'a HashMap<String, TypeCopyHook>,
    ) -> Self {
        Self {
            n_depth: 0,
            set_seen: HashSet::new(),
            spec_dc_options,
            dict_hooks,
            builder_dc_report: ReportDeepCopyBuilder::default(),
        }
    }

    fn enter(&mut self) {
        self.n_depth += 1;
        self.builder_dc_report.add_node(self.n_depth);
    }

    fn leave(&mut self) {
        self.n_depth -= 1;
    }

    /// Record the identity of a cycle-capable `value` on the current path once
    /// past the detection threshold. The returned identity must be released.
    fn track_identity(
        &mut self,
        value: &DeepValue,
    ) -> Result<Option<TypeRefIdentity>, DeepCopyError> {
        if self.n_depth <= self.spec_dc_options.depth_start_detecting_cycles
            || !value.category().is_cycle_tracked()
        {
            return Ok(None);
        }
        let Some(identity) = TypeRefIdentity::of_value(value) else {
            return Ok(None);
        };
        self.builder_dc_report.add_identity_check();
        if !self.set_seen.insert(identity) {
            return Err(DeepCopyError::CircularReference {
                type_name: value.type_name().to_string(),
            });
        }
        Ok(Some(identity))
    }

    fn release_identity(&mut self, identity_tracked: Option<TypeRefIdentity>) {
        if let Some(identity) = identity_tracked {
            self.set_seen.remove(&identity);
        }
    }
}

/// Deep copy `value` with default options and no registered hooks.
///
/// Shorthand for `DeepCopier::default().copy(value)`.
pub fn deep_copy(value: &DeepValue) -> Result<DeepValue, DeepCopyError> {
    DeepCopier::default().copy(value)
}

/// Configured deep copier.
///
/// Every value reachable from the root is reallocated except:
/// 1. hidden record members, which the copy holds at their zero value,
/// 2. funcs, channels and opaque resources, which are shared (beware of state
///    captured by a shared function),
/// 3. values whose type has a custom hook, which produce their own copy.
///
/// Circular graphs and over-long reference chains fail with
/// [`DeepCopyError::CircularReference`] / [`DeepCopyError::ChainTooLong`].
/// Two references to one target become two independent copies.
#[derive(Clone, Default)]
pub struct DeepCopier {
    spec_dc_options: SpecDeepCopyOptions,
    dict_hooks: HashMap<String, TypeCopyHook>,
}

impl fmt::Debug for DeepCopier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut l_hooks: Vec<&str> = self.dict_hooks.keys().map(String::as_str).collect();
        l_hooks.sort_unstable();
        f.debug_struct("DeepCopier")
            .field("spec_dc_options", &self.spec_dc_options)
            .field("hooks", &l_hooks)
            .finish()
    }
}

impl DeepCopier {
    /// Copier with validated options.
    pub fn new(spec_dc_options: SpecDeepCopyOptions) -> Result<Self, DeepCopyError> {
        spec_dc_options.validate()?;
        Ok(Self {
            spec_dc_options,
            dict_hooks: HashMap::new(),
        })
    }

    /// Register a custom copy for every node whose type name is `type_name`.
    ///
    /// The hook result is used verbatim and is not traversed further. A
    /// registered hook takes precedence over a value's own
    /// [`crate::CustomDeepCopy`] implementation.
    pub fn with_hook<F>(mut self, type_name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&DeepValue) -> DeepValue + Send + Sync + 'static,
    {
        self.dict_hooks.insert(type_name.into(), Arc::new(hook));
        self
    }

    pub fn options(&self) -> &SpecDeepCopyOptions {
        &self.spec_dc_options
    }

    /// Deep copy `value`. [`DeepValue::Nil`] yields `Nil`.
    pub fn copy(&self, value: &DeepValue) -> Result<DeepValue, DeepCopyError> {
        self.copy_with_report(value).map(|(value_copy, _)| value_copy)
    }

    /// Deep copy `value` and return the traversal counters.
    ///
    /// A panic raised during traversal (e.g. inside a hook) is caught here and
    /// returned as [`DeepCopyError::Unexpected`].
    pub fn copy_with_report(
        &self,
        value: &DeepValue,
    ) -> Result<(DeepValue, ReportDeepCopy), DeepCopyError> {
        if matches!(value, DeepValue::Nil) {
            return Ok((DeepValue::Nil, ReportDeepCopy::default()));
        }
        debug!(
            type_name = value.type_name(),
            category = %value.category(),
            "deep copy started"
        );

        let res_copy = panic::catch_unwind(AssertUnwindSafe(
            || -> Result<(DeepValue, ReportDeepCopy), DeepCopyError> {
                let mut state = SpecCopyState::new(&self.spec_dc_options, &self.dict_hooks);
                let value_copy = copy_recursive(value, &mut state)?;
                Ok((value_copy, state.builder_dc_report.build()))
            },
        ));

        match res_copy {
            Ok(Ok((value_copy, report))) => {
                debug!(%report, "deep copy finished");
                Ok((value_copy, report))
            }
            Ok(Err(e)) => {
                debug!(error = %e, "deep copy aborted");
                Err(e)
            }
            Err(payload) => {
                let msg = describe_panic_payload(payload.as_ref());
                warn!(panic = %msg, "deep copy panicked; converted to error");
                Err(DeepCopyError::Unexpected(msg))
            }
        }
    }

    /// Deep copy independent roots, in parallel when more than one worker is
    /// allowed. Results keep input order; each root fails on its own.
    pub fn copy_batch(&self, values: &[DeepValue]) -> Vec<Result<DeepValue, DeepCopyError>> {
        if values.is_empty() {
            return Vec::new();
        }

        let n_workers_max = calculate_worker_limit(self.spec_dc_options.num_workers_max);
        if n_workers_max <= 1 || values.len() == 1 {
            return values.iter().map(|value| self.copy(value)).collect();
        }

        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(n_workers_max)
            .build();
        let Ok(thread_pool) = thread_pool else {
            warn!(
                n_workers_max,
                "failed to initialize thread pool; fallback to serial copy"
            );
            return values.iter().map(|value| self.copy(value)).collect();
        };

        thread_pool.install(|| values.par_iter().map(|value| self.copy(value)).collect())
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region Traversal

/// Entered once per graph node; depth is released on every exit path.
///
/// Runs on a freshly allocated stack segment whenever the remaining stack
/// drops below the red zone, so the depth ceiling is reached on any thread.
fn copy_recursive(
    value: &DeepValue,
    state: &mut SpecCopyState<'_>,
) -> Result<DeepValue, DeepCopyError> {
    stacker::maybe_grow(N_BYTES_STACK_RED_ZONE, N_BYTES_STACK_PER_GROW, || {
        state.enter();
        let res_copy = copy_node(value, state);
        state.leave();
        res_copy
    })
}

fn copy_node(value: &DeepValue, state: &mut SpecCopyState<'_>) -> Result<DeepValue, DeepCopyError> {
    if state.n_depth > state.spec_dc_options.depth_max_reference_chain {
        return Err(DeepCopyError::ChainTooLong {
            type_name: value.type_name().to_string(),
        });
    }
    if let Some(value_hooked) = apply_copy_hook(value, state) {
        return Ok(value_hooked);
    }

    let identity_tracked = state.track_identity(value)?;
    let res_copy = copy_by_category(value, state);
    state.release_identity(identity_tracked);
    res_copy
}

fn copy_by_category(
    value: &DeepValue,
    state: &mut SpecCopyState<'_>,
) -> Result<DeepValue, DeepCopyError> {
    match value {
        DeepValue::Pointer(ptr) => copy_pointer(ptr, state),
        DeepValue::Interface(iface) => copy_interface(iface, state),
        DeepValue::Record(record) => copy_record(record, state),
        // Location stays shared.
        DeepValue::Timestamp(_) => Ok(value.clone()),
        DeepValue::Array(array) => copy_array(array, state),
        DeepValue::Slice(slice) => copy_slice(slice, state),
        DeepValue::Map(map) => copy_map(map, state),
        DeepValue::Func(_) | DeepValue::Chan(_) | DeepValue::Opaque(_) => {
            if !value.is_nil() {
                state.builder_dc_report.add_shared();
            }
            Ok(value.clone())
        }
        DeepValue::Custom(_)
        | DeepValue::Nil
        | DeepValue::Bool(_)
        | DeepValue::Int(_)
        | DeepValue::Uint(_)
        | DeepValue::Float(_)
        | DeepValue::Str(_) => Ok(value.clone()),
    }
}

fn apply_copy_hook(value: &DeepValue, state: &mut SpecCopyState<'_>) -> Option<DeepValue> {
    let dict_hooks = state.dict_hooks;
    let hook = if dict_hooks.is_empty() {
        None
    } else {
        dict_hooks.get(value.type_name())
    };
    if let Some(hook) = hook {
        state.builder_dc_report.add_hooked();
        return Some(hook(value));
    }

    let DeepValue::Custom(custom) = value else {
        return None;
    };
    let handle = custom.handle()?;
    state.builder_dc_report.add_hooked();
    Some(handle.deep_copy())
}

fn copy_pointer(
    ptr: &ValuePointer,
    state: &mut SpecCopyState<'_>,
) -> Result<DeepValue, DeepCopyError> {
    let Some(target) = ptr.target() else {
        return Ok(DeepValue::Pointer(ValuePointer::nil(ptr.type_name.clone())));
    };
    let value_target = snapshot_lock(target, ptr.type_name(), DeepValue::clone)?;
    let value_target_copy = copy_recursive(&value_target, state)?;
    state.builder_dc_report.add_allocated();
    Ok(DeepValue::Pointer(ValuePointer::new(
        ptr.type_name.clone(),
        value_target_copy,
    )))
}

fn copy_interface(
    iface: &ValueInterface,
    state: &mut SpecCopyState<'_>,
) -> Result<DeepValue, DeepCopyError> {
    let Some(inner) = iface.inner() else {
        return Ok(DeepValue::Interface(ValueInterface::nil(
            iface.type_name.clone(),
        )));
    };
    let inner_copy = copy_recursive(inner, state)?;
    Ok(DeepValue::Interface(ValueInterface::new(
        iface.type_name.clone(),
        inner_copy,
    )))
}

fn copy_record(
    record: &ValueRecord,
    state: &mut SpecCopyState<'_>,
) -> Result<DeepValue, DeepCopyError> {
    let mut l_fields = Vec::with_capacity(record.fields.len());
    for field in &record.fields {
        // Hidden members are never traversed.
        let value = if field.if_exported {
            copy_recursive(&field.value, state)?
        } else {
            state.builder_dc_report.add_hidden_field();
            field.value.zeroed()
        };
        l_fields.push(ValueField {
            name: field.name.clone(),
            if_exported: field.if_exported,
            value,
        });
    }
    Ok(DeepValue::Record(ValueRecord::new(
        record.type_name.clone(),
        l_fields,
    )))
}

fn copy_array(
    array: &ValueArray,
    state: &mut SpecCopyState<'_>,
) -> Result<DeepValue, DeepCopyError> {
    let l_elements = copy_elements(&array.elements, state)?;
    Ok(DeepValue::Array(ValueArray::new(
        array.type_name.clone(),
        l_elements,
    )))
}

fn copy_slice(
    slice: &ValueSlice,
    state: &mut SpecCopyState<'_>,
) -> Result<DeepValue, DeepCopyError> {
    let Some(backing) = slice.backing() else {
        return Ok(DeepValue::Slice(ValueSlice::nil(slice.type_name.clone())));
    };
    let (l_window, l_spare) = snapshot_window(backing, slice.type_name())?;
    let mut l_storage = copy_elements(&l_window, state)?;
    let n_len = l_storage.len();
    l_storage.extend(l_spare);
    state.builder_dc_report.add_allocated();
    Ok(DeepValue::Slice(ValueSlice::from_storage(
        slice.type_name.clone(),
        l_storage,
        n_len,
    )))
}

fn copy_map(map: &ValueMap, state: &mut SpecCopyState<'_>) -> Result<DeepValue, DeepCopyError> {
    let Some(table) = map.storage() else {
        return Ok(DeepValue::Map(ValueMap::nil(map.type_name.clone())));
    };
    let l_entries = snapshot_lock(table, map.type_name(), MapTable::entries)?;
    let map_copy = copy_entries(map, &l_entries, state)?;
    state.builder_dc_report.add_allocated();
    Ok(DeepValue::Map(map_copy))
}

fn copy_entries(
    map: &ValueMap,
    l_entries: &[(DeepValue, DeepValue)],
    state: &mut SpecCopyState<'_>,
) -> Result<ValueMap, DeepCopyError> {
    let mut map_copy = ValueMap::with_capacity(map.type_name.clone(), l_entries.len());
    for (key, value) in l_entries {
        let value_copy = copy_recursive(value, state)?;
        let key_copy = copy_recursive(key, state)?;
        map_copy.insert(key_copy, value_copy);
    }
    Ok(map_copy)
}

fn copy_elements(
    l_elements: &[DeepValue],
    state: &mut SpecCopyState<'_>,
) -> Result<Vec<DeepValue>, DeepCopyError> {
    let mut l_copies = Vec::with_capacity(l_elements.len());
    for element in l_elements {
        l_copies.push(copy_recursive(element, state)?);
    }
    Ok(l_copies)
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region StorageSnapshots
//
// Storage is read-locked only long enough to clone the node's immediate
// contents; no lock is held across recursion.

fn poisoned_lock_error(type_name: &str) -> DeepCopyError {
    DeepCopyError::Unexpected(format!("poisoned storage lock via {type_name}"))
}

fn snapshot_lock<T, R>(
    lock: &RwLock<T>,
    type_name: &str,
    snapshot: impl FnOnce(&T) -> R,
) -> Result<R, DeepCopyError> {
    lock.read()
        .map(|guard| snapshot(&guard))
        .map_err(|_| poisoned_lock_error(type_name))
}

/// Visible window plus zero-filled spare capacity of a slice.
fn snapshot_window(
    backing: &SliceBacking,
    type_name: &str,
) -> Result<(Vec<DeepValue>, Vec<DeepValue>), DeepCopyError> {
    let l_storage = backing
        .storage
        .read()
        .map_err(|_| poisoned_lock_error(type_name))?;
    let n_start = backing.n_offset;
    let n_mid = n_start + backing.n_len;
    let n_end = n_start + backing.n_cap;
    let (Some(l_window), Some(l_spare)) =
        (l_storage.get(n_start..n_mid), l_storage.get(n_mid..n_end))
    else {
        return Err(DeepCopyError::Unexpected(format!(
            "slice window out of bounds via {type_name}"
        )));
    };
    Ok((
        l_window.to_vec(),
        l_spare.iter().map(DeepValue::zeroed).collect(),
    ))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::{FixedOffset, TimeZone, Utc};
    use proptest::prelude::*;

    use super::{DeepCopier, SpecCopyState, copy_recursive, deep_copy};
    use crate::spec::{DeepCopyError, SpecDeepCopyOptions};
    use crate::value::{
        CustomDeepCopy, DeepValue, ValueArray, ValueChan, ValueCustom, ValueField, ValueFunc,
        ValueInterface, ValueLocation, ValueMap, ValueOpaque, ValuePointer, ValueRecord,
        ValueSlice, ValueTimestamp,
    };

    fn copier_with(
        depth_start_detecting_cycles: usize,
        depth_max_reference_chain: usize,
    ) -> DeepCopier {
        DeepCopier::new(SpecDeepCopyOptions {
            depth_start_detecting_cycles,
            depth_max_reference_chain,
            ..SpecDeepCopyOptions::default()
        })
        .expect("valid options")
    }

    /// `n_pointers` nested pointers around an int leaf: `n_pointers + 1` nodes.
    fn build_pointer_chain(n_pointers: usize) -> DeepValue {
        let mut value = DeepValue::Int(7);
        for _ in 0..n_pointers {
            value = DeepValue::Pointer(ValuePointer::new("*Link", value));
        }
        value
    }

    /// `Node { Next: *Node }` whose pointer targets the node itself.
    fn build_self_referential_node() -> DeepValue {
        let ptr_node = ValuePointer::new("*Node", DeepValue::Nil);
        ptr_node.set(DeepValue::Record(ValueRecord::new(
            "Node",
            vec![ValueField::exported(
                "Next",
                DeepValue::Pointer(ptr_node.clone()),
            )],
        )));
        DeepValue::Pointer(ptr_node)
    }

    fn field<'a>(value: &'a DeepValue, name: &str) -> &'a DeepValue {
        value
            .as_record()
            .and_then(|record| record.field(name))
            .expect("record field")
    }

    #[derive(Debug)]
    struct HandleScores {
        scores: Mutex<Vec<i64>>,
    }

    impl CustomDeepCopy for HandleScores {
        fn type_name(&self) -> &str {
            "Scores"
        }

        fn deep_copy(&self) -> DeepValue {
            let l_scores = self.scores.lock().expect("scores").clone();
            DeepValue::Custom(ValueCustom::new(Arc::new(HandleScores {
                scores: Mutex::new(l_scores),
            })))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn copy_nil_returns_nil() {
        assert_eq!(deep_copy(&DeepValue::Nil).expect("copy"), DeepValue::Nil);
    }

    #[test]
    fn copy_primitives_by_value() {
        for value in [
            DeepValue::Bool(true),
            DeepValue::Int(-3),
            DeepValue::Uint(3),
            DeepValue::Float(1.5),
            DeepValue::Str("text".to_string()),
        ] {
            assert_eq!(deep_copy(&value).expect("copy"), value);
        }
    }

    #[test]
    fn copy_record_is_independent() {
        let ptr_score = ValuePointer::new("*int64", DeepValue::Int(10));
        let value = DeepValue::Record(ValueRecord::new(
            "Player",
            vec![
                ValueField::exported("Name", DeepValue::Str("ann".to_string())),
                ValueField::exported("Score", DeepValue::Pointer(ptr_score.clone())),
            ],
        ));

        let mut value_copy = deep_copy(&value).expect("copy");
        assert_eq!(value_copy, value);

        let ptr_copy = field(&value_copy, "Score")
            .as_pointer()
            .expect("pointer")
            .clone();
        assert!(!ptr_copy.ptr_eq(&ptr_score));

        ptr_copy.set(DeepValue::Int(99));
        assert_eq!(ptr_score.get(), Some(DeepValue::Int(10)));
        ptr_score.set(DeepValue::Int(5));
        assert_eq!(ptr_copy.get(), Some(DeepValue::Int(99)));

        if let Some(name) = value_copy
            .as_record_mut()
            .and_then(|record| record.field_mut("Name"))
        {
            *name = DeepValue::Str("bob".to_string());
        }
        assert_eq!(field(&value, "Name"), &DeepValue::Str("ann".to_string()));
    }

    #[test]
    fn copy_hidden_fields_hold_zero_values() {
        let value = DeepValue::Record(ValueRecord::new(
            "Account",
            vec![
                ValueField::exported("Owner", DeepValue::Str("ann".to_string())),
                ValueField::hidden("balance", DeepValue::Int(42)),
                // Cyclic, but never traversed.
                ValueField::hidden("cache", build_self_referential_node()),
            ],
        ));

        let (value_copy, report) = DeepCopier::default()
            .copy_with_report(&value)
            .expect("copy");
        assert_eq!(field(&value_copy, "Owner"), &DeepValue::Str("ann".to_string()));
        assert_eq!(field(&value_copy, "balance"), &DeepValue::Int(0));
        assert!(field(&value_copy, "cache").is_nil());
        assert_eq!(report.cnt_hidden_fields, 2);
    }

    #[test]
    fn copy_preserves_unallocated_state() {
        let value = DeepValue::Record(ValueRecord::new(
            "Holder",
            vec![
                ValueField::exported("NilSlice", DeepValue::Slice(ValueSlice::nil("[]int64"))),
                ValueField::exported(
                    "EmptySlice",
                    DeepValue::Slice(ValueSlice::from_vec("[]int64", vec![])),
                ),
                ValueField::exported("NilMap", DeepValue::Map(ValueMap::nil("map[string]int64"))),
                ValueField::exported("NilPtr", DeepValue::Pointer(ValuePointer::nil("*int64"))),
                ValueField::exported("NilAny", DeepValue::Interface(ValueInterface::nil("any"))),
            ],
        ));

        let value_copy = deep_copy(&value).expect("copy");
        assert!(field(&value_copy, "NilSlice").is_nil());
        assert!(field(&value_copy, "NilMap").is_nil());
        assert!(field(&value_copy, "NilPtr").is_nil());
        assert!(field(&value_copy, "NilAny").is_nil());

        let slice_empty = field(&value_copy, "EmptySlice");
        assert!(!slice_empty.is_nil());
        assert!(slice_empty.as_slice().expect("slice").is_empty());
        assert_eq!(value_copy, value);
    }

    #[test]
    fn copy_shares_opaque_values() {
        let n_calls = Arc::new(AtomicUsize::new(0));
        let n_calls_captured = n_calls.clone();
        let func = ValueFunc::new("func()", move |_| {
            n_calls_captured.fetch_add(1, Ordering::SeqCst);
            DeepValue::Nil
        });
        let chan = ValueChan::new("chan int64");
        let opaque = ValueOpaque::new("*os.File", Arc::new(String::from("fd:3")));
        let value = DeepValue::Record(ValueRecord::new(
            "Worker",
            vec![
                ValueField::exported("Run", DeepValue::Func(func.clone())),
                ValueField::exported("Jobs", DeepValue::Chan(chan.clone())),
                ValueField::exported("File", DeepValue::Opaque(opaque.clone())),
            ],
        ));

        let (value_copy, report) = DeepCopier::default()
            .copy_with_report(&value)
            .expect("copy");
        assert_eq!(report.cnt_shared, 3);

        let DeepValue::Func(func_copy) = field(&value_copy, "Run") else {
            panic!("expected func");
        };
        assert!(func_copy.ptr_eq(&func));
        func_copy.call(&[]);
        assert_eq!(n_calls.load(Ordering::SeqCst), 1);

        let DeepValue::Chan(chan_copy) = field(&value_copy, "Jobs") else {
            panic!("expected chan");
        };
        assert!(chan_copy.ptr_eq(&chan));
        chan_copy
            .channel()
            .expect("channel")
            .send(DeepValue::Int(1));
        assert_eq!(
            chan.channel().expect("channel").try_recv(),
            Some(DeepValue::Int(1))
        );

        let DeepValue::Opaque(opaque_copy) = field(&value_copy, "File") else {
            panic!("expected opaque");
        };
        assert!(opaque_copy.ptr_eq(&opaque));
        assert_eq!(
            opaque_copy.downcast_ref::<String>().map(String::as_str),
            Some("fd:3")
        );
    }

    #[test]
    fn copy_interface_and_array_are_independent() {
        let ptr_inner = ValuePointer::new("*int64", DeepValue::Int(1));
        let value = DeepValue::Array(ValueArray::new(
            "[2]any",
            vec![
                DeepValue::Interface(ValueInterface::new(
                    "any",
                    DeepValue::Pointer(ptr_inner.clone()),
                )),
                DeepValue::Interface(ValueInterface::nil("any")),
            ],
        ));

        let value_copy = deep_copy(&value).expect("copy");
        assert_eq!(value_copy, value);

        let DeepValue::Array(array_copy) = &value_copy else {
            panic!("expected array");
        };
        assert_eq!(array_copy.len(), 2);
        let ptr_copy = array_copy.elements[0]
            .as_interface()
            .and_then(ValueInterface::inner)
            .and_then(DeepValue::as_pointer)
            .expect("pointer in interface");
        assert!(!ptr_copy.ptr_eq(&ptr_inner));
        ptr_copy.set(DeepValue::Int(2));
        assert_eq!(ptr_inner.get(), Some(DeepValue::Int(1)));
        assert!(array_copy.elements[1].is_nil());
    }

    #[test]
    fn copy_slice_keeps_length_and_capacity_but_not_aliasing() {
        let slice_all = ValueSlice::with_capacity(
            "[]int64",
            vec![DeepValue::Int(1), DeepValue::Int(2)],
            4,
            DeepValue::Int(0),
        );
        let slice_head = slice_all.subslice(0, 1).expect("subslice");
        let value = DeepValue::Record(ValueRecord::new(
            "Pair",
            vec![
                ValueField::exported("All", DeepValue::Slice(slice_all.clone())),
                ValueField::exported("Head", DeepValue::Slice(slice_head)),
            ],
        ));

        let value_copy = deep_copy(&value).expect("copy");
        let all_copy = field(&value_copy, "All").as_slice().expect("slice");
        let head_copy = field(&value_copy, "Head").as_slice().expect("slice");

        assert_eq!(all_copy.len(), 2);
        assert_eq!(all_copy.cap(), 4);
        assert_eq!(head_copy.len(), 1);
        assert_eq!(head_copy.cap(), 4);
        assert!(!all_copy.shares_storage(&slice_all));
        assert!(!all_copy.shares_storage(head_copy));

        all_copy.set(0, DeepValue::Int(9));
        assert_eq!(slice_all.get(0), Some(DeepValue::Int(1)));
    }

    #[test]
    fn copy_map_keys_are_deep_copied() {
        let ptr_key = ValuePointer::new("*Key", DeepValue::Str("alpha".to_string()));
        let map = ValueMap::from_entries(
            "map[*Key]int64",
            vec![(DeepValue::Pointer(ptr_key.clone()), DeepValue::Int(1))],
        );

        let value_copy = deep_copy(&DeepValue::Map(map.clone())).expect("copy");
        let map_copy = value_copy.as_map().expect("map");
        assert!(!map_copy.shares_storage(&map));

        let l_keys = map_copy.keys();
        assert_eq!(l_keys.len(), 1);
        let ptr_key_copy = l_keys[0].as_pointer().expect("pointer key");
        assert!(!ptr_key_copy.ptr_eq(&ptr_key));
        assert_eq!(ptr_key_copy.get(), Some(DeepValue::Str("alpha".to_string())));
        assert_eq!(map_copy.get(&l_keys[0]), Some(DeepValue::Int(1)));
        assert!(map_copy.get(&DeepValue::Pointer(ptr_key.clone())).is_none());

        ptr_key_copy.set(DeepValue::Str("beta".to_string()));
        assert_eq!(ptr_key.get(), Some(DeepValue::Str("alpha".to_string())));
    }

    #[test]
    fn copy_large_map_keeps_every_entry() {
        let n_entries: i64 = 20_000;
        let map = ValueMap::from_entries(
            "map[int64]int64",
            (0..n_entries).map(|n| (DeepValue::Int(n), DeepValue::Int(n + 1))),
        );

        let value_copy = deep_copy(&DeepValue::Map(map)).expect("copy");
        let map_copy = value_copy.as_map().expect("map");
        assert_eq!(map_copy.len(), 20_000);
        assert_eq!(map_copy.get(&DeepValue::Int(0)), Some(DeepValue::Int(1)));
        assert_eq!(
            map_copy.get(&DeepValue::Int(n_entries - 1)),
            Some(DeepValue::Int(n_entries))
        );
    }

    #[test]
    fn copy_map_value_keys_stay_usable_for_lookup() {
        let key = DeepValue::Record(ValueRecord::new(
            "Point",
            vec![
                ValueField::exported("X", DeepValue::Int(1)),
                ValueField::exported("Y", DeepValue::Int(2)),
            ],
        ));
        let map = ValueMap::from_entries(
            "map[Point]string",
            vec![(key.clone(), DeepValue::Str("a".to_string()))],
        );

        let value_copy = deep_copy(&DeepValue::Map(map)).expect("copy");
        assert_eq!(
            value_copy.as_map().expect("map").get(&key),
            Some(DeepValue::Str("a".to_string()))
        );
    }

    #[test]
    fn copy_timestamp_shares_location() {
        let location = Arc::new(ValueLocation::new(
            "JST",
            FixedOffset::east_opt(9 * 3600).expect("offset"),
        ));
        let instant = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let value = DeepValue::Record(ValueRecord::new(
            "Event",
            vec![ValueField::exported(
                "At",
                DeepValue::Timestamp(ValueTimestamp::new(instant, Some(location.clone()))),
            )],
        ));

        let value_copy = deep_copy(&value).expect("copy");
        let DeepValue::Timestamp(ts_copy) = field(&value_copy, "At") else {
            panic!("expected timestamp");
        };
        assert_eq!(ts_copy.instant, instant);
        assert!(Arc::ptr_eq(ts_copy.location().expect("location"), &location));
    }

    #[test]
    fn copy_rejects_self_referential_pointer() {
        let err = deep_copy(&build_self_referential_node()).expect_err("cycle must fail");
        assert_eq!(
            err,
            DeepCopyError::CircularReference {
                type_name: "*Node".to_string()
            }
        );
    }

    #[test]
    fn copy_rejects_self_containing_slice() {
        let slice = ValueSlice::from_vec("[]any", vec![DeepValue::Nil]);
        slice.set(
            0,
            DeepValue::Interface(ValueInterface::new("any", DeepValue::Slice(slice.clone()))),
        );
        let err = deep_copy(&DeepValue::Slice(slice)).expect_err("cycle must fail");
        assert_eq!(
            err,
            DeepCopyError::CircularReference {
                type_name: "[]any".to_string()
            }
        );
    }

    #[test]
    fn copy_rejects_self_containing_map() {
        let mut map = ValueMap::new("map[string]any");
        let map_alias = map.clone();
        map.insert(
            DeepValue::Str("self".to_string()),
            DeepValue::Interface(ValueInterface::new("any", DeepValue::Map(map_alias))),
        );
        let err = deep_copy(&DeepValue::Map(map)).expect_err("cycle must fail");
        assert_eq!(
            err,
            DeepCopyError::CircularReference {
                type_name: "map[string]any".to_string()
            }
        );
    }

    #[test]
    fn copy_cycle_below_threshold_hits_ceiling() {
        let deep_copier = copier_with(100, 20);
        let err = deep_copier
            .copy(&build_self_referential_node())
            .expect_err("cycle must fail");
        assert!(matches!(err, DeepCopyError::ChainTooLong { .. }));
    }

    #[test]
    fn copy_zero_threshold_detects_cycle_immediately() {
        let deep_copier = copier_with(0, 1500);
        let err = deep_copier
            .copy(&build_self_referential_node())
            .expect_err("cycle must fail");
        assert!(matches!(err, DeepCopyError::CircularReference { .. }));
    }

    #[test]
    fn copy_depth_ceiling_is_inclusive() {
        let deep_copier = copier_with(1000, 10);
        let value_at_ceiling = build_pointer_chain(9);
        assert_eq!(
            deep_copier.copy(&value_at_ceiling).expect("copy at ceiling"),
            value_at_ceiling
        );

        let err = deep_copier
            .copy(&build_pointer_chain(10))
            .expect_err("one past ceiling must fail");
        assert_eq!(
            err,
            DeepCopyError::ChainTooLong {
                type_name: "int64".to_string()
            }
        );
    }

    #[test]
    fn copy_default_ceiling_allows_long_acyclic_chain() {
        let value_at_ceiling = build_pointer_chain(1499);
        let res_ok = deep_copy(&value_at_ceiling).map(|_| ());
        assert!(res_ok.is_ok());

        let res_err = deep_copy(&build_pointer_chain(1500)).map(|_| ());
        assert!(matches!(res_err, Err(DeepCopyError::ChainTooLong { .. })));
    }

    #[test]
    fn copy_grows_stack_for_raised_ceiling() {
        let deep_copier = copier_with(20_000, 20_000);
        let value = build_pointer_chain(19_999);

        let (value_copy, report) = deep_copier.copy_with_report(&value).expect("copy");
        assert_eq!(report.n_depth_max, 20_000);
        assert_eq!(report.cnt_allocated, 19_999);

        // Recursive drop of chains this long would exhaust the test thread.
        std::mem::forget(value_copy);
        std::mem::forget(value);
    }

    #[test]
    fn copy_sibling_references_are_not_cycles() {
        let ptr_shared = ValuePointer::new("*int64", DeepValue::Int(3));
        let value = DeepValue::Record(ValueRecord::new(
            "Diamond",
            vec![
                ValueField::exported("Left", DeepValue::Pointer(ptr_shared.clone())),
                ValueField::exported("Right", DeepValue::Pointer(ptr_shared.clone())),
            ],
        ));

        let (value_copy, report) = copier_with(0, 1500)
            .copy_with_report(&value)
            .expect("diamond is acyclic");
        assert_eq!(report.cnt_identity_checks, 2);

        let ptr_left = field(&value_copy, "Left").as_pointer().expect("pointer");
        let ptr_right = field(&value_copy, "Right").as_pointer().expect("pointer");
        assert!(!ptr_left.ptr_eq(ptr_right));
        assert!(!ptr_left.ptr_eq(&ptr_shared));
    }

    #[test]
    fn traversal_state_is_released_after_failure() {
        let spec_dc_options = SpecDeepCopyOptions {
            depth_start_detecting_cycles: 0,
            ..SpecDeepCopyOptions::default()
        };
        let dict_hooks = HashMap::new();
        let mut state = SpecCopyState::new(&spec_dc_options, &dict_hooks);

        let err = copy_recursive(&build_self_referential_node(), &mut state)
            .expect_err("cycle must fail");
        assert!(matches!(err, DeepCopyError::CircularReference { .. }));
        assert_eq!(state.n_depth, 0);
        assert!(state.set_seen.is_empty());
    }

    #[test]
    fn registered_hook_result_is_used_verbatim() {
        let ptr_shared = ValuePointer::new("*int64", DeepValue::Int(1));
        let value = DeepValue::Record(ValueRecord::new(
            "Config",
            vec![ValueField::exported("Limit", DeepValue::Pointer(ptr_shared.clone()))],
        ));
        let deep_copier = DeepCopier::default().with_hook("Config", |value| value.clone());

        let (value_copy, report) = deep_copier.copy_with_report(&value).expect("copy");
        assert_eq!(report.cnt_hooked, 1);
        let ptr_copy = field(&value_copy, "Limit").as_pointer().expect("pointer");
        assert!(ptr_copy.ptr_eq(&ptr_shared));
    }

    #[test]
    fn custom_handle_copies_hidden_state() {
        let handle = Arc::new(HandleScores {
            scores: Mutex::new(vec![1, 2]),
        });
        let value = DeepValue::Custom(ValueCustom::new(handle.clone()));

        let value_copy = deep_copy(&value).expect("copy");
        let DeepValue::Custom(custom_copy) = &value_copy else {
            panic!("expected custom");
        };
        let handle_copy = custom_copy
            .downcast_ref::<HandleScores>()
            .expect("scores handle");

        handle.scores.lock().expect("scores").push(3);
        assert_eq!(*handle_copy.scores.lock().expect("scores"), vec![1, 2]);
    }

    #[test]
    fn registered_hook_wins_over_custom_handle() {
        let value = DeepValue::Custom(ValueCustom::new(Arc::new(HandleScores {
            scores: Mutex::new(vec![]),
        })));
        let deep_copier =
            DeepCopier::default().with_hook("Scores", |_| DeepValue::Str("replaced".to_string()));

        assert_eq!(
            deep_copier.copy(&value).expect("copy"),
            DeepValue::Str("replaced".to_string())
        );
    }

    #[test]
    fn panicking_hook_becomes_unexpected_error() {
        let value = DeepValue::Record(ValueRecord::new("Boom", vec![]));
        let deep_copier = DeepCopier::default()
            .with_hook("Boom", |_: &DeepValue| -> DeepValue { panic!("hook exploded") });

        let err = deep_copier.copy(&value).expect_err("panic must be converted");
        assert_eq!(err, DeepCopyError::Unexpected("hook exploded".to_string()));
    }

    #[test]
    fn poisoned_storage_becomes_unexpected_error() {
        let ptr_poisoned = ValuePointer::new("*int64", DeepValue::Int(1));
        let target = ptr_poisoned.target().expect("target").clone();
        let _ = std::thread::spawn(move || {
            let _guard = target.write().expect("write lock");
            panic!("poison the lock");
        })
        .join();

        let err = deep_copy(&DeepValue::Pointer(ptr_poisoned)).expect_err("poisoned lock");
        assert!(matches!(err, DeepCopyError::Unexpected(_)));
    }

    #[test]
    fn copy_report_counts_nodes() {
        let value = DeepValue::Record(ValueRecord::new(
            "Sample",
            vec![
                ValueField::exported("A", DeepValue::Int(1)),
                ValueField::hidden("b", DeepValue::Int(2)),
                ValueField::exported(
                    "P",
                    DeepValue::Pointer(ValuePointer::new("*int64", DeepValue::Int(3))),
                ),
                ValueField::exported(
                    "S",
                    DeepValue::Slice(ValueSlice::from_vec(
                        "[]int64",
                        vec![DeepValue::Int(4), DeepValue::Int(5)],
                    )),
                ),
            ],
        ));

        let (_, report) = DeepCopier::default()
            .copy_with_report(&value)
            .expect("copy");
        assert_eq!(report.cnt_nodes, 7);
        assert_eq!(report.cnt_allocated, 2);
        assert_eq!(report.cnt_hidden_fields, 1);
        assert_eq!(report.cnt_identity_checks, 0);
        assert_eq!(report.n_depth_max, 3);
    }

    #[test]
    fn copier_rejects_invalid_options() {
        let err = DeepCopier::new(SpecDeepCopyOptions {
            depth_max_reference_chain: 0,
            ..SpecDeepCopyOptions::default()
        })
        .expect_err("zero ceiling must fail");
        assert!(matches!(err, DeepCopyError::InvalidOptions(_)));
    }

    #[test]
    fn copy_batch_keeps_order_and_isolates_failures() {
        let l_values = vec![
            DeepValue::Int(1),
            build_self_referential_node(),
            DeepValue::Pointer(ValuePointer::new("*string", DeepValue::Str("x".to_string()))),
        ];

        for num_workers_max in [Some(1), Some(4)] {
            let deep_copier = DeepCopier::new(SpecDeepCopyOptions {
                depth_start_detecting_cycles: 10,
                depth_max_reference_chain: 50,
                num_workers_max,
            })
            .expect("valid options");

            let l_results = deep_copier.copy_batch(&l_values);
            assert_eq!(l_results.len(), 3);
            assert_eq!(l_results[0], Ok(DeepValue::Int(1)));
            assert!(matches!(
                l_results[1],
                Err(DeepCopyError::CircularReference { .. })
            ));
            assert_eq!(l_results[2].as_ref().expect("copy"), &l_values[2]);
        }

        assert!(DeepCopier::default().copy_batch(&[]).is_empty());
    }

    fn arb_deep_value() -> impl Strategy<Value = DeepValue> {
        let leaf = prop_oneof![
            Just(DeepValue::Nil),
            any::<bool>().prop_map(DeepValue::Bool),
            any::<i64>().prop_map(DeepValue::Int),
            (-1.0e6f64..1.0e6).prop_map(DeepValue::Float),
            "[a-z]{0,6}".prop_map(DeepValue::Str),
        ];
        leaf.prop_recursive(4, 48, 4, |inner| {
            prop_oneof![
                inner
                    .clone()
                    .prop_map(|v| DeepValue::Pointer(ValuePointer::new("*any", v))),
                inner
                    .clone()
                    .prop_map(|v| DeepValue::Interface(ValueInterface::new("any", v))),
                prop::collection::vec(inner.clone(), 0..4)
                    .prop_map(|l| DeepValue::Slice(ValueSlice::from_vec("[]any", l))),
                prop::collection::vec(inner.clone(), 0..4)
                    .prop_map(|l| DeepValue::Array(ValueArray::new("[N]any", l))),
                prop::collection::vec(("[a-z]{1,4}", inner.clone()), 0..4).prop_map(|l| {
                    DeepValue::Map(ValueMap::from_entries(
                        "map[string]any",
                        l.into_iter().map(|(k, v)| (DeepValue::Str(k), v)),
                    ))
                }),
                prop::collection::vec(inner, 0..4).prop_map(|l| {
                    DeepValue::Record(ValueRecord::new(
                        "Rec",
                        l.into_iter()
                            .enumerate()
                            .map(|(i, v)| ValueField::exported(format!("F{i}"), v))
                            .collect(),
                    ))
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn copy_of_acyclic_graph_is_equal_and_detached(value in arb_deep_value()) {
            let value_copy = deep_copy(&value).expect("acyclic copy");
            prop_assert_eq!(&value_copy, &value);

            match (&value, &value_copy) {
                (DeepValue::Pointer(a), DeepValue::Pointer(b)) if !a.is_nil() => {
                    prop_assert!(!a.ptr_eq(b));
                }
                (DeepValue::Slice(a), DeepValue::Slice(b)) => {
                    prop_assert!(!a.shares_storage(b));
                }
                (DeepValue::Map(a), DeepValue::Map(b)) => {
                    prop_assert!(!a.shares_storage(b));
                }
                _ => {}
            }
        }
    }
}
