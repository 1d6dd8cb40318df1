use std::any::Any;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use crate::conf::N_WORKERS_DEFAULT_MAX;
use crate::value::{DeepValue, MapTable, SliceBacking, TypeSharedCell};

////////////////////////////////////////////////////////////////////////////////
// #region ReferenceIdentity

/// Identity of a reference-like node on the current traversal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TypeRefIdentity {
    /// Address of a pointer target.
    Pointer(usize),
    /// Backing storage address plus the window; two views of the same
    /// storage with different lengths are different nodes.
    Slice {
        addr_storage: usize,
        n_offset: usize,
        n_len: usize,
    },
    /// Address of map entry storage.
    Map(usize),
}

impl TypeRefIdentity {
    pub(crate) fn of_pointer(target: &TypeSharedCell<DeepValue>) -> Self {
        Self::Pointer(Arc::as_ptr(target) as usize)
    }

    pub(crate) fn of_slice(backing: &SliceBacking) -> Self {
        Self::Slice {
            addr_storage: Arc::as_ptr(&backing.storage) as usize,
            n_offset: backing.n_offset,
            n_len: backing.n_len,
        }
    }

    pub(crate) fn of_map(table: &TypeSharedCell<MapTable>) -> Self {
        Self::Map(Arc::as_ptr(table) as usize)
    }

    /// Identity of an allocated pointer, slice or map; `None` otherwise.
    pub(crate) fn of_value(value: &DeepValue) -> Option<Self> {
        match value {
            DeepValue::Pointer(ptr) => ptr.target().map(Self::of_pointer),
            DeepValue::Slice(slice) => slice.backing().map(Self::of_slice),
            DeepValue::Map(map) => map.storage().map(Self::of_map),
            _ => None,
        }
    }
}

/// Address of the shared allocation, `0` when absent.
fn addr_of<T: ?Sized>(a: Option<&Arc<T>>) -> usize {
    a.map_or(0, |a| Arc::as_ptr(a) as *const () as usize)
}

/// Both `None`, or both pointing at the same allocation.
pub(crate) fn is_same_allocation<T: ?Sized>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
        _ => false,
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region KeyEquality

/// Comparable-value equality used for map keys.
///
/// Primitives, records (every member, hidden ones included), arrays,
/// interfaces and timestamps compare by value; pointers, channels, funcs,
/// resources and custom handles by identity. Slices and maps are never equal.
pub(crate) fn is_key_equal(a: &DeepValue, b: &DeepValue) -> bool {
    match (a, b) {
        (DeepValue::Nil, DeepValue::Nil) => true,
        (DeepValue::Bool(x), DeepValue::Bool(y)) => x == y,
        (DeepValue::Int(x), DeepValue::Int(y)) => x == y,
        (DeepValue::Uint(x), DeepValue::Uint(y)) => x == y,
        (DeepValue::Float(x), DeepValue::Float(y)) => x == y,
        (DeepValue::Str(x), DeepValue::Str(y)) => x == y,
        (DeepValue::Record(x), DeepValue::Record(y)) => {
            x.type_name == y.type_name
                && x.fields.len() == y.fields.len()
                && x.fields
                    .iter()
                    .zip(&y.fields)
                    .all(|(f, g)| f.name == g.name && is_key_equal(&f.value, &g.value))
        }
        (DeepValue::Array(x), DeepValue::Array(y)) => {
            x.type_name == y.type_name
                && x.elements.len() == y.elements.len()
                && x.elements
                    .iter()
                    .zip(&y.elements)
                    .all(|(p, q)| is_key_equal(p, q))
        }
        (DeepValue::Interface(x), DeepValue::Interface(y)) => match (x.inner(), y.inner()) {
            (None, None) => true,
            (Some(p), Some(q)) => is_key_equal(p, q),
            _ => false,
        },
        (DeepValue::Pointer(x), DeepValue::Pointer(y)) => {
            x.type_name == y.type_name && x.ptr_eq(y)
        }
        (DeepValue::Func(x), DeepValue::Func(y)) => x.ptr_eq(y),
        (DeepValue::Chan(x), DeepValue::Chan(y)) => x.ptr_eq(y),
        (DeepValue::Opaque(x), DeepValue::Opaque(y)) => x.ptr_eq(y),
        (DeepValue::Custom(x), DeepValue::Custom(y)) => x.ptr_eq(y),
        (DeepValue::Timestamp(x), DeepValue::Timestamp(y)) => {
            x.instant == y.instant && is_same_allocation(x.location(), y.location())
        }
        _ => false,
    }
}

/// Hash digest consistent with [`is_key_equal`]: keys that are equal always
/// share a digest.
pub(crate) fn digest_key(key: &DeepValue) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_key(key, &mut hasher);
    hasher.finish()
}

fn hash_key<H: Hasher>(key: &DeepValue, state: &mut H) {
    std::mem::discriminant(key).hash(state);
    match key {
        DeepValue::Nil => {}
        DeepValue::Bool(v) => v.hash(state),
        DeepValue::Int(v) => v.hash(state),
        DeepValue::Uint(v) => v.hash(state),
        // -0.0 == 0.0; NaN never matches anything.
        DeepValue::Float(v) => {
            let v = if *v == 0.0 { 0.0_f64 } else { *v };
            v.to_bits().hash(state);
        }
        DeepValue::Str(v) => v.hash(state),
        DeepValue::Record(v) => {
            v.type_name.hash(state);
            for field in &v.fields {
                field.name.hash(state);
                hash_key(&field.value, state);
            }
        }
        DeepValue::Array(v) => {
            v.type_name.hash(state);
            for element in &v.elements {
                hash_key(element, state);
            }
        }
        DeepValue::Interface(v) => {
            if let Some(inner) = v.inner() {
                hash_key(inner, state);
            }
        }
        DeepValue::Pointer(v) => {
            v.type_name.hash(state);
            addr_of(v.target()).hash(state);
        }
        DeepValue::Func(v) => addr_of(v.func.as_ref()).hash(state),
        DeepValue::Chan(v) => addr_of(v.chan.as_ref()).hash(state),
        DeepValue::Opaque(v) => addr_of(v.handle.as_ref()).hash(state),
        DeepValue::Custom(v) => addr_of(v.handle.as_ref()).hash(state),
        DeepValue::Timestamp(v) => {
            v.instant.hash(state);
            addr_of(v.location()).hash(state);
        }
        // Never equal as keys.
        DeepValue::Slice(_) | DeepValue::Map(_) => {}
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Runtime

pub(crate) fn calculate_worker_limit(num_workers_max: Option<usize>) -> usize {
    let n_cpu = std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(1);

    match num_workers_max {
        Some(n) => n.clamp(1, n_cpu),
        None => n_cpu.clamp(1, N_WORKERS_DEFAULT_MAX),
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn describe_panic_payload(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
