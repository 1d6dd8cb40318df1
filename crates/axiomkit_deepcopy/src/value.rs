//! Type-erased runtime value model walked by the copier.
//!
//! Every value that can be deep-copied is expressed as a [`DeepValue`]. The
//! variants form a closed set of structural shapes; each shape carries the
//! metadata the copier needs to recurse without knowing the concrete type
//! (type name, field list and visibility, element storage, entries).
//!
//! Reference-like shapes ([`ValuePointer`], [`ValueSlice`], [`ValueMap`])
//! hold their storage behind `Arc<RwLock<_>>`, so graphs may alias and may be
//! cyclic. Cloning a reference-like shape clones the header, not the storage.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::spec::EnumValueCategory;
use crate::util::{digest_key, is_key_equal, is_same_allocation};

/// Shared, lockable storage cell used by reference-like shapes.
pub type TypeSharedCell<T> = Arc<RwLock<T>>;
/// Entry storage of a [`ValueMap`].
pub type TypeMapEntries = Vec<(DeepValue, DeepValue)>;
/// Callable carried by a [`ValueFunc`].
pub type TypeFuncHandle = Arc<dyn Fn(&[DeepValue]) -> DeepValue + Send + Sync>;
/// Resource carried by a [`ValueOpaque`].
pub type TypeOpaqueHandle = Arc<dyn Any + Send + Sync>;

/// Type name reported for [`DeepValue::Timestamp`].
pub const C_TYPE_NAME_TIMESTAMP: &str = "Timestamp";

// Accessors recover from poisoning; only the copier treats it as a failure.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

////////////////////////////////////////////////////////////////////////////////
// #region DeepValue

/// One node of a runtime value graph.
#[derive(Debug, Clone, Default)]
pub enum DeepValue {
    /// Untyped empty value.
    #[default]
    Nil,
    /// Boolean primitive.
    Bool(bool),
    /// Signed integer primitive.
    Int(i64),
    /// Unsigned integer primitive.
    Uint(u64),
    /// Floating point primitive.
    Float(f64),
    /// String primitive (immutable by value).
    Str(String),
    /// Struct-like record with ordered fields.
    Record(ValueRecord),
    /// Fixed-arity sequence with value semantics.
    Array(ValueArray),
    /// Resizable view over shared backing storage.
    Slice(ValueSlice),
    /// Key/value mapping with reference semantics.
    Map(ValueMap),
    /// Reference to a shared, mutable target.
    Pointer(ValuePointer),
    /// Container for a value of statically unknown concrete type.
    Interface(ValueInterface),
    /// Function reference, shared on copy.
    Func(ValueFunc),
    /// Communication channel, shared on copy.
    Chan(ValueChan),
    /// Any other unclonable runtime resource, shared on copy.
    Opaque(ValueOpaque),
    /// Timestamp with a shared location reference.
    Timestamp(ValueTimestamp),
    /// Value that supplies its own copy logic.
    Custom(ValueCustom),
}

impl DeepValue {
    /// Structural category deciding the reconstruction policy.
    pub fn category(&self) -> EnumValueCategory {
        match self {
            Self::Nil
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Uint(_)
            | Self::Float(_)
            | Self::Str(_) => EnumValueCategory::Primitive,
            Self::Record(_) => EnumValueCategory::Record,
            Self::Array(_) => EnumValueCategory::FixedSequence,
            Self::Slice(_) => EnumValueCategory::DynamicSequence,
            Self::Map(_) => EnumValueCategory::Associative,
            Self::Pointer(_) => EnumValueCategory::Reference,
            Self::Interface(_) => EnumValueCategory::Polymorphic,
            Self::Func(_) | Self::Chan(_) | Self::Opaque(_) => EnumValueCategory::OpaqueShared,
            Self::Timestamp(_) => EnumValueCategory::Timestamp,
            Self::Custom(_) => EnumValueCategory::Custom,
        }
    }

    /// Declared type name, used in error messages and hook lookup.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int64",
            Self::Uint(_) => "uint64",
            Self::Float(_) => "float64",
            Self::Str(_) => "string",
            Self::Record(v) => &v.type_name,
            Self::Array(v) => &v.type_name,
            Self::Slice(v) => &v.type_name,
            Self::Map(v) => &v.type_name,
            Self::Pointer(v) => &v.type_name,
            Self::Interface(v) => &v.type_name,
            Self::Func(v) => &v.type_name,
            Self::Chan(v) => &v.type_name,
            Self::Opaque(v) => &v.type_name,
            Self::Timestamp(_) => C_TYPE_NAME_TIMESTAMP,
            Self::Custom(v) => &v.type_name,
        }
    }

    /// Whether this is an empty value: untyped nil or an unallocated
    /// reference, slice, map, interface, func, chan, resource or custom handle.
    pub fn is_nil(&self) -> bool {
        match self {
            Self::Nil => true,
            Self::Slice(v) => v.is_nil(),
            Self::Map(v) => v.is_nil(),
            Self::Pointer(v) => v.is_nil(),
            Self::Interface(v) => v.is_nil(),
            Self::Func(v) => v.func.is_none(),
            Self::Chan(v) => v.chan.is_none(),
            Self::Opaque(v) => v.handle.is_none(),
            Self::Custom(v) => v.handle.is_none(),
            _ => false,
        }
    }

    /// Zero value of the same declared type.
    ///
    /// Records and arrays are zeroed member by member; every reference-like
    /// shape becomes its unallocated form.
    pub fn zeroed(&self) -> DeepValue {
        match self {
            Self::Nil => Self::Nil,
            Self::Bool(_) => Self::Bool(false),
            Self::Int(_) => Self::Int(0),
            Self::Uint(_) => Self::Uint(0),
            Self::Float(_) => Self::Float(0.0),
            Self::Str(_) => Self::Str(String::new()),
            Self::Record(v) => Self::Record(ValueRecord {
                type_name: v.type_name.clone(),
                fields: v
                    .fields
                    .iter()
                    .map(|field| ValueField {
                        name: field.name.clone(),
                        if_exported: field.if_exported,
                        value: field.value.zeroed(),
                    })
                    .collect(),
            }),
            Self::Array(v) => Self::Array(ValueArray {
                type_name: v.type_name.clone(),
                elements: v.elements.iter().map(DeepValue::zeroed).collect(),
            }),
            Self::Slice(v) => Self::Slice(ValueSlice::nil(v.type_name.clone())),
            Self::Map(v) => Self::Map(ValueMap::nil(v.type_name.clone())),
            Self::Pointer(v) => Self::Pointer(ValuePointer::nil(v.type_name.clone())),
            Self::Interface(v) => Self::Interface(ValueInterface::nil(v.type_name.clone())),
            Self::Func(v) => Self::Func(ValueFunc::nil(v.type_name.clone())),
            Self::Chan(v) => Self::Chan(ValueChan::nil(v.type_name.clone())),
            Self::Opaque(v) => Self::Opaque(ValueOpaque::nil(v.type_name.clone())),
            Self::Timestamp(_) => Self::Timestamp(ValueTimestamp::default()),
            Self::Custom(v) => Self::Custom(ValueCustom::nil(v.type_name.clone())),
        }
    }

    pub fn as_record(&self) -> Option<&ValueRecord> {
        match self {
            Self::Record(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record_mut(&mut self) -> Option<&mut ValueRecord> {
        match self {
            Self::Record(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&ValuePointer> {
        match self {
            Self::Pointer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_slice(&self) -> Option<&ValueSlice> {
        match self {
            Self::Slice(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<&ValueInterface> {
        match self {
            Self::Interface(v) => Some(v),
            _ => None,
        }
    }
}

/// Deep value equality.
///
/// Pointer targets, slice windows and map entries are compared by value;
/// funcs, channels, resources and custom handles by identity. Map entries are
/// matched by deep key equality, so a pointer-keyed map equals its deep copy.
/// Comparing cyclic graphs does not terminate.
impl PartialEq for DeepValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Record(a), Self::Record(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Slice(a), Self::Slice(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Pointer(a), Self::Pointer(b)) => a == b,
            (Self::Interface(a), Self::Interface(b)) => a == b,
            (Self::Func(a), Self::Func(b)) => a == b,
            (Self::Chan(a), Self::Chan(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => a == b,
            _ => false,
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Records

/// One named member of a [`ValueRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValueField {
    /// Member name.
    pub name: Arc<str>,
    /// Externally visible member; hidden members are never copied.
    pub if_exported: bool,
    /// Member value.
    pub value: DeepValue,
}

impl ValueField {
    /// Externally visible member.
    pub fn exported(name: impl Into<Arc<str>>, value: DeepValue) -> Self {
        Self {
            name: name.into(),
            if_exported: true,
            value,
        }
    }

    /// Hidden member. The copy holds its zero value.
    pub fn hidden(name: impl Into<Arc<str>>, value: DeepValue) -> Self {
        Self {
            name: name.into(),
            if_exported: false,
            value,
        }
    }
}

/// Struct-like value with members in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    /// Declared record type name.
    pub type_name: Arc<str>,
    /// Members in declared order.
    pub fields: Vec<ValueField>,
}

impl ValueRecord {
    pub fn new(type_name: impl Into<Arc<str>>, fields: Vec<ValueField>) -> Self {
        Self {
            type_name: type_name.into(),
            fields,
        }
    }

    /// Member value by name.
    pub fn field(&self, name: &str) -> Option<&DeepValue> {
        self.fields
            .iter()
            .find(|field| &*field.name == name)
            .map(|field| &field.value)
    }

    /// Mutable member value by name.
    pub fn field_mut(&mut self, name: &str) -> Option<&mut DeepValue> {
        self.fields
            .iter_mut()
            .find(|field| &*field.name == name)
            .map(|field| &mut field.value)
    }
}

/// Fixed-arity sequence with value semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueArray {
    /// Declared array type name.
    pub type_name: Arc<str>,
    /// Elements; the length is the arity.
    pub elements: Vec<DeepValue>,
}

impl ValueArray {
    pub fn new(type_name: impl Into<Arc<str>>, elements: Vec<DeepValue>) -> Self {
        Self {
            type_name: type_name.into(),
            elements,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Slices

/// Window into a slice's backing storage.
///
/// `storage` always holds at least `n_offset + n_cap` elements.
#[derive(Debug, Clone)]
pub(crate) struct SliceBacking {
    pub(crate) storage: TypeSharedCell<Vec<DeepValue>>,
    pub(crate) n_offset: usize,
    pub(crate) n_len: usize,
    pub(crate) n_cap: usize,
}

/// Resizable sequence header over shared backing storage.
///
/// Several headers may view the same storage with different offsets and
/// lengths. A nil slice has no storage; an empty slice has storage of length 0.
#[derive(Debug, Clone)]
pub struct ValueSlice {
    pub(crate) type_name: Arc<str>,
    pub(crate) backing: Option<SliceBacking>,
}

impl ValueSlice {
    /// Unallocated slice.
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            backing: None,
        }
    }

    /// Allocated slice whose length and capacity equal `elements.len()`.
    pub fn from_vec(type_name: impl Into<Arc<str>>, elements: Vec<DeepValue>) -> Self {
        let n_len = elements.len();
        Self::from_storage(type_name, elements, n_len)
    }

    /// Allocated slice with spare capacity filled with `value_zero`.
    pub fn with_capacity(
        type_name: impl Into<Arc<str>>,
        mut elements: Vec<DeepValue>,
        n_cap: usize,
        value_zero: DeepValue,
    ) -> Self {
        let n_len = elements.len();
        if n_cap > n_len {
            elements.resize(n_cap, value_zero);
        }
        Self::from_storage(type_name, elements, n_len)
    }

    /// Allocated slice over `storage`; capacity is the storage length.
    pub(crate) fn from_storage(
        type_name: impl Into<Arc<str>>,
        storage: Vec<DeepValue>,
        n_len: usize,
    ) -> Self {
        let n_cap = storage.len();
        Self {
            type_name: type_name.into(),
            backing: Some(SliceBacking {
                storage: Arc::new(RwLock::new(storage)),
                n_offset: 0,
                n_len: n_len.min(n_cap),
                n_cap,
            }),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_nil(&self) -> bool {
        self.backing.is_none()
    }

    pub fn len(&self) -> usize {
        self.backing.as_ref().map_or(0, |b| b.n_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.backing.as_ref().map_or(0, |b| b.n_cap)
    }

    /// Element at `idx` (cloned header for reference-like elements).
    pub fn get(&self, idx: usize) -> Option<DeepValue> {
        let backing = self.backing.as_ref()?;
        if idx >= backing.n_len {
            return None;
        }
        read_lock(&backing.storage)
            .get(backing.n_offset + idx)
            .cloned()
    }

    /// Overwrite element at `idx` in the shared storage.
    pub fn set(&self, idx: usize, value: DeepValue) -> bool {
        let Some(backing) = self.backing.as_ref() else {
            return false;
        };
        if idx >= backing.n_len {
            return false;
        }
        match write_lock(&backing.storage).get_mut(backing.n_offset + idx) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Elements of the visible window.
    pub fn to_vec(&self) -> Vec<DeepValue> {
        let Some(backing) = self.backing.as_ref() else {
            return Vec::new();
        };
        read_lock(&backing.storage)
            .iter()
            .skip(backing.n_offset)
            .take(backing.n_len)
            .cloned()
            .collect()
    }

    /// Re-slice to `[start, end)`, sharing storage. `end` may reach into the
    /// spare capacity.
    pub fn subslice(&self, start: usize, end: usize) -> Option<Self> {
        let backing = self.backing.as_ref()?;
        if start > end || end > backing.n_cap {
            return None;
        }
        Some(Self {
            type_name: self.type_name.clone(),
            backing: Some(SliceBacking {
                storage: backing.storage.clone(),
                n_offset: backing.n_offset + start,
                n_len: end - start,
                n_cap: backing.n_cap - start,
            }),
        })
    }

    /// Append one element.
    ///
    /// Writes in place while spare capacity remains (the result then shares
    /// storage with `self`); otherwise reallocates with doubled capacity.
    pub fn append(&self, value: DeepValue) -> Self {
        if let Some(backing) = self.backing.as_ref()
            && backing.n_len < backing.n_cap
        {
            if let Some(slot) =
                write_lock(&backing.storage).get_mut(backing.n_offset + backing.n_len)
            {
                *slot = value;
            }
            return Self {
                type_name: self.type_name.clone(),
                backing: Some(SliceBacking {
                    n_len: backing.n_len + 1,
                    ..backing.clone()
                }),
            };
        }

        let n_len = self.len() + 1;
        let n_cap = (self.cap() * 2).max(n_len);
        let value_zero = value.zeroed();
        let mut l_storage = self.to_vec();
        l_storage.push(value);
        l_storage.resize(n_cap, value_zero);
        Self::from_storage(self.type_name.clone(), l_storage, n_len)
    }

    /// Whether both headers view the same backing storage.
    pub fn shares_storage(&self, other: &Self) -> bool {
        match (&self.backing, &other.backing) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.storage, &b.storage),
            _ => false,
        }
    }

    pub(crate) fn backing(&self) -> Option<&SliceBacking> {
        self.backing.as_ref()
    }
}

impl PartialEq for ValueSlice {
    fn eq(&self, other: &Self) -> bool {
        if self.type_name != other.type_name {
            return false;
        }
        match (&self.backing, &other.backing) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                if Arc::ptr_eq(&a.storage, &b.storage)
                    && a.n_offset == b.n_offset
                    && a.n_len == b.n_len
                {
                    return true;
                }
                a.n_len == b.n_len && self.to_vec() == other.to_vec()
            }
            _ => false,
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Maps

/// Entry storage of a [`ValueMap`] with a digest index over its keys.
///
/// `dict_index` maps each key digest to the positions of the entries carrying
/// it; only keys whose digests collide are compared one by one.
#[derive(Debug, Clone, Default)]
pub(crate) struct MapTable {
    l_entries: TypeMapEntries,
    dict_index: HashMap<u64, Vec<usize>>,
}

impl MapTable {
    fn with_capacity(n_capacity: usize) -> Self {
        Self {
            l_entries: Vec::with_capacity(n_capacity),
            dict_index: HashMap::with_capacity(n_capacity),
        }
    }

    fn len(&self) -> usize {
        self.l_entries.len()
    }

    fn position(&self, digest: u64, key: &DeepValue) -> Option<usize> {
        self.dict_index
            .get(&digest)?
            .iter()
            .copied()
            .find(|&idx| {
                self.l_entries
                    .get(idx)
                    .is_some_and(|(k, _)| is_key_equal(k, key))
            })
    }

    fn get(&self, key: &DeepValue) -> Option<&DeepValue> {
        let idx = self.position(digest_key(key), key)?;
        self.l_entries.get(idx).map(|(_, v)| v)
    }

    fn insert(&mut self, key: DeepValue, value: DeepValue) -> Option<DeepValue> {
        let digest = digest_key(&key);
        if let Some(idx) = self.position(digest, &key)
            && let Some((_, slot)) = self.l_entries.get_mut(idx)
        {
            return Some(std::mem::replace(slot, value));
        }
        self.dict_index
            .entry(digest)
            .or_default()
            .push(self.l_entries.len());
        self.l_entries.push((key, value));
        None
    }

    fn remove(&mut self, key: &DeepValue) -> Option<DeepValue> {
        let digest = digest_key(key);
        let idx = self.position(digest, key)?;
        self.unindex(digest, idx);

        let idx_last = self.l_entries.len() - 1;
        let (_, value) = self.l_entries.swap_remove(idx);
        if idx != idx_last
            && let Some((key_moved, _)) = self.l_entries.get(idx)
            && let Some(bucket) = self.dict_index.get_mut(&digest_key(key_moved))
        {
            for slot in bucket.iter_mut().filter(|slot| **slot == idx_last) {
                *slot = idx;
            }
        }
        Some(value)
    }

    fn unindex(&mut self, digest: u64, idx: usize) {
        if let Some(bucket) = self.dict_index.get_mut(&digest) {
            bucket.retain(|&slot| slot != idx);
            if bucket.is_empty() {
                self.dict_index.remove(&digest);
            }
        }
    }

    /// Snapshot of all entries.
    pub(crate) fn entries(&self) -> TypeMapEntries {
        self.l_entries.clone()
    }
}

/// Key/value mapping header with reference semantics.
///
/// Keys are matched with comparable-value equality: primitives, records,
/// arrays, interfaces and timestamps by value; pointers and handles by
/// identity. Iteration order is unspecified and changes on removal.
#[derive(Debug, Clone)]
pub struct ValueMap {
    pub(crate) type_name: Arc<str>,
    pub(crate) table: Option<TypeSharedCell<MapTable>>,
}

impl ValueMap {
    /// Unallocated map.
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            table: None,
        }
    }

    /// Allocated, empty map.
    pub fn new(type_name: impl Into<Arc<str>>) -> Self {
        Self::with_capacity(type_name, 0)
    }

    /// Allocated, empty map with room for `n_capacity` entries.
    pub fn with_capacity(type_name: impl Into<Arc<str>>, n_capacity: usize) -> Self {
        Self {
            type_name: type_name.into(),
            table: Some(Arc::new(RwLock::new(MapTable::with_capacity(n_capacity)))),
        }
    }

    pub fn from_entries<I>(type_name: impl Into<Arc<str>>, entries: I) -> Self
    where
        I: IntoIterator<Item = (DeepValue, DeepValue)>,
    {
        let mut map = Self::new(type_name);
        for (key, value) in entries {
            map.insert(key, value);
        }
        map
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_nil(&self) -> bool {
        self.table.is_none()
    }

    pub fn len(&self) -> usize {
        self.table.as_ref().map_or(0, |t| read_lock(t).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &DeepValue) -> Option<DeepValue> {
        let table = self.table.as_ref()?;
        read_lock(table).get(key).cloned()
    }

    /// Insert or replace an entry, returning the replaced value. A nil map
    /// is allocated first.
    pub fn insert(&mut self, key: DeepValue, value: DeepValue) -> Option<DeepValue> {
        let table = self
            .table
            .get_or_insert_with(|| Arc::new(RwLock::new(MapTable::default())));
        write_lock(table).insert(key, value)
    }

    pub fn remove(&self, key: &DeepValue) -> Option<DeepValue> {
        let table = self.table.as_ref()?;
        write_lock(table).remove(key)
    }

    pub fn keys(&self) -> Vec<DeepValue> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> TypeMapEntries {
        self.table
            .as_ref()
            .map(|t| read_lock(t).entries())
            .unwrap_or_default()
    }

    /// Whether both headers refer to the same entry storage.
    pub fn shares_storage(&self, other: &Self) -> bool {
        is_same_allocation(self.table.as_ref(), other.table.as_ref()) && !self.is_nil()
    }

    pub(crate) fn storage(&self) -> Option<&TypeSharedCell<MapTable>> {
        self.table.as_ref()
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        if self.type_name != other.type_name || self.is_nil() != other.is_nil() {
            return false;
        }
        if self.shares_storage(other) {
            return true;
        }
        let l_entries_a = self.entries();
        let l_entries_b = other.entries();
        l_entries_a.len() == l_entries_b.len()
            && l_entries_a
                .iter()
                .all(|(ka, va)| l_entries_b.iter().any(|(kb, vb)| ka == kb && va == vb))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region PointersAndInterfaces

/// Reference to a shared, mutable target.
#[derive(Debug, Clone)]
pub struct ValuePointer {
    pub(crate) type_name: Arc<str>,
    pub(crate) target: Option<TypeSharedCell<DeepValue>>,
}

impl ValuePointer {
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            target: None,
        }
    }

    /// Allocate a new target holding `value`.
    pub fn new(type_name: impl Into<Arc<str>>, value: DeepValue) -> Self {
        Self {
            type_name: type_name.into(),
            target: Some(Arc::new(RwLock::new(value))),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_nil(&self) -> bool {
        self.target.is_none()
    }

    /// Snapshot of the target.
    pub fn get(&self) -> Option<DeepValue> {
        self.target.as_ref().map(|t| read_lock(t).clone())
    }

    /// Overwrite the target in place. Returns `false` for a nil pointer.
    pub fn set(&self, value: DeepValue) -> bool {
        match &self.target {
            Some(target) => {
                *write_lock(target) = value;
                true
            }
            None => false,
        }
    }

    /// Mutate the target in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut DeepValue) -> R) -> Option<R> {
        self.target.as_ref().map(|t| f(&mut write_lock(t)))
    }

    /// Whether both pointers refer to the same target (or are both nil).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        is_same_allocation(self.target.as_ref(), other.target.as_ref())
    }

    pub(crate) fn target(&self) -> Option<&TypeSharedCell<DeepValue>> {
        self.target.as_ref()
    }
}

impl PartialEq for ValuePointer {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && (self.ptr_eq(other) || self.get() == other.get())
    }
}

/// Container for a value whose concrete type is only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInterface {
    pub(crate) type_name: Arc<str>,
    pub(crate) inner: Option<Box<DeepValue>>,
}

impl ValueInterface {
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            inner: None,
        }
    }

    /// Wrap `value`; an untyped [`DeepValue::Nil`] yields an empty container.
    pub fn new(type_name: impl Into<Arc<str>>, value: DeepValue) -> Self {
        let inner = match value {
            DeepValue::Nil => None,
            v => Some(Box::new(v)),
        };
        Self {
            type_name: type_name.into(),
            inner,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_nil(&self) -> bool {
        self.inner.is_none()
    }

    /// Concrete dynamic value.
    pub fn inner(&self) -> Option<&DeepValue> {
        self.inner.as_deref()
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region OpaqueShared

/// Function reference. Copies share the same callable, including whatever
/// state it captured.
#[derive(Clone)]
pub struct ValueFunc {
    pub(crate) type_name: Arc<str>,
    pub(crate) func: Option<TypeFuncHandle>,
}

impl ValueFunc {
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            func: None,
        }
    }

    pub fn new<F>(type_name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&[DeepValue]) -> DeepValue + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            func: Some(Arc::new(func)),
        }
    }

    pub fn call(&self, args: &[DeepValue]) -> Option<DeepValue> {
        self.func.as_ref().map(|f| f(args))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        is_same_allocation(self.func.as_ref(), other.func.as_ref())
    }
}

impl fmt::Debug for ValueFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueFunc")
            .field("type_name", &self.type_name)
            .field("if_nil", &self.func.is_none())
            .finish()
    }
}

impl PartialEq for ValueFunc {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.ptr_eq(other)
    }
}

/// Unbounded FIFO channel carrying values between holders of the same handle.
#[derive(Debug)]
pub struct ValueChannel {
    tx: Mutex<mpsc::Sender<DeepValue>>,
    rx: Mutex<mpsc::Receiver<DeepValue>>,
}

impl ValueChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    }

    pub fn send(&self, value: DeepValue) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(value)
            .is_ok()
    }

    pub fn try_recv(&self) -> Option<DeepValue> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }
}

impl Default for ValueChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel header. Copies share the same channel.
#[derive(Debug, Clone)]
pub struct ValueChan {
    pub(crate) type_name: Arc<str>,
    pub(crate) chan: Option<Arc<ValueChannel>>,
}

impl ValueChan {
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            chan: None,
        }
    }

    /// Allocate a fresh channel.
    pub fn new(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            chan: Some(Arc::new(ValueChannel::new())),
        }
    }

    pub fn channel(&self) -> Option<&Arc<ValueChannel>> {
        self.chan.as_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        is_same_allocation(self.chan.as_ref(), other.chan.as_ref())
    }
}

impl PartialEq for ValueChan {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.ptr_eq(other)
    }
}

/// Unclonable runtime resource (file handle, connection, ...), shared on copy.
#[derive(Clone)]
pub struct ValueOpaque {
    pub(crate) type_name: Arc<str>,
    pub(crate) handle: Option<TypeOpaqueHandle>,
}

impl ValueOpaque {
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            handle: None,
        }
    }

    pub fn new(type_name: impl Into<Arc<str>>, handle: TypeOpaqueHandle) -> Self {
        Self {
            type_name: type_name.into(),
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&TypeOpaqueHandle> {
        self.handle.as_ref()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.as_ref()?.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        is_same_allocation(self.handle.as_ref(), other.handle.as_ref())
    }
}

impl fmt::Debug for ValueOpaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueOpaque")
            .field("type_name", &self.type_name)
            .field("if_nil", &self.handle.is_none())
            .finish()
    }
}

impl PartialEq for ValueOpaque {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.ptr_eq(other)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Timestamps

/// Named fixed-offset time zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueLocation {
    pub name: String,
    pub offset: FixedOffset,
}

impl ValueLocation {
    pub fn new(name: impl Into<String>, offset: FixedOffset) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

/// Instant plus an optional location reference.
///
/// The location is shared between a timestamp and its copies; `None` means UTC.
#[derive(Debug, Clone, Default)]
pub struct ValueTimestamp {
    pub instant: DateTime<Utc>,
    pub location: Option<Arc<ValueLocation>>,
}

impl ValueTimestamp {
    pub fn new(instant: DateTime<Utc>, location: Option<Arc<ValueLocation>>) -> Self {
        Self { instant, location }
    }

    pub fn location(&self) -> Option<&Arc<ValueLocation>> {
        self.location.as_ref()
    }

    /// Instant expressed in the timestamp's location.
    pub fn to_local(&self) -> DateTime<FixedOffset> {
        let offset = self
            .location
            .as_ref()
            .map_or_else(|| Utc.fix(), |loc| loc.offset);
        self.instant.with_timezone(&offset)
    }
}

impl PartialEq for ValueTimestamp {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant
            && match (&self.location, &other.location) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
                _ => false,
            }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region CustomCopy

/// Capability of a value type to produce its own deep copy.
///
/// The copier calls [`CustomDeepCopy::deep_copy`] instead of generic traversal
/// and uses the result verbatim, so an implementation may reach state the value
/// model cannot see or deliberately share memory with the source.
pub trait CustomDeepCopy: Any + Send + Sync + fmt::Debug {
    /// Declared type name.
    fn type_name(&self) -> &str;

    /// Produce a deep copy of `self`.
    fn deep_copy(&self) -> DeepValue;

    fn as_any(&self) -> &dyn Any;
}

/// Value carrying a [`CustomDeepCopy`] handle.
#[derive(Debug, Clone)]
pub struct ValueCustom {
    pub(crate) type_name: Arc<str>,
    pub(crate) handle: Option<Arc<dyn CustomDeepCopy>>,
}

impl ValueCustom {
    pub fn nil(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            handle: None,
        }
    }

    pub fn new(handle: Arc<dyn CustomDeepCopy>) -> Self {
        Self {
            type_name: Arc::from(handle.type_name()),
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&Arc<dyn CustomDeepCopy>> {
        self.handle.as_ref()
    }

    pub fn downcast_ref<T: CustomDeepCopy>(&self) -> Option<&T> {
        self.handle.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        is_same_allocation(self.handle.as_ref(), other.handle.as_ref())
    }
}

impl PartialEq for ValueCustom {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.ptr_eq(other)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
