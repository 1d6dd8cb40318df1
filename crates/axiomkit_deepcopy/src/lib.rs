//! `axiomkit_deepcopy` v1:
//! Deep copier for runtime value graphs.
//!
//! Module layout:
//! - `conf`   : traversal thresholds and defaults
//! - `value`  : type-erased value model walked by the copier
//! - `copy`   : traversal and copy orchestration
//! - `spec`   : enums/options/errors
//! - `report` : run-time report model
//! - `util`   : shared helper functions

pub mod conf;
pub mod copy;
pub mod report;
pub mod spec;
mod util;
pub mod value;

pub use conf::{N_DEPTH_MAX_REFERENCE_CHAIN, N_DEPTH_START_DETECTING_CYCLES};
pub use copy::{DeepCopier, deep_copy};
pub use report::{ReportDeepCopy, ReportDeepCopyBuilder};
pub use spec::{DeepCopyError, EnumValueCategory, SpecDeepCopyOptions, TypeCopyHook};
pub use value::{
    CustomDeepCopy, DeepValue, ValueArray, ValueChan, ValueChannel, ValueCustom, ValueField,
    ValueFunc, ValueInterface, ValueLocation, ValueMap, ValueOpaque, ValuePointer, ValueRecord,
    ValueSlice, ValueTimestamp,
};
