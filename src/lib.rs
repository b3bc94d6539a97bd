//! A heap memory debugger.
//!
//! Every allocation gets its own pages and a record in a registry. Freeing
//! something twice, freeing it through the wrong entry point, or freeing
//! memory that never came from us writes a row to a CSV log and stops the
//! program at that call. Whatever is still allocated when the debugger is torn
//! down is written to the same log as a leak.
//!
//! Install [`DebugAlloc`] as the global allocator and hold a
//! [`DebuggerGuard`] for the life of `main`, or call the explicit entry points
//! in [`alloc::global`].

pub mod alloc;
pub mod config;
pub mod debugger;
pub mod error;
pub mod escalation;
pub mod lifecycle;
pub mod os;
pub mod report;
pub mod serialize;
pub mod symbol;
pub mod util;

pub use alloc::{
    global::{
        delete_array, delete_array_sized, delete_single, delete_single_sized, new_array,
        new_array_nothrow, new_single, new_single_nothrow, DebugAlloc,
    },
    record::{Address, AllocKind, AllocationRecord, ErrorClass},
};
pub use config::DebuggerConfig;
pub use debugger::{HeapDebugger, TeardownSummary};
pub use error::{AllocError, ConfigError, FatalAnomaly, ReportError};
pub use escalation::Escalation;
pub use lifecycle::{debugger, guard, with_debugger, DebuggerGuard, DebuggerGuardBuilder};
pub use report::HeaderPolicy;
