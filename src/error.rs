use std::{io, path::PathBuf};

use thiserror::Error;

use crate::alloc::record::{Address, AllocationRecord};

/// Why an allocation request was refused. This is the only error that reaches
/// the caller of an allocating entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("requested {requested} bytes, more than the {ceiling} byte ceiling")]
    ExceedsCeiling { requested: usize, ceiling: usize },

    #[error("alignment {align} is larger than the {page_size} byte page size")]
    Alignment { align: usize, page_size: usize },

    #[error("page allocator could not provide {size} bytes")]
    OutOfPages { size: usize },
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write diagnostic log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },
}

/// A deallocation that must not be allowed to continue: a double delete, a
/// kind mismatch, or a free of memory we never handed out. The diagnostic row
/// has already been written by the time one of these exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} at {} ({}, {} bytes)", .record.error, .record.address(), .record.kind, .record.byte_size)]
pub struct FatalAnomaly {
    pub record: AllocationRecord,
}

impl FatalAnomaly {
    pub fn address(&self) -> Address {
        self.record.address()
    }
}
