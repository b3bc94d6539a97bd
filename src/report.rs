//! The persistent diagnostic log.
//!
//! A comma separated file with one row per anomaly or leak:
//!
//! ```plaintext
//! Message, File, Line, Bytes, Address, Additional Info
//! Memory Leak,/home/me/game/src/main.rs,42,128,0x7f3a00001000,None
//! ```
//!
//! The file is (re)created with a fresh header the first time a row is
//! written, then every row is appended with its own open/append/close cycle,
//! so a crash right after a row never loses it.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;

use crate::{
    alloc::record::AllocationRecord,
    error::ReportError,
    symbol::{SourceLocation, SymbolResolver},
};

pub const LOG_HEADER: &str = "Message, File, Line, Bytes, Address, Additional Info";

/// Placeholder file name for call sites that could not be resolved
pub const UNKNOWN_FILE: &str = "Unknown";

/// The reserved last column
const ADDITIONAL_INFO: &str = "None";

/// When the header gets (re)written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderPolicy {
    /// The log is created once per process; rows accumulate below one header.
    #[default]
    Once,
    /// Every immediate anomaly report resets the log, so the next row starts a
    /// fresh file with a fresh header.
    PerAnomaly,
}

impl FromStr for HeaderPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(HeaderPolicy::Once),
            "per-anomaly" | "per_anomaly" | "reset" => Ok(HeaderPolicy::PerAnomaly),
            _ => Err(()),
        }
    }
}

pub struct DiagnosticReporter<R> {
    path: PathBuf,
    header_policy: HeaderPolicy,
    created: bool,
    resolver: R,
}

impl<R> DiagnosticReporter<R>
where
    R: SymbolResolver,
{
    pub fn new(path: impl Into<PathBuf>, header_policy: HeaderPolicy, resolver: R) -> Self {
        Self {
            path: path.into(),
            header_policy,
            created: false,
            resolver,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Point the reporter somewhere else. The next row recreates the log.
    pub fn reconfigure(&mut self, path: impl Into<PathBuf>, header_policy: HeaderPolicy) {
        let path = path.into();
        if path != self.path {
            self.created = false;
        }
        self.path = path;
        self.header_policy = header_policy;
    }

    fn io_error(&self, source: std::io::Error) -> ReportError {
        ReportError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Create (truncating) the log and write the header, unless that already
    /// happened.
    pub fn create_log(&mut self) -> Result<(), ReportError> {
        if self.created {
            return Ok(());
        }
        let mut file = File::create(&self.path).map_err(|e| self.io_error(e))?;
        writeln!(file, "{LOG_HEADER}").map_err(|e| self.io_error(e))?;
        self.created = true;
        log::debug!("created diagnostic log {}", self.path.display());
        Ok(())
    }

    /// Append one row describing `record`
    pub fn write_row(&mut self, record: &AllocationRecord) -> Result<(), ReportError> {
        self.create_log()?;
        let location = self.resolver.resolve(&record.origin);
        let row = format_row(record, location.as_ref());
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(row.as_bytes())
            .map_err(|e| self.io_error(e))
    }

    /// Report an anomaly on its own: create, write, then (under
    /// [`HeaderPolicy::PerAnomaly`]) forget that the log exists.
    pub fn write_and_reset(&mut self, record: &AllocationRecord) -> Result<(), ReportError> {
        let written = self.write_row(record);
        if self.header_policy == HeaderPolicy::PerAnomaly {
            self.created = false;
        }
        written
    }
}

/// One log line, newline included
pub fn format_row(record: &AllocationRecord, location: Option<&SourceLocation>) -> String {
    let (file, line) = match location {
        Some(loc) => (loc.file.as_str(), loc.line),
        None => (UNKNOWN_FILE, 0),
    };
    format!(
        "{},{},{},{},{},{}\n",
        record.error.label(),
        file,
        line,
        record.byte_size,
        record.address(),
        ADDITIONAL_INFO
    )
}
