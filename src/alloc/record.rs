//! The metadata we keep for every tracked allocation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{serialize::serde_address, symbol::CallSite};

/// Which entry point produced an allocation. Memory must be released through
/// the matching deallocation form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AllocKind {
    SingleBlock,
    Array,
}

impl AllocKind {
    pub const fn name(self) -> &'static str {
        match self {
            AllocKind::SingleBlock => "Single Block",
            AllocKind::Array => "Array",
        }
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What went wrong with an allocation, if anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorClass {
    #[default]
    None,
    Leak,
    DoubleDelete,
    NonTrackedPointer,
    KindMismatch,
}

impl ErrorClass {
    /// The message column of the diagnostic log
    pub const fn label(self) -> &'static str {
        match self {
            ErrorClass::None => "None",
            ErrorClass::Leak => "Memory Leak",
            ErrorClass::DoubleDelete => "Double Delete",
            ErrorClass::NonTrackedPointer => "Non Heap Pointer Deletion",
            ErrorClass::KindMismatch => "New-delete mismatch",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An address rendered the way C's `%p` renders it on Linux.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub usize);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One observed allocation.
///
/// Records are created live (`deleted == false`, `error == None`) and are only
/// ever mutated in place: `deleted` flips once, and `error` moves forward from
/// [`ErrorClass::None`] exactly once (see [`AllocationRecord::classify()`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    #[serde(with = "serde_address")]
    pub address: usize,
    pub byte_size: usize,
    pub kind: AllocKind,
    pub error: ErrorClass,
    pub deleted: bool,
    /// Where the allocation was made, replaced by the offending call site when
    /// an anomaly is detected.
    #[serde(skip)]
    pub origin: CallSite,
}

impl AllocationRecord {
    pub fn new(address: usize, byte_size: usize, kind: AllocKind, origin: CallSite) -> Self {
        Self {
            address,
            byte_size,
            kind,
            error: ErrorClass::None,
            deleted: false,
            origin,
        }
    }

    pub const fn address(&self) -> Address {
        Address(self.address)
    }

    /// Move the error class forward. Returns `false` (and changes nothing) if
    /// this record has already been classified, so a mismatch is never
    /// downgraded to a leak.
    pub fn classify(&mut self, error: ErrorClass) -> bool {
        if self.error != ErrorClass::None || error == ErrorClass::None {
            return false;
        }
        self.error = error;
        true
    }

    /// `true` if this record is still waiting for its deallocation
    pub const fn is_live(&self) -> bool {
        !self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AllocationRecord {
        AllocationRecord::new(0x1000, 64, AllocKind::SingleBlock, CallSite::unknown())
    }

    #[test]
    fn new_records_are_live_and_clean() {
        let r = record();
        assert!(r.is_live());
        assert_eq!(r.error, ErrorClass::None);
    }

    #[test]
    fn classification_only_moves_forward_once() {
        let mut r = record();
        assert!(r.classify(ErrorClass::KindMismatch));
        assert!(!r.classify(ErrorClass::Leak));
        assert_eq!(r.error, ErrorClass::KindMismatch);
        assert!(!r.classify(ErrorClass::None));
        assert_eq!(r.error, ErrorClass::KindMismatch);
    }

    #[test]
    fn labels_match_log_vocabulary() {
        assert_eq!(ErrorClass::Leak.label(), "Memory Leak");
        assert_eq!(ErrorClass::DoubleDelete.label(), "Double Delete");
        assert_eq!(
            ErrorClass::NonTrackedPointer.label(),
            "Non Heap Pointer Deletion"
        );
        assert_eq!(ErrorClass::KindMismatch.label(), "New-delete mismatch");
        assert_eq!(ErrorClass::None.label(), "None");
    }

    #[test]
    fn addresses_render_like_percent_p() {
        assert_eq!(Address(0x7f3a_0000_1000).to_string(), "0x7f3a00001000");
        assert_eq!(record().address().to_string(), "0x1000");
    }

    #[test]
    fn records_serialize_with_hex_addresses() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["address"], "0x1000");
        assert_eq!(json["byte_size"], 64);
        assert_eq!(json["kind"], "SingleBlock");
        assert!(json.get("origin").is_none());
    }
}
