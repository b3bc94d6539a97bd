//! The table of every allocation we have observed.
//!
//! Records are appended and never removed until teardown: a freed record stays
//! behind (marked `deleted`) so that a second free of the same address can be
//! recognised as a double delete. Addresses get recycled by the page
//! allocator, so lookups walk the table newest-first; the most recent record
//! for an address is the one that describes its current owner.

use super::record::{AllocKind, AllocationRecord, ErrorClass};
use crate::symbol::CallSite;

/// What [`TrackingRegistry::release()`] decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Release {
    /// Null pointer; freeing null is a no-op
    Ignored,
    /// Normal path. The caller must return the block (of `record.byte_size`
    /// bytes) to the page allocator.
    Freed(AllocationRecord),
    /// Something is wrong. The record (a copy of the registry's, or a
    /// synthesised one for untracked pointers) has been classified and its
    /// origin set to the offending call site. Nothing must be freed.
    Anomaly(AllocationRecord),
}

#[derive(Debug, Default)]
pub struct TrackingRegistry {
    records: Vec<AllocationRecord>,
}

impl TrackingRegistry {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Start tracking an allocation. No uniqueness check: a stale record for
    /// the same address may exist if it was freed and the memory reused.
    pub fn observe(&mut self, record: AllocationRecord) {
        self.records.push(record);
    }

    fn position(&self, address: usize) -> Option<usize> {
        self.records.iter().rposition(|r| r.address == address)
    }

    /// The most recent record for `address`
    pub fn find(&self, address: usize) -> Option<&AllocationRecord> {
        self.position(address).map(|i| &self.records[i])
    }

    /// Handle a deallocation request of `kind` for `address`
    pub fn release(
        &mut self,
        address: usize,
        kind: AllocKind,
        byte_size: usize,
        origin: CallSite,
    ) -> Release {
        if address == 0 {
            return Release::Ignored;
        }

        let Some(i) = self.position(address) else {
            let mut record = AllocationRecord::new(address, byte_size, kind, origin);
            record.deleted = true;
            record.classify(ErrorClass::NonTrackedPointer);
            return Release::Anomaly(record);
        };

        let record = &mut self.records[i];
        if record.deleted {
            record.classify(ErrorClass::DoubleDelete);
            record.origin = origin;
            // the stored record keeps an earlier mismatch, but this free is
            // a double delete regardless
            let mut anomaly = record.clone();
            anomaly.error = ErrorClass::DoubleDelete;
            return Release::Anomaly(anomaly);
        }
        if record.kind != kind {
            record.classify(ErrorClass::KindMismatch);
            record.origin = origin;
            return Release::Anomaly(record.clone());
        }

        record.deleted = true;
        Release::Freed(record.clone())
    }

    /// Number of records, live or not
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records still waiting for their deallocation
    pub fn live(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.iter().filter(|r| r.is_live())
    }

    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        self.records.clone()
    }

    /// Empty the registry, returning the rows teardown has to report, in the
    /// order they were observed:
    ///
    /// - every record that was never freed, classified as a leak unless it
    ///   already carries a more specific class (a kind mismatch stays one)
    /// - every freed record that was classified along the way
    pub fn drain_for_teardown(&mut self) -> Vec<AllocationRecord> {
        std::mem::take(&mut self.records)
            .into_iter()
            .filter_map(|mut record| {
                if record.is_live() {
                    record.classify(ErrorClass::Leak);
                    Some(record)
                } else if record.error != ErrorClass::None {
                    Some(record)
                } else {
                    None
                }
            })
            .collect()
    }
}
