//! [`HeapDebugger`] ties the pieces together: it hands out page allocator
//! memory, keeps the registry in sync, and writes the diagnostic log.
//!
//! It is an ordinary value, so it can be built and exercised on its own. The
//! process-wide debugger behind the interception layer is one of these.

use std::ptr::NonNull;

use parking_lot::{Mutex, RwLock};

use crate::{
    alloc::{
        record::{AllocKind, AllocationRecord, ErrorClass},
        registry::{Release, TrackingRegistry},
    },
    config::DebuggerConfig,
    error::{AllocError, FatalAnomaly},
    os::mem::{MmapPages, PageAllocator},
    report::DiagnosticReporter,
    symbol::{BacktraceResolver, CallSite, SymbolResolver},
    util::assert::aligned_to,
};

/// What teardown wrote to the log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    /// Records that were never freed
    pub leaks: usize,
    /// Freed records that carried an anomaly, reported again
    pub preserved: usize,
}

pub struct HeapDebugger<P = MmapPages, R = BacktraceResolver> {
    registry: Mutex<TrackingRegistry>,
    reporter: Mutex<DiagnosticReporter<R>>,
    config: RwLock<DebuggerConfig>,
    pages: P,
}

fn console_message(record: &AllocationRecord) -> String {
    match record.error {
        ErrorClass::DoubleDelete => format!(
            "Double delete detected at {}, of type {}",
            record.address(),
            record.kind
        ),
        ErrorClass::KindMismatch => format!(
            "Delete mismatch at {}, of type {}",
            record.address(),
            record.kind
        ),
        ErrorClass::NonTrackedPointer => {
            format!("Non heap pointer delete detected at {}", record.address())
        }
        ErrorClass::Leak | ErrorClass::None => format!(
            "Memory leak detected at {}, of type {}",
            record.address(),
            record.kind
        ),
    }
}

impl<P, R> HeapDebugger<P, R>
where
    P: PageAllocator,
    R: SymbolResolver,
{
    pub fn new(config: DebuggerConfig, pages: P, resolver: R) -> Self {
        let reporter =
            DiagnosticReporter::new(config.log_path.clone(), config.header_policy, resolver);
        Self {
            registry: Mutex::new(TrackingRegistry::new()),
            reporter: Mutex::new(reporter),
            config: RwLock::new(config),
            pages,
        }
    }

    pub fn config(&self) -> DebuggerConfig {
        self.config.read().clone()
    }

    pub fn reconfigure(&self, config: DebuggerConfig) {
        log::debug!("reconfiguring heap debugger: {config:?}");
        self.reporter
            .lock()
            .reconfigure(config.log_path.clone(), config.header_policy);
        *self.config.write() = config;
    }

    /// The caller's call site, or an unknown one if capturing is disabled
    #[inline(never)]
    pub fn call_site(&self) -> CallSite {
        if self.config.read().capture_call_sites {
            CallSite::capture()
        } else {
            CallSite::unknown()
        }
    }

    pub fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    /// Hand out `size` bytes of fresh, page aligned memory and start tracking
    /// it as `kind`.
    pub fn allocate(
        &self,
        size: usize,
        kind: AllocKind,
        origin: CallSite,
    ) -> Result<NonNull<u8>, AllocError> {
        let ceiling = self.config.read().max_alloc_size;
        if size > ceiling {
            return Err(AllocError::ExceedsCeiling {
                requested: size,
                ceiling,
            });
        }
        let ptr = self
            .pages
            .allocate(size)
            .ok_or(AllocError::OutOfPages { size })?;
        debug_assert!(aligned_to(ptr.as_ptr(), self.pages.page_size()));
        self.registry.lock().observe(AllocationRecord::new(
            ptr.as_ptr() as usize,
            size,
            kind,
            origin,
        ));
        Ok(ptr)
    }

    /// Stop tracking `ptr` and give its memory back, or report why we can't.
    /// `byte_size` is whatever the caller knows about the size (0 if
    /// nothing); memory is always freed using the recorded size.
    ///
    /// # Safety
    ///
    /// If `ptr` is a live allocation from this debugger it is freed, so it
    /// must not be used afterwards.
    pub unsafe fn release(
        &self,
        ptr: *mut u8,
        kind: AllocKind,
        byte_size: usize,
        origin: CallSite,
    ) -> Result<(), FatalAnomaly> {
        let outcome = self
            .registry
            .lock()
            .release(ptr as usize, kind, byte_size, origin);
        match outcome {
            Release::Ignored => Ok(()),
            Release::Freed(record) => {
                if let Some(ptr) = NonNull::new(ptr) {
                    // SAFETY: the registry only frees live records, which all
                    // came from `self.pages.allocate(record.byte_size)`
                    unsafe { self.pages.free(ptr, record.byte_size) };
                }
                Ok(())
            }
            Release::Anomaly(record) => {
                self.report_anomaly(&record);
                Err(FatalAnomaly { record })
            }
        }
    }

    fn report_anomaly(&self, record: &AllocationRecord) {
        let message = console_message(record);
        if self.config.read().console {
            eprintln!("{message}");
        } else {
            log::debug!("{message}");
        }
        if let Err(e) = self.reporter.lock().write_and_reset(record) {
            log::error!("{e}");
        }
    }

    /// Flush every outstanding problem to the log and empty the registry.
    pub fn teardown(&self) -> TeardownSummary {
        let rows = self.registry.lock().drain_for_teardown();
        let mut summary = TeardownSummary::default();
        let mut reporter = self.reporter.lock();
        for row in &rows {
            if row.is_live() {
                summary.leaks += 1;
                if row.error == ErrorClass::KindMismatch {
                    log::warn!(
                        "New-delete mismatch leak detected at {}, not overwriting error type",
                        row.address()
                    );
                } else {
                    log::warn!("{}", console_message(row));
                }
            } else {
                summary.preserved += 1;
            }
            if let Err(e) = reporter.write_row(row) {
                log::error!("{e}");
            }
        }
        log::info!(
            "heap debugger teardown: {} leaks, {} earlier anomalies",
            summary.leaks,
            summary.preserved
        );
        summary
    }

    /// Number of allocations not yet freed
    pub fn live_count(&self) -> usize {
        self.registry.lock().live().count()
    }

    pub fn find(&self, ptr: *const u8) -> Option<AllocationRecord> {
        self.registry.lock().find(ptr as usize).cloned()
    }

    /// Every record currently held, oldest first
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        self.registry.lock().snapshot()
    }
}
