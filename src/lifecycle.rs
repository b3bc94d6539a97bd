//! The process-wide [`HeapDebugger`].
//!
//! It is built on first use, from inside whichever allocation happens to come
//! first, so construction cannot take a lock that parks or allocate through
//! the tracked path. A small atomic state machine decides who builds it;
//! everyone else spins until it is live. The debugger then lives until the
//! last [`DebuggerGuard`] is dropped, which flushes the leak report. It is
//! never rebuilt after that.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use once_cell::sync::OnceCell;

use crate::{
    alloc::internal,
    config::DebuggerConfig,
    debugger::{HeapDebugger, TeardownSummary},
    escalation::Escalation,
    os::mem::MmapPages,
    report::HeaderPolicy,
    symbol::BacktraceResolver,
    util::hint::cold,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninit,
    /// Somebody is mid construction. Only observable from other threads.
    Initializing,
    Live,
    TornDown,
}

impl LifecycleState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Uninit,
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Live,
            _ => LifecycleState::TornDown,
        }
    }
}

static STATE: AtomicU8 = AtomicU8::new(LifecycleState::Uninit as u8);
static DEBUGGER: OnceCell<HeapDebugger> = OnceCell::new();
static GUARDS: AtomicUsize = AtomicUsize::new(0);

pub fn state() -> LifecycleState {
    LifecycleState::from_u8(STATE.load(Ordering::Acquire))
}

/// The process-wide debugger, built on first call. `None` once it has been
/// torn down.
///
/// Callers that allocate while holding the returned reference must do so
/// inside [`internal::enter()`]; [`with_debugger()`] does that for you.
pub fn debugger() -> Option<&'static HeapDebugger> {
    loop {
        match state() {
            LifecycleState::Live => return DEBUGGER.get(),
            LifecycleState::TornDown => return None,
            LifecycleState::Initializing => std::hint::spin_loop(),
            LifecycleState::Uninit => {
                if STATE
                    .compare_exchange(
                        LifecycleState::Uninit as u8,
                        LifecycleState::Initializing as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    cold(initialize);
                }
            }
        }
    }
}

fn initialize() {
    internal::enter(|| {
        let config = DebuggerConfig::from_env().unwrap_or_else(|e| {
            log::warn!("{e}, falling back to the default heap debugger configuration");
            DebuggerConfig::default()
        });
        log::debug!("heap debugger configuration: {config:?}");
        let debugger = HeapDebugger::new(config, MmapPages, BacktraceResolver::new());
        // only the thread that won the state transition gets here
        let _ = DEBUGGER.set(debugger);
        log::info!("heap debugger initialized");
    });
    STATE.store(LifecycleState::Live as u8, Ordering::Release);
}

/// Run `f` against the process-wide debugger with the current thread marked
/// as inside it, so anything `f` allocates stays out of the registry.
pub fn with_debugger<R>(f: impl FnOnce(&HeapDebugger) -> R) -> Option<R> {
    internal::enter(|| debugger().map(f))
}

/// Flush the leak report and retire the debugger. Only the first call does
/// anything.
fn teardown() -> Option<TeardownSummary> {
    if STATE
        .compare_exchange(
            LifecycleState::Live as u8,
            LifecycleState::TornDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return None;
    }
    internal::enter(|| {
        let summary = DEBUGGER.get()?.teardown();
        log::info!("heap debugger freed");
        Some(summary)
    })
}

/// Keeps the process-wide debugger alive. Guards are counted; when the last
/// one is dropped the debugger is torn down and every leak still in the
/// registry is written to the log.
///
/// Create one at the top of `main` and let it drop at the end:
///
/// ```rust,no_run
/// use heapdbg::{DebugAlloc, DebuggerGuardBuilder};
///
/// #[global_allocator]
/// static GLOBAL: DebugAlloc = DebugAlloc;
///
/// fn main() {
///     let _guard = DebuggerGuardBuilder::new().log_path("heap.csv").build();
///     // ...
/// }
/// ```
#[must_use = "the debugger is torn down as soon as the guard is dropped"]
pub struct DebuggerGuard {
    _private: (),
}

impl DebuggerGuard {
    /// Number of guards currently alive
    pub fn count() -> usize {
        GUARDS.load(Ordering::Acquire)
    }
}

impl Drop for DebuggerGuard {
    fn drop(&mut self) {
        if GUARDS.fetch_sub(1, Ordering::AcqRel) == 1 {
            teardown();
        }
    }
}

/// A guard with default settings
pub fn guard() -> DebuggerGuard {
    DebuggerGuardBuilder::new().build()
}

/// Builds a [`DebuggerGuard`], overriding the configuration the debugger
/// picked up from the environment. Overrides only take effect for the first
/// guard; later guards just keep the debugger alive.
#[must_use = "builder is discarded without creating a guard"]
#[derive(Clone, Debug, Default)]
pub struct DebuggerGuardBuilder {
    log_path: Option<PathBuf>,
    max_alloc_size: Option<usize>,
    on_anomaly: Option<Escalation>,
    header_policy: Option<HeaderPolicy>,
    capture_call_sites: Option<bool>,
    console: Option<bool>,
}

impl DebuggerGuardBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the diagnostic log is written
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Requests above `bytes` are refused
    pub fn max_alloc_size(mut self, bytes: usize) -> Self {
        self.max_alloc_size = Some(bytes);
        self
    }

    pub fn on_anomaly(mut self, escalation: Escalation) -> Self {
        self.on_anomaly = Some(escalation);
        self
    }

    pub fn header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.header_policy = Some(policy);
        self
    }

    pub fn capture_call_sites(mut self, capture: bool) -> Self {
        self.capture_call_sites = Some(capture);
        self
    }

    /// Print anomalies to stderr as well as the log
    pub fn console(mut self, console: bool) -> Self {
        self.console = Some(console);
        self
    }

    fn apply(self, mut config: DebuggerConfig) -> DebuggerConfig {
        if let Some(path) = self.log_path {
            config.log_path = path;
        }
        if let Some(bytes) = self.max_alloc_size {
            config.max_alloc_size = bytes;
        }
        if let Some(escalation) = self.on_anomaly {
            config.on_anomaly = escalation;
        }
        if let Some(policy) = self.header_policy {
            config.header_policy = policy;
        }
        if let Some(capture) = self.capture_call_sites {
            config.capture_call_sites = capture;
        }
        if let Some(console) = self.console {
            config.console = console;
        }
        config
    }

    pub fn build(self) -> DebuggerGuard {
        if GUARDS.fetch_add(1, Ordering::AcqRel) == 0 {
            // The debugger must only ever hold (and later drop) memory from
            // the internal heap, so it gets its own copy of the overrides and
            // ours is freed through the tracked path.
            let overrides = internal::enter(|| self.clone());
            drop(self);
            let applied = with_debugger(|debugger| {
                let config = overrides.apply(debugger.config());
                debugger.reconfigure(config);
            });
            if applied.is_none() {
                log::warn!("heap debugger was already torn down, the new guard does nothing");
            }
        } else {
            log::debug!("heap debugger already guarded, ignoring guard configuration");
        }
        DebuggerGuard { _private: () }
    }
}
