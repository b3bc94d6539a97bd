//! Call-site capture and best-effort symbolisation.
//!
//! Capturing is cheap and allocation free: we only walk the stack and keep the
//! first [`CALL_SITE_DEPTH`] return addresses. Turning those into a file and a
//! line is expensive, so it is deferred until a row is actually written to the
//! diagnostic log.

use std::{
    ffi::c_void,
    fmt,
    path::{Path, PathBuf},
};

/// How many return addresses a [`CallSite`] keeps. Enough to step over the
/// debugger's own frames and the `alloc`/`RawVec` plumbing above them.
pub const CALL_SITE_DEPTH: usize = 16;

/// The return addresses of the frames that led to an allocator entry point,
/// innermost first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    frames: [usize; CALL_SITE_DEPTH],
    len: u8,
}

impl CallSite {
    pub const fn unknown() -> Self {
        Self {
            frames: [0; CALL_SITE_DEPTH],
            len: 0,
        }
    }

    /// A call site consisting of exactly one return address
    pub const fn from_return_address(address: usize) -> Self {
        let mut site = Self::unknown();
        if address != 0 {
            site.frames[0] = address;
            site.len = 1;
        }
        site
    }

    /// Walk the current stack. Never allocates through the Rust allocator.
    #[inline(never)]
    pub fn capture() -> Self {
        let mut site = Self::unknown();
        // SAFETY: `trace_unsynchronized` is only unsafe because some unwinders
        // are not thread safe; on the unix targets we support, the system
        // unwinder is. Taking the `backtrace` crate's global lock here instead
        // could deadlock against a thread that holds it while allocating.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip != 0 {
                    site.frames[site.len as usize] = ip;
                    site.len += 1;
                }
                (site.len as usize) < CALL_SITE_DEPTH
            });
        }
        site
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len as usize]
    }

    /// The innermost captured return address, if any
    pub fn return_address(&self) -> Option<usize> {
        self.frames().first().copied()
    }

    pub fn is_unknown(&self) -> bool {
        self.len == 0
    }
}

impl Default for CallSite {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| crate::alloc::record::Address(*ip)))
            .finish()
    }
}

/// A resolved source position
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// Maps a captured call site to the source position that is worth reporting.
/// Resolution is best effort: `None` means "unknown", never an error.
pub trait SymbolResolver: Send {
    fn resolve(&self, site: &CallSite) -> Option<SourceLocation>;
}

/// Never resolves anything. For hosts built without debug info.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullResolver;

impl SymbolResolver for NullResolver {
    fn resolve(&self, _: &CallSite) -> Option<SourceLocation> {
        None
    }
}

/// Resolves through the `backtrace` crate (DWARF on Linux) and reports the
/// first frame that is not part of the debugger or the standard library.
#[derive(Clone, Debug)]
pub struct BacktraceResolver {
    skip_prefixes: Vec<PathBuf>,
    skip_fragments: &'static [&'static str],
    skip_symbols: &'static [&'static str],
}

impl BacktraceResolver {
    pub fn new() -> Self {
        Self {
            skip_prefixes: vec![Path::new(env!("CARGO_MANIFEST_DIR")).join("src")],
            skip_fragments: &[
                "/rustc/",
                "/library/alloc/",
                "/library/core/",
                "/library/std/",
                "/backtrace-",
            ],
            // The `#[global_allocator]` shims carry the line of the user's
            // `static` item, so they can only be told apart by name.
            skip_symbols: &[
                "__rust_alloc",
                "__rust_dealloc",
                "__rust_realloc",
                "__rg_",
                "__rdl_",
                "__rustc::",
                "heapdbg::",
            ],
        }
    }

    /// Also skip frames from files under `prefix`, e.g. a wrapper crate that
    /// forwards to the entry points.
    pub fn skip_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.skip_prefixes.push(prefix.into());
        self
    }

    fn is_plumbing(&self, file: &Path) -> bool {
        if self.skip_prefixes.iter().any(|p| file.starts_with(p)) {
            return true;
        }
        let file = file.to_string_lossy();
        self.skip_fragments.iter().any(|f| file.contains(f))
    }

    fn is_plumbing_symbol(&self, name: &str) -> bool {
        self.skip_symbols.iter().any(|s| name.contains(s))
    }
}

impl Default for BacktraceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver for BacktraceResolver {
    fn resolve(&self, site: &CallSite) -> Option<SourceLocation> {
        for &ip in site.frames() {
            let mut found = None;
            // return addresses point past the call, which may be the next line
            let pc = ip.saturating_sub(1);
            backtrace::resolve(pc as *mut c_void, |symbol| {
                if found.is_some() {
                    return;
                }
                if let Some(name) = symbol.name() {
                    if self.is_plumbing_symbol(&name.to_string()) {
                        return;
                    }
                }
                if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                    if !self.is_plumbing(file) {
                        // the log is comma separated
                        let file = file.display().to_string().replace(',', ";");
                        found = Some(SourceLocation::new(file, line));
                    }
                }
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }
}
