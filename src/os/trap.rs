/// Stop at a debugger breakpoint. With a debugger attached this pauses the
/// process at the faulting call; without one, the default `SIGTRAP`
/// disposition terminates the process (dumping core where enabled). Returns
/// if a debugger resumes us or the signal is handled.
#[inline(never)]
#[cold]
pub fn debug_break() {
    // SAFETY: raising a signal on ourselves has no memory safety requirements
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
}
