#[cfg(not(unix))]
compile_error!("heapdbg only supports unix targets");

pub mod mem;
pub mod trap;
