//! Runs one allocation scenario under the heap debugger and prints the
//! addresses involved, so the resulting `DebugLog.csv` can be checked against
//! them.

use std::{path::PathBuf, ptr};

use clap::{Parser, Subcommand};
use heapdbg::{
    delete_array, delete_single, delete_single_sized, new_array, new_array_nothrow, new_single,
    with_debugger, DebugAlloc, DebuggerGuardBuilder, Escalation, HeaderPolicy,
};

#[global_allocator]
static GLOBAL: DebugAlloc = DebugAlloc;

#[derive(Subcommand, Debug, Clone, Copy)]
enum Scenario {
    #[command(about = "Matched allocations and frees, nothing to report")]
    Clean,
    #[command(about = "Free a 64 byte block, leak a 128 byte array")]
    Leak,
    #[command(about = "Free the same block twice")]
    DoubleFree,
    #[command(about = "Free an array through the single block entry point")]
    Mismatch,
    #[command(about = "Free a stack address")]
    Foreign,
    #[command(about = "Free null through both entry points")]
    Null,
    #[command(about = "Ask for more than the allocation ceiling")]
    Oversize,
    #[command(about = "Leak a Box through the global allocator")]
    Boxed,
}

#[derive(Parser, Debug)]
#[command(about = "Drive the heap debugger through a single scenario")]
struct Args {
    #[command(subcommand)]
    scenario: Scenario,

    /// Diagnostic log path
    #[arg(long)]
    log: Option<PathBuf>,

    /// What to do on a double delete, mismatch or foreign free
    #[arg(long, value_parser = parse_escalation)]
    on_anomaly: Option<Escalation>,

    /// Restart the log after every anomaly
    #[arg(long)]
    per_anomaly_header: bool,

    /// Print the registry as JSON before tearing down
    #[arg(long)]
    snapshot: bool,
}

fn parse_escalation(s: &str) -> Result<Escalation, String> {
    s.parse()
        .map_err(|()| format!("expected trap, abort or continue, got {s:?}"))
}

fn run(scenario: Scenario) -> Result<(), heapdbg::AllocError> {
    match scenario {
        Scenario::Clean => {
            let a = new_single(64)?;
            let b = new_array(4096)?;
            let boxed = Box::new([7u64; 32]);
            let mut v: Vec<u32> = (0..1000).collect();
            v.retain(|n| n % 3 == 0);
            println!("A={:p}", a.as_ptr());
            println!("B={:p}", b.as_ptr());
            println!("X={:p}", boxed.as_ptr());
            println!("V={:p}", v.as_ptr());
            println!("sum={}", v.iter().sum::<u32>() + boxed.iter().sum::<u64>() as u32);
            unsafe {
                delete_single_sized(a.as_ptr(), 64);
                delete_array(b.as_ptr());
            }
        }
        Scenario::Leak => {
            let a = new_single(64)?;
            let b = new_array(128)?;
            println!("A={:p}", a.as_ptr());
            println!("B={:p}", b.as_ptr());
            unsafe { delete_single(a.as_ptr()) };
        }
        Scenario::DoubleFree => {
            let c = new_single(32)?;
            println!("C={:p}", c.as_ptr());
            unsafe {
                delete_single(c.as_ptr());
                delete_single(c.as_ptr());
            }
            println!("survived");
        }
        Scenario::Mismatch => {
            let d = new_array(48)?;
            println!("D={:p}", d.as_ptr());
            unsafe { delete_single(d.as_ptr()) };
            println!("survived");
        }
        Scenario::Foreign => {
            let mut on_stack = [0u8; 16];
            println!("F={:p}", on_stack.as_ptr());
            unsafe { delete_array(on_stack.as_mut_ptr()) };
            println!("survived");
        }
        Scenario::Null => {
            unsafe {
                delete_single(ptr::null_mut());
                delete_array(ptr::null_mut());
            }
            println!("survived");
        }
        Scenario::Oversize => {
            let ceiling = with_debugger(|d| d.config().max_alloc_size).unwrap_or_default();
            match new_array(ceiling + 1) {
                Ok(p) => println!("unexpected allocation at {:p}", p.as_ptr()),
                Err(e) => println!("refused: {e}"),
            }
            println!("nothrow={:p}", new_array_nothrow(ceiling + 1));
            let at_ceiling = new_array(ceiling)?;
            println!("M={:p}", at_ceiling.as_ptr());
            unsafe { delete_array(at_ceiling.as_ptr()) };
        }
        Scenario::Boxed => {
            let leaked = Box::leak(Box::new([0xabu8; 100]));
            println!("L={:p}", leaked.as_ptr());
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut builder = DebuggerGuardBuilder::new();
    if let Some(log) = args.log {
        builder = builder.log_path(log);
    }
    if let Some(escalation) = args.on_anomaly {
        builder = builder.on_anomaly(escalation);
    }
    if args.per_anomaly_header {
        builder = builder.header_policy(HeaderPolicy::PerAnomaly);
    }
    let guard = builder.build();

    if let Err(e) = run(args.scenario) {
        eprintln!("allocation failed: {e}");
    }

    if args.snapshot {
        let json = with_debugger(|d| {
            let live: Vec<_> = d.snapshot().into_iter().filter(|r| r.is_live()).collect();
            serde_json::to_string(&live)
        });
        match json {
            Some(Ok(json)) => println!("snapshot={json}"),
            Some(Err(e)) => eprintln!("failed to serialize snapshot: {e}"),
            None => eprintln!("heap debugger is gone"),
        }
    }

    drop(guard);
}
