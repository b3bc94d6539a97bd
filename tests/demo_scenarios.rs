use std::{
    fs,
    os::unix::process::ExitStatusExt,
    process::{Command, ExitStatus},
};

use tempfile::TempDir;

const HEADER: &str = "Message, File, Line, Bytes, Address, Additional Info";

struct Run {
    status: ExitStatus,
    stdout: String,
    stderr: String,
    dir: TempDir,
}

impl Run {
    /// The address the demo printed as `name=0x...`
    fn address(&self, name: &str) -> String {
        let prefix = format!("{name}=");
        self.stdout
            .lines()
            .find_map(|line| line.strip_prefix(&prefix))
            .unwrap_or_else(|| panic!("no {name}= in stdout:\n{}", self.stdout))
            .to_owned()
    }

    fn log(&self, name: &str) -> String {
        fs::read_to_string(self.dir.path().join(name))
            .unwrap_or_else(|e| panic!("no {name} ({e}), stderr:\n{}", self.stderr))
    }

    /// Rows of `DebugLog.csv`, split into columns
    fn rows(&self) -> Vec<Vec<String>> {
        rows_of(&self.log("DebugLog.csv"))
    }

    fn rows_for(&self, address: &str) -> Vec<Vec<String>> {
        self.rows()
            .into_iter()
            .filter(|row| row[4] == address)
            .collect()
    }
}

fn rows_of(log: &str) -> Vec<Vec<String>> {
    let mut lines = log.lines();
    assert_eq!(lines.next(), Some(HEADER));
    lines
        .map(|line| {
            let row: Vec<String> = line.split(',').map(str::to_owned).collect();
            assert_eq!(row.len(), 6, "malformed row {line:?}");
            row
        })
        .collect()
}

fn run_with(args: &[&str], env: &[(&str, &str)]) -> Run {
    let dir = tempfile::tempdir().unwrap();
    let mut command = Command::new(env!("CARGO_BIN_EXE_heapdbg-demo"));
    command.args(args).current_dir(dir.path());
    for var in [
        "HEAPDBG_CONFIG",
        "HEAPDBG_LOG",
        "HEAPDBG_MAX_ALLOC",
        "HEAPDBG_ON_ANOMALY",
        "HEAPDBG_HEADER",
        "HEAPDBG_CALL_SITES",
        "HEAPDBG_QUIET",
        "RUST_LOG",
    ] {
        command.env_remove(var);
    }
    command.envs(env.iter().copied());
    let output = command.output().unwrap();
    Run {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        dir,
    }
}

fn run(args: &[&str]) -> Run {
    run_with(args, &[])
}

/// The only rows allowed are leaks of runtime allocations (stdout buffers,
/// the logger), none of which are at an address the scenario printed.
fn assert_nothing_reported_for(run: &Run, names: &[&str]) {
    let rows = run.rows();
    for row in &rows {
        assert_eq!(row[0], "Memory Leak", "unexpected row {row:?}");
    }
    for name in names {
        let address = run.address(name);
        assert!(
            rows.iter().all(|row| row[4] != address),
            "{name}={address} was reported: {rows:?}"
        );
    }
}

/// 1-based line of the first line in the demo source containing `needle`
fn demo_line(needle: &str) -> String {
    let line = include_str!("../demos/heapdbg_demo.rs")
        .lines()
        .position(|line| line.contains(needle))
        .unwrap_or_else(|| panic!("{needle:?} not in the demo"));
    (line + 1).to_string()
}

#[test]
fn leaked_array_is_reported_at_teardown() {
    let run = run(&["leak"]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);

    let a = run.address("A");
    let b = run.address("B");
    assert!(run.rows_for(&a).is_empty());

    let rows = run.rows_for(&b);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row[0], "Memory Leak");
    assert!(row[1].ends_with("heapdbg_demo.rs"), "unexpected file {row:?}");
    assert_eq!(row[2], demo_line("let b = new_array(128)?;"));
    assert_eq!(row[3], "128");
    assert_eq!(row[5], "None");
}

#[test]
fn double_free_writes_one_row_then_traps() {
    let run = run(&["double-free"]);
    assert_eq!(run.status.signal(), Some(libc::SIGTRAP));
    assert!(!run.stdout.contains("survived"));

    let c = run.address("C");
    let rows = run.rows();
    assert_eq!(rows.len(), 1, "{rows:?}");
    assert_eq!(rows[0][0], "Double Delete");
    assert_eq!(rows[0][3], "32");
    assert_eq!(rows[0][4], c);
    let message = format!("Double delete detected at {c}, of type Single Block");
    assert_eq!(run.stderr.matches(&message).count(), 1, "{}", run.stderr);
}

#[test]
fn kind_mismatch_writes_one_row_then_traps() {
    let run = run(&["mismatch"]);
    assert_eq!(run.status.signal(), Some(libc::SIGTRAP));

    let d = run.address("D");
    let rows = run.rows();
    assert_eq!(rows.len(), 1, "{rows:?}");
    assert_eq!(rows[0][0], "New-delete mismatch");
    assert_eq!(rows[0][3], "48");
    assert_eq!(rows[0][4], d);
}

#[test]
fn foreign_pointer_writes_one_row_then_traps() {
    let run = run(&["foreign"]);
    assert_eq!(run.status.signal(), Some(libc::SIGTRAP));

    let f = run.address("F");
    let rows = run.rows();
    assert_eq!(rows.len(), 1, "{rows:?}");
    assert_eq!(rows[0][0], "Non Heap Pointer Deletion");
    assert_eq!(rows[0][3], "0");
    assert_eq!(rows[0][4], f);
}

#[test]
fn abort_escalation() {
    let run = run(&["--on-anomaly", "abort", "mismatch"]);
    assert_eq!(run.status.signal(), Some(libc::SIGABRT));
    assert_eq!(run.rows().len(), 1);
}

#[test]
fn continue_escalation_reports_again_at_teardown() {
    let run = run(&["--on-anomaly", "continue", "double-free"]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);
    assert!(run.stdout.contains("survived"));

    let c = run.address("C");
    let rows = run.rows_for(&c);
    assert_eq!(rows.len(), 2, "{rows:?}");
    assert!(rows.iter().all(|row| row[0] == "Double Delete"));
}

#[test]
fn per_anomaly_header_restarts_the_log() {
    let run = run(&[
        "--on-anomaly",
        "continue",
        "--per-anomaly-header",
        "double-free",
    ]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);

    let log = run.log("DebugLog.csv");
    assert_eq!(log.matches(HEADER).count(), 1);
    // the immediate row was truncated away by the teardown report
    let c = run.address("C");
    assert_eq!(run.rows_for(&c).len(), 1);
}

#[test]
fn null_frees_are_ignored() {
    let run = run(&["null"]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);
    assert!(run.stdout.contains("survived"));
    assert_nothing_reported_for(&run, &[]);
}

#[test]
fn matched_frees_report_nothing() {
    let run = run(&["clean"]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);
    assert!(run.stdout.contains("sum=167057"));
    assert_nothing_reported_for(&run, &["A", "B", "X", "V"]);
}

#[test]
fn oversized_requests_are_refused() {
    let run = run(&["oversize"]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);
    assert!(run.stdout.contains("refused: requested 16711569 bytes"));
    assert!(run.stdout.contains("nothrow=0x0"));
    assert_nothing_reported_for(&run, &["M"]);
}

#[test]
fn global_allocator_leaks_are_reported() {
    let run = run(&["boxed"]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);

    let l = run.address("L");
    let rows = run.rows_for(&l);
    assert_eq!(rows.len(), 1, "{rows:?}");
    assert_eq!(rows[0][0], "Memory Leak");
    assert!(rows[0][1].ends_with("heapdbg_demo.rs"), "{rows:?}");
    assert_eq!(rows[0][2], demo_line("Box::leak("));
    assert_eq!(rows[0][3], "100");
}

#[test]
fn environment_configures_the_debugger() {
    let run = run_with(
        &["double-free"],
        &[
            ("HEAPDBG_LOG", "custom.csv"),
            ("HEAPDBG_ON_ANOMALY", "continue"),
            ("HEAPDBG_QUIET", "1"),
            ("HEAPDBG_CALL_SITES", "0"),
        ],
    );
    assert!(run.status.success(), "stderr:\n{}", run.stderr);
    assert!(!run.dir.path().join("DebugLog.csv").exists());
    assert!(!run.stderr.contains("Double delete detected"), "{}", run.stderr);

    let c = run.address("C");
    let rows: Vec<_> = rows_of(&run.log("custom.csv"))
        .into_iter()
        .filter(|row| row[4] == c)
        .collect();
    assert!(!rows.is_empty());
    for row in rows {
        assert_eq!(&row[..4], &["Double Delete", "Unknown", "0", "32"]);
    }
}

#[test]
fn snapshot_lists_live_records() {
    let run = run(&["--snapshot", "leak"]);
    assert!(run.status.success(), "stderr:\n{}", run.stderr);

    let b = run.address("B");
    let json = run.address("snapshot");
    let records: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
    let record = records
        .iter()
        .find(|r| r["address"] == b.as_str())
        .unwrap_or_else(|| panic!("{b} missing from {json}"));
    assert_eq!(record["byte_size"], 128);
    assert_eq!(record["kind"], "Array");
    assert_eq!(record["deleted"], false);
}
