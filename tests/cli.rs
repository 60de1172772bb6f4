//! Integration tests for the sched-energy CLI.
//!
//! Each test writes a small trace, pid table and snapshot into a temp dir and
//! runs the binary against them.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

const PIDS: &str = r#"{
    "app": [{"pid": 100, "process": "com.example", "thread": "main"}],
    "binder": [{"pid": 201, "parent": 200, "process": "surfaceflinger", "thread": "binder:200_1"}]
}"#;

// main thread calls into surfaceflinger, sleeps, and is woken by the reply
const EVENTS: &str = r#"
{"type":"sched_switch","ts":1000,"pid":0,"core":0,"prev_state":0,"next_pid":100}
{"type":"idle","ts":1000,"core":4,"state":1}
{"type":"freq_change","ts":1500,"core":0,"freq":1402000000}
{"type":"binder_call","ts":1600,"pid":100,"core":0,"kind":"call","dest_pid":200}
{"type":"sched_switch","ts":2000,"pid":100,"core":0,"prev_state":1,"next_pid":201}
{"type":"temp_info","ts":2100,"sensor":"little","temp":41.5}
{"type":"binder_call","ts":2300,"pid":201,"core":0,"kind":"reply","dest_pid":100,"dest_thread":100}
{"type":"sched_switch","ts":2400,"pid":201,"core":0,"prev_state":1,"next_pid":100}
{"type":"mali_util","ts":2500,"freq":533000000,"util":30.0}
{"type":"mali_util","ts":2900,"freq":400000000,"util":10.0}
{"type":"sched_switch","ts":3000,"pid":100,"core":0,"prev_state":1,"next_pid":0}
{"type":"idle","ts":3000,"core":4,"state":4294967295}
"#;

const DISCOVERY_PIDS: &str = r#"{
    "app": [{"pid": 100, "process": "com.example", "thread": "main"}],
    "other": [{"pid": 400, "process": "audioserver", "thread": "audioserver"}]
}"#;

// main posts a oneway call to audioserver and a blocking call to process 500,
// whose pool thread 501 is in no table and runs again after replying
const DISCOVERY_EVENTS: &str = r#"
{"type":"sched_switch","ts":1000,"pid":0,"core":0,"prev_state":0,"next_pid":100}
{"type":"binder_call","ts":1100,"pid":100,"core":0,"kind":"async","dest_pid":400,"dest_thread":400}
{"type":"binder_call","ts":1200,"pid":100,"core":0,"kind":"call","dest_pid":500,"dest_thread":501}
{"type":"sched_switch","ts":1300,"pid":100,"core":0,"prev_state":1,"next_pid":0}
{"type":"sched_switch","ts":1400,"pid":0,"core":4,"prev_state":0,"next_pid":400}
{"type":"sched_switch","ts":1600,"pid":400,"core":4,"prev_state":1,"next_pid":0}
{"type":"sched_switch","ts":1700,"pid":0,"core":1,"prev_state":0,"next_pid":501}
{"type":"binder_call","ts":1800,"pid":501,"core":1,"kind":"reply","dest_pid":100,"dest_thread":100}
{"type":"sched_switch","ts":1900,"pid":501,"core":1,"prev_state":1,"next_pid":100}
{"type":"sched_switch","ts":2000,"pid":100,"core":1,"prev_state":1,"next_pid":0}
{"type":"sched_switch","ts":2100,"pid":0,"core":1,"prev_state":0,"next_pid":501}
{"type":"sched_switch","ts":2300,"pid":501,"core":1,"prev_state":1,"next_pid":0}
"#;

fn snapshot(little: u64, big: u64) -> String {
    let cores: Vec<String> = (0..8)
        .map(|core| {
            let freq = if core < 4 { little } else { big };
            format!(r#"{{"core":{core},"freq":{freq}}}"#)
        })
        .collect();
    format!(r#"{{"cores":[{}]}}"#, cores.join(","))
}

struct Fixture {
    dir: TempDir,
    events: PathBuf,
    pids: PathBuf,
    snapshot: PathBuf,
}

impl Fixture {
    fn new(events: &str, snapshot_json: &str) -> Self {
        Self::with_pids(PIDS, events, snapshot_json)
    }

    fn with_pids(pids: &str, events: &str, snapshot_json: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let events_path = dir.path().join("trace.jsonl");
        let pids_path = dir.path().join("pids.json");
        let snapshot_path = dir.path().join("snapshot.json");
        fs::write(&events_path, events).unwrap();
        fs::write(&pids_path, pids).unwrap();
        fs::write(&snapshot_path, snapshot_json).unwrap();
        Fixture {
            dir,
            events: events_path,
            pids: pids_path,
            snapshot: snapshot_path,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn run(&self, extra: &[&str]) -> Output {
        let mut args: Vec<String> = vec![
            "--events".into(),
            self.events.display().to_string(),
            "--pids".into(),
            self.pids.display().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        run_cli(&args)
    }
}

fn default_fixture() -> Fixture {
    Fixture::new(EVENTS, &snapshot(999_000_000, 903_000_000))
}

fn run_cli<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sched-energy"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run sched-energy")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn run_json(fixture: &Fixture, extra: &[&str]) -> serde_json::Value {
    let snapshot = fixture.snapshot.display().to_string();
    let mut args = vec!["--snapshot", snapshot.as_str(), "--format", "json"];
    args.extend_from_slice(extra);
    let output = fixture.run(&args);
    assert!(
        output.status.success(),
        "sched-energy failed: {}",
        stderr(&output)
    );
    serde_json::from_str(&stdout(&output)).expect("Output is not valid JSON")
}

fn branch<'a>(summary: &'a serde_json::Value, pid: u64) -> Option<&'a serde_json::Value> {
    summary["branches"]
        .as_array()
        .unwrap()
        .iter()
        .find(|b| b["pid"].as_u64() == Some(pid))
}

#[test]
fn test_json_report() {
    let fixture = default_fixture();
    let summary = run_json(&fixture, &[]);

    assert_eq!(summary["start_time"], 1000);
    assert_eq!(summary["finish_time"], 3000);

    let main = branch(&summary, 100).expect("main thread missing");
    assert_eq!(main["class"], "app");
    assert_eq!(main["tasks"], 2);
    assert!(main["little_joules"].as_f64().unwrap() > 0.0);
    assert_eq!(main["big_joules"].as_f64().unwrap(), 0.0);

    let pool = branch(&summary, 201).expect("binder thread missing");
    assert_eq!(pool["class"], "binder");
    assert_eq!(pool["binders"], 1);

    let totals = &summary["totals"];
    let total = totals["total_joules"].as_f64().unwrap();
    let parts = totals["big_joules"].as_f64().unwrap()
        + totals["little_joules"].as_f64().unwrap()
        + totals["gpu_joules"].as_f64().unwrap();
    assert!((total - parts).abs() < 1e-12);
    assert!(totals["gpu_joules"].as_f64().unwrap() > 0.0);

    assert_eq!(summary["stats"]["dropped_replies"], 0);
    assert_eq!(summary["stats"]["leaked_pending"], 0);
    assert_eq!(summary["stats"]["unmatched_completions"], 0);
}

#[test]
fn test_threads_discovered_mid_trace() {
    let fixture = Fixture::with_pids(
        DISCOVERY_PIDS,
        DISCOVERY_EVENTS,
        &snapshot(999_000_000, 903_000_000),
    );
    let summary = run_json(&fixture, &[]);

    let woken = branch(&summary, 400).expect("audioserver thread missing");
    assert_eq!(woken["class"], "discovered");
    assert_eq!(woken["process"], "audioserver");
    assert_eq!(woken["tasks"], 1);
    assert_eq!(woken["binders"], 1);
    assert!(woken["big_joules"].as_f64().unwrap() > 0.0);

    let pool = branch(&summary, 501).expect("unlisted pool thread missing");
    assert_eq!(pool["class"], "binder");
    assert_eq!(pool["tasks"], 1);
    assert_eq!(pool["binders"], 1);

    let main = branch(&summary, 100).expect("main thread missing");
    assert_eq!(main["tasks"], 2);

    let stats = &summary["stats"];
    assert_eq!(stats["events"], 12);
    assert_eq!(stats["unmatched_completions"], 0);
    assert_eq!(stats["leaked_pending"], 0);
    assert_eq!(stats["dropped_replies"], 0);
    assert_eq!(stats["unidentified_targets"], 0);
}

#[test]
fn test_core_outside_topology_fails() {
    let events = EVENTS.replace(r#""core":4,"#, r#""core":4000000000,"#);
    let fixture = Fixture::new(&events, &snapshot(999_000_000, 903_000_000));
    let snapshot = fixture.snapshot.display().to_string();
    let output = fixture.run(&["--snapshot", &snapshot]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Core 4000000000 is not in the topology"));
}

#[test]
fn test_table_report() {
    let fixture = default_fixture();
    let snapshot = fixture.snapshot.display().to_string();
    let output = fixture.run(&["--snapshot", &snapshot]);
    assert!(output.status.success(), "{}", stderr(&output));

    let text = stdout(&output);
    assert!(text.contains("Window: 1000us - 3000us"));
    assert!(text.contains("com.example"));
    assert!(text.contains("Total:"));
}

#[test]
fn test_csv_report() {
    let fixture = default_fixture();
    let snapshot = fixture.snapshot.display().to_string();
    let output = fixture.run(&["--snapshot", &snapshot, "--format", "csv"]);
    assert!(output.status.success(), "{}", stderr(&output));

    let text = stdout(&output);
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("pid,process,thread,class"));
    assert_eq!(lines.count(), 2);
}

#[test]
fn test_graph_output() {
    let fixture = default_fixture();
    let graph = fixture.path("tasks.dot");
    let graph_arg = graph.display().to_string();
    let with_graph = run_json(&fixture, &["--graph", &graph_arg]);
    let without_graph = run_json(&fixture, &[]);

    let dot = fs::read_to_string(&graph).expect("graph not written");
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("binder 201#0"));
    assert_eq!(with_graph["totals"], without_graph["totals"]);
}

#[test]
fn test_window_drops_events() {
    let fixture = default_fixture();
    let summary = run_json(&fixture, &["--start", "1900"]);
    assert!(summary["stats"]["out_of_window"].as_u64().unwrap() > 0);
    let main = branch(&summary, 100).expect("main thread missing");
    assert_eq!(main["tasks"], 1);
}

#[test]
fn test_sysfs_seed() {
    let fixture = default_fixture();
    let sysfs = fixture.path("cpu");
    for core in 0..8 {
        let khz = if core < 4 { "999000" } else { "903000" };
        let cpufreq = sysfs.join(format!("cpu{core}")).join("cpufreq");
        fs::create_dir_all(&cpufreq).unwrap();
        fs::write(cpufreq.join("scaling_cur_freq"), format!("{khz}\n")).unwrap();
    }
    let from_snapshot = run_json(&fixture, &[]);

    let sysfs_arg = sysfs.display().to_string();
    let output = fixture.run(&["--sysfs", &sysfs_arg, "--format", "json"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let from_sysfs: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(
        from_sysfs["totals"]["little_joules"],
        from_snapshot["totals"]["little_joules"]
    );
}

#[test]
fn test_tunables_file() {
    let fixture = default_fixture();
    let config = fixture.path("config.json");
    fs::write(&config, r#"{"series_interval_us": 500, "workers": 2}"#).unwrap();
    let config_arg = config.display().to_string();
    let summary = run_json(&fixture, &["--config", &config_arg]);
    assert_eq!(summary["series"].as_array().unwrap().len(), 4);
}

#[test]
fn test_invalid_frequency_fails() {
    let fixture = Fixture::new(EVENTS, &snapshot(1_234, 903_000_000));
    let snapshot = fixture.snapshot.display().to_string();
    let output = fixture.run(&["--snapshot", &snapshot]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("No voltage entry for 1234 Hz"));
}

#[test]
fn test_unknown_device_fails() {
    let fixture = default_fixture();
    let output = fixture.run(&["--device", "pixel"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Must be one of"));
}

#[test]
fn test_invalid_format_fails() {
    let fixture = default_fixture();
    let output = fixture.run(&["--format", "xml"]);
    assert!(!output.status.success());
}

#[test]
fn test_snapshot_conflicts_with_sysfs() {
    let fixture = default_fixture();
    let snapshot = fixture.snapshot.display().to_string();
    let output = fixture.run(&["--snapshot", &snapshot, "--sysfs", "/nonexistent"]);
    assert!(!output.status.success());
}

#[test]
fn test_missing_events_file() {
    let dir = TempDir::new().unwrap();
    let pids = dir.path().join("pids.json");
    fs::write(&pids, PIDS).unwrap();
    let missing = dir.path().join("missing.jsonl").display().to_string();
    let pids_arg = pids.display().to_string();
    let output = run_cli(&["--events", missing.as_str(), "--pids", pids_arg.as_str()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Failed to open event file"));
}
