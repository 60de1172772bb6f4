//! Typed trace events handed to the engine by the trace decoder.
//!
//! The decoder turns kernel tracepoints (`sched_switch`, `cpu_frequency`,
//! `cpu_idle`, `binder_transaction`, the Mali utilization hook and the thermal
//! zone samples) into [`Event`] values. They are exchanged as JSON lines so a
//! recorded trace can be replayed without the decoder being present:
//!
//! ```text
//! {"type":"sched_switch","ts":1000,"pid":0,"core":0,"prev_state":0,"next_pid":100}
//! {"type":"freq_change","ts":1100,"pid":0,"core":0,"freq":999000000}
//! {"type":"binder_call","ts":1200,"pid":100,"core":0,"kind":"call","dest_pid":200}
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Topology;

/// `prev_state` of a thread that was preempted while still runnable.
pub const TASK_RUNNING: i64 = 0;

/// `prev_state` of a thread going to sleep until woken (`S`).
pub const TASK_INTERRUPTIBLE: i64 = 1;

/// `prev_state` of a thread blocked in the kernel (`D`).
pub const TASK_UNINTERRUPTIBLE: i64 = 2;

/// `cpu_idle` state reported when a core leaves idle. The driver encodes it as
/// `(u32)-1`; every other value is the id of the idle state being entered.
pub const IDLE_EXIT: u32 = u32::MAX;

/// Direction of a binder transaction half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinderKind {
    Call,
    Reply,
    Async,
}

/// Thermal zone a temperature sample was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempSensor {
    Big,
    Little,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedSwitch {
    pub ts: u64,
    /// Thread being switched out.
    pub pid: u32,
    pub core: u32,
    pub prev_state: i64,
    pub next_pid: u32,
    #[serde(default)]
    pub prev_comm: String,
    #[serde(default)]
    pub next_comm: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreqChange {
    pub ts: u64,
    #[serde(default)]
    pub pid: u32,
    pub core: u32,
    /// New core frequency in Hz.
    pub freq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wakeup {
    pub ts: u64,
    pub pid: u32,
    pub core: u32,
    pub target_pid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Idle {
    pub ts: u64,
    #[serde(default)]
    pub pid: u32,
    pub core: u32,
    pub state: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinderCall {
    pub ts: u64,
    /// Thread issuing this half of the transaction.
    pub pid: u32,
    pub core: u32,
    pub kind: BinderKind,
    /// Destination process.
    pub dest_pid: u32,
    /// Destination thread, 0 when the kernel has not picked one yet.
    #[serde(default)]
    pub dest_thread: u32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub transaction: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaliUtil {
    pub ts: u64,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub core: u32,
    /// GPU frequency in Hz.
    pub freq: u64,
    /// GPU utilization in percent.
    pub util: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempInfo {
    pub ts: u64,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub core: u32,
    pub sensor: TempSensor,
    /// Degrees Celsius.
    pub temp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SchedSwitch(SchedSwitch),
    FreqChange(FreqChange),
    Wakeup(Wakeup),
    Idle(Idle),
    BinderCall(BinderCall),
    MaliUtil(MaliUtil),
    TempInfo(TempInfo),
}

impl Event {
    pub fn ts(&self) -> u64 {
        match self {
            Event::SchedSwitch(e) => e.ts,
            Event::FreqChange(e) => e.ts,
            Event::Wakeup(e) => e.ts,
            Event::Idle(e) => e.ts,
            Event::BinderCall(e) => e.ts,
            Event::MaliUtil(e) => e.ts,
            Event::TempInfo(e) => e.ts,
        }
    }

    /// Core whose per-core state this event touches. Mali and thermal
    /// samples carry no meaningful core.
    pub fn cpu(&self) -> Option<u32> {
        match self {
            Event::SchedSwitch(e) => Some(e.core),
            Event::FreqChange(e) => Some(e.core),
            Event::Idle(e) => Some(e.core),
            Event::BinderCall(e) => Some(e.core),
            Event::Wakeup(_) | Event::MaliUtil(_) | Event::TempInfo(_) => None,
        }
    }
}

/// Decide whether an event can influence the replay.
///
/// Every context switch is kept: threads woken by a binder transaction or
/// replying from an unlisted pool are only discovered during the replay, and
/// the tree ignores switches of threads it does not follow.
pub fn is_relevant(event: &Event) -> bool {
    !matches!(event, Event::Wakeup(_))
}

/// Reject events scheduled on a core the topology does not list.
pub fn check_cores(events: &[Event], topology: &Topology) -> Result<()> {
    for event in events {
        if let Some(core) = event.cpu() {
            topology
                .check_core(core)
                .with_context(|| format!("Invalid event at {}us", event.ts()))?;
        }
    }
    Ok(())
}

/// Parse a JSON-lines event stream.
///
/// Blank lines are skipped. Events that arrive out of timestamp order are
/// stably sorted; the engine requires a monotonic feed.
pub fn parse_events<R: BufRead>(reader: R) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let mut out_of_order = 0usize;
    let mut last_ts = 0u64;

    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read event line {}", idx + 1))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .with_context(|| format!("Invalid event on line {}", idx + 1))?;
        if event.ts() < last_ts {
            out_of_order += 1;
        }
        last_ts = last_ts.max(event.ts());
        events.push(event);
    }

    if out_of_order > 0 {
        warn!("{out_of_order} events were out of timestamp order, sorting the stream");
        events.sort_by_key(Event::ts);
    }

    Ok(events)
}

/// Read a JSON-lines event file.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open event file {}", path.display()))?;
    parse_events(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sched_switch() {
        let input = r#"{"type":"sched_switch","ts":10,"pid":5,"core":1,"prev_state":1,"next_pid":7,"prev_comm":"a","next_comm":"b"}"#;
        let events = parse_events(input.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::SchedSwitch(e) => {
                assert_eq!(e.ts, 10);
                assert_eq!(e.pid, 5);
                assert_eq!(e.core, 1);
                assert_eq!(e.prev_state, TASK_INTERRUPTIBLE);
                assert_eq!(e.next_pid, 7);
                assert_eq!(e.next_comm, "b");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_defaults() {
        let input = r#"{"type":"binder_call","ts":3,"pid":100,"core":0,"kind":"async","dest_pid":200}
{"type":"idle","ts":4,"core":2,"state":4294967295}"#;
        let events = parse_events(input.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::BinderCall(e) => {
                assert_eq!(e.kind, BinderKind::Async);
                assert_eq!(e.dest_thread, 0);
                assert_eq!(e.transaction, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            Event::Idle(e) => assert_eq!(e.state, IDLE_EXIT),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_skips_blank_lines() {
        let input = "\n{\"type\":\"freq_change\",\"ts\":1,\"core\":0,\"freq\":5}\n\n";
        let events = parse_events(input.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_parse_reports_line() {
        let input = "{\"type\":\"freq_change\",\"ts\":1,\"core\":0,\"freq\":5}\n{\"type\":\"bogus\"}";
        let err = parse_events(input.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn test_parse_sorts_out_of_order() {
        let input = "{\"type\":\"freq_change\",\"ts\":9,\"core\":0,\"freq\":5}\n{\"type\":\"freq_change\",\"ts\":2,\"core\":0,\"freq\":6}";
        let events = parse_events(input.as_bytes()).unwrap();
        assert_eq!(events[0].ts(), 2);
        assert_eq!(events[1].ts(), 9);
    }

    #[test]
    fn test_check_cores() {
        let topology = Topology::default();
        let input = "{\"type\":\"idle\",\"ts\":1,\"core\":7,\"state\":1}\n{\"type\":\"mali_util\",\"ts\":2,\"freq\":533000000,\"util\":5.0}";
        let events = parse_events(input.as_bytes()).unwrap();
        assert!(check_cores(&events, &topology).is_ok());

        let input = "{\"type\":\"idle\",\"ts\":3,\"core\":4000000000,\"state\":1}";
        let events = parse_events(input.as_bytes()).unwrap();
        let err = check_cores(&events, &topology).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Invalid event at 3us"));
        assert!(msg.contains("Core 4000000000"));
    }

    #[test]
    fn test_is_relevant() {
        let switch = |pid, next_pid| {
            Event::SchedSwitch(SchedSwitch {
                ts: 1,
                pid,
                core: 0,
                prev_state: TASK_RUNNING,
                next_pid,
                prev_comm: String::new(),
                next_comm: String::new(),
            })
        };
        assert!(is_relevant(&switch(0, 100)));
        assert!(is_relevant(&switch(100, 0)));
        // unlisted threads may still be discovered through binder
        assert!(is_relevant(&switch(5, 6)));

        let wakeup = Event::Wakeup(Wakeup {
            ts: 1,
            pid: 100,
            core: 0,
            target_pid: 100,
        });
        assert!(!is_relevant(&wakeup));

        let idle = Event::Idle(Idle {
            ts: 1,
            pid: 0,
            core: 0,
            state: 0,
        });
        assert!(is_relevant(&idle));
    }
}
