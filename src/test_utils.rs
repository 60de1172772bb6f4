//! Shared fixtures for unit tests.

use anyhow::Result;

use crate::config::Topology;
use crate::event::{BinderCall, BinderKind, Event, FreqChange, SchedSwitch};
use crate::metrics::MetricsContext;
use crate::pid::{PidTable, ThreadClass, ThreadIdentity};
use crate::power::{CoreClass, PowerModel, Temperatures};

/// Draws the same power at every operating point.
pub struct FlatModel {
    watts: f64,
}

impl FlatModel {
    pub fn new(watts: f64) -> Self {
        FlatModel { watts }
    }
}

impl PowerModel for FlatModel {
    fn power(&self, _: CoreClass, _: u64, _: &[f64], _: &Temperatures) -> Result<f64> {
        Ok(self.watts)
    }
}

/// Power proportional to frequency: `watts_per_ghz * freq / 1e9`.
pub struct FreqModel {
    watts_per_ghz: f64,
}

impl FreqModel {
    pub fn new(watts_per_ghz: f64) -> Self {
        FreqModel { watts_per_ghz }
    }
}

impl PowerModel for FreqModel {
    fn power(&self, _: CoreClass, freq: u64, _: &[f64], _: &Temperatures) -> Result<f64> {
        Ok(self.watts_per_ghz * freq as f64 / 1e9)
    }
}

/// One little core (0) and one big core (1), so a task on either core is
/// charged the whole cluster power.
pub fn test_topology() -> Topology {
    Topology {
        little: vec![0],
        big: vec![1],
    }
}

/// Every core busy, 25 degC everywhere.
pub fn test_metrics() -> MetricsContext {
    MetricsContext::constant(test_topology(), 25.0)
}

/// App thread 100, system thread 300, binder threads 201 and 202 of process
/// 200, and the unfollowed thread 400.
pub fn test_pids() -> PidTable {
    let mut table = PidTable::new();
    table
        .add(ThreadClass::App, ThreadIdentity::new(100, "com.example", "main"))
        .expect("add app");
    table
        .add(
            ThreadClass::System,
            ThreadIdentity::new(300, "system_server", "am"),
        )
        .expect("add system");
    table
        .add_binder(200, ThreadIdentity::new(201, "surfaceflinger", "binder:200_1"))
        .expect("add binder");
    table
        .add_binder(200, ThreadIdentity::new(202, "surfaceflinger", "binder:200_2"))
        .expect("add binder");
    table
        .add_known(ThreadIdentity::new(400, "audioserver", "audioserver"))
        .expect("add known");
    table
}

pub fn switch(ts: u64, core: u32, pid: u32, prev_state: i64, next_pid: u32) -> Event {
    Event::SchedSwitch(SchedSwitch {
        ts,
        pid,
        core,
        prev_state,
        next_pid,
        prev_comm: String::new(),
        next_comm: String::new(),
    })
}

pub fn freq(ts: u64, core: u32, freq: u64) -> Event {
    Event::FreqChange(FreqChange {
        ts,
        pid: 0,
        core,
        freq,
    })
}

pub fn binder(ts: u64, pid: u32, kind: BinderKind, dest_pid: u32, dest_thread: u32) -> Event {
    Event::BinderCall(BinderCall {
        ts,
        pid,
        core: 0,
        kind,
        dest_pid,
        dest_thread,
        flags: 0,
        transaction: ts,
    })
}
