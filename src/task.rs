//! Task timelines and their energy accounting.
//!
//! A [`Task`] is one contiguous awake span of a thread, from the switch-in
//! after a sleep to the switch-out into the next sleep. Energy is integrated
//! incrementally: every time the operating point of the task's core changes
//! a [`FreqPowerEvent`] snapshot of the outgoing point is queued, and on the
//! final switch-out the queue is drained in order, each snapshot costing the
//! sub-interval that ends at it. The tail after the last snapshot is costed
//! at the current frequency.

use std::ops::AddAssign;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::branch::BranchId;
use crate::event::TempSensor;
use crate::metrics::MetricsContext;
use crate::power::{CoreClass, PowerModel};

/// Everything energy integration reads from.
#[derive(Clone, Copy)]
pub struct EnergyContext<'a> {
    pub metrics: &'a MetricsContext,
    pub model: &'a dyn PowerModel,
}

impl<'a> EnergyContext<'a> {
    pub fn new(metrics: &'a MetricsContext, model: &'a dyn PowerModel) -> Self {
        EnergyContext { metrics, model }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A scheduled run of the thread.
    Task,
    /// One hop of a binder transaction serviced by this thread.
    Binder,
}

/// Stable handle to a task inside the tree's branch arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskRef {
    pub branch: BranchId,
    pub kind: TaskKind,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    None,
    /// Successive tasks of the same thread.
    Task,
    /// Woken by a binder transaction from another thread.
    Binder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Dependency {
    pub kind: DependencyKind,
    /// The task this one depends on.
    pub dependee: Option<TaskRef>,
    /// The task depending on this one.
    pub depender: Option<TaskRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobKind {
    SwitchIn,
    SwitchOut { prev_state: i64 },
    FreqChange { freq: u64 },
    Idle { state: u32 },
    Temp { sensor: TempSensor, temp: f64 },
    GpuUtil { freq: u64, util: f64 },
    BinderSend { transaction: u64, peer: u32 },
    BinderRecv { transaction: u64, peer: u32 },
}

/// One event recorded against a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Job {
    pub ts: u64,
    pub core: u32,
    pub kind: JobKind,
    /// Core frequency when the job was recorded, for labeling.
    pub freq: u64,
    /// GPU frequency when the job was recorded, for labeling.
    pub gpu_freq: u64,
}

impl Job {
    pub fn new(ts: u64, core: u32, kind: JobKind) -> Self {
        Job {
            ts,
            core,
            kind,
            freq: 0,
            gpu_freq: 0,
        }
    }

    pub fn labeled(mut self, freq: u64, gpu_freq: u64) -> Self {
        self.freq = freq;
        self.gpu_freq = gpu_freq;
        self
    }
}

/// Operating point of the interval ending at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FreqPowerEvent {
    pub time: u64,
    pub core: u32,
    pub cpu_frequency: u64,
    pub cpu_util: f64,
    pub gpu_frequency: u64,
    pub gpu_util: f64,
}

/// Joules per CPU cluster.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ClusterEnergy {
    pub big: f64,
    pub little: f64,
}

impl ClusterEnergy {
    pub fn add(&mut self, class: CoreClass, joules: f64) {
        match class {
            CoreClass::Big => self.big += joules,
            CoreClass::Little => self.little += joules,
            // the GPU is accounted separately and never reaches a task
            CoreClass::Gpu => debug_assert!(false, "GPU energy booked to a CPU cluster"),
        }
    }

    pub fn total(&self) -> f64 {
        self.big + self.little
    }

    pub fn scaled(&self, factor: f64) -> Self {
        ClusterEnergy {
            big: self.big * factor,
            little: self.little * factor,
        }
    }
}

impl AddAssign for ClusterEnergy {
    fn add_assign(&mut self, other: Self) {
        self.big += other.big;
        self.little += other.little;
    }
}

/// Fraction of the cluster's power drawn on behalf of `util`'s core.
fn core_share(util: f64, cluster: &[f64]) -> f64 {
    let sum: f64 = cluster.iter().sum();
    if sum <= 0.0 {
        return 1.0 / cluster.len().max(1) as f64;
    }
    (util / sum).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub pid: u32,
    pub jobs: Vec<Job>,
    pub start_time: u64,
    pub finish_time: Option<u64>,
    pub cpu_cycles: f64,
    pub energy: ClusterEnergy,
    /// Microseconds actually costed.
    pub duration: u64,
    pub dependency: Dependency,
    calc_time: u64,
    pending: Vec<FreqPowerEvent>,
}

impl Task {
    pub fn new(kind: TaskKind, pid: u32, first: Job) -> Self {
        Task {
            kind,
            pid,
            jobs: vec![first],
            start_time: first.ts,
            finish_time: None,
            cpu_cycles: 0.0,
            energy: ClusterEnergy::default(),
            duration: 0,
            dependency: Dependency::default(),
            calc_time: first.ts,
            pending: Vec::new(),
        }
    }

    pub fn add_job(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn last_ts(&self) -> u64 {
        self.jobs.last().map_or(self.start_time, |job| job.ts)
    }

    pub fn calc_time(&self) -> u64 {
        self.calc_time
    }

    pub fn pending(&self) -> &[FreqPowerEvent] {
        &self.pending
    }

    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some()
    }

    /// Queue the outgoing operating point of `core`. Must be called before
    /// the shared core state is overwritten with the new values.
    pub fn add_cpu_gpu_event(
        &mut self,
        ts: u64,
        core: u32,
        freq: u64,
        util: f64,
        gpu_freq: u64,
        gpu_util: f64,
    ) {
        self.pending.push(FreqPowerEvent {
            time: ts,
            core,
            cpu_frequency: freq,
            cpu_util: util,
            gpu_frequency: gpu_freq,
            gpu_util,
        });
    }

    /// Cost `[calc_time, until)` at `freq` on `core`.
    fn integrate(&mut self, until: u64, core: u32, freq: u64, ctx: &EnergyContext) -> Result<()> {
        if until <= self.calc_time {
            return Ok(());
        }
        let elapsed = until - self.calc_time;
        self.calc_time = until;
        if freq == 0 {
            return Ok(());
        }

        let cycles = elapsed as f64 * 1e-6 * freq as f64;
        let metrics = ctx.metrics;
        let class = metrics.topology().class_of(core);
        let utils = metrics.cluster_utils(class, until);
        let temps = metrics.temps(until);

        let watts = ctx.model.power(class, freq, &utils, &temps)?;
        let share = core_share(metrics.util(core, until), &utils);
        let per_cycle = watts * share / freq as f64;

        self.energy.add(class, per_cycle * cycles);
        self.cpu_cycles += cycles;
        self.duration += elapsed;
        Ok(())
    }

    /// Drain the queued snapshots in order, then cost the remainder up to
    /// `ts` at the current frequency of `core`.
    pub fn flush(&mut self, ts: u64, core: u32, freq: u64, ctx: &EnergyContext) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for pe in pending {
            self.integrate(pe.time, pe.core, pe.cpu_frequency, ctx)?;
        }
        if self.calc_time != ts {
            self.integrate(ts, core, freq, ctx)?;
        }
        Ok(())
    }

    /// Close the task at its last recorded job. Returns false, leaving the
    /// task untouched, if it was already finished.
    pub fn finish(&mut self) -> bool {
        if self.finish_time.is_some() {
            warn!("Task of pid {} finished twice", self.pid);
            return false;
        }
        self.finish_time = Some(self.last_ts());
        true
    }

    /// `finish_time - start_time`, 0 while the task is open.
    pub fn span(&self) -> u64 {
        self.finish_time
            .map_or(0, |finish| finish.saturating_sub(self.start_time))
    }

    /// Share of this task that lies inside `[start, end]`.
    ///
    /// Open and zero-length tasks have no share.
    pub fn window_fraction(&self, start: u64, end: u64) -> f64 {
        let Some(finish) = self.finish_time else {
            return 0.0;
        };
        let span = self.span();
        if span == 0 {
            return 0.0;
        }
        let from = self.start_time.max(start);
        let to = finish.min(end);
        if to <= from {
            return 0.0;
        }
        (to - from) as f64 / span as f64
    }
}
