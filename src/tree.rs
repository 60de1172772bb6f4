//! The replay engine.
//!
//! [`ProcessTree`] owns every [`ProcessBranch`], the live core and GPU state
//! and the binder matching tables. Events are fed to
//! [`ProcessTree::handle_event`] one at a time in timestamp order; once the
//! stream is exhausted [`ProcessTree::finish_tree`] sums the energy of every
//! branch over the traced window.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, info, trace};

use crate::binder::{CompletedTransaction, PendingTransaction, TargetPids, TransactionTable};
use crate::branch::{BranchId, ProcessBranch, SwitchedIn};
use crate::core_state::{CoreTable, GpuBranch, StateChange};
use crate::event::{
    BinderCall, BinderKind, Event, FreqChange, Idle, MaliUtil, SchedSwitch, TempInfo,
};
use crate::graph::{EdgeKind, TaskGraph};
use crate::metrics::MetricsContext;
use crate::pid::{PidClassifier, ThreadClass, ThreadIdentity};
use crate::power::PowerModel;
use crate::report::{BranchEnergy, EnergyBucket, Totals, TreeStats, TreeSummary, UnitActivity};
use crate::snapshot::InitialMetrics;
use crate::task::{ClusterEnergy, DependencyKind, EnergyContext, Job, JobKind, TaskRef};

/// Inclusive timestamp range of the events to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: u64,
    pub end: u64,
}

impl TimeWindow {
    pub fn new(start: u64, end: u64) -> Self {
        TimeWindow { start, end }
    }

    pub fn all() -> Self {
        TimeWindow {
            start: 0,
            end: u64::MAX,
        }
    }

    pub fn contains(&self, ts: u64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::all()
    }
}

pub struct ProcessTree {
    metrics: MetricsContext,
    model: Box<dyn PowerModel>,
    classifier: Box<dyn PidClassifier>,
    branches: Vec<ProcessBranch>,
    by_pid: HashMap<u32, BranchId>,
    cores: CoreTable,
    gpu: GpuBranch,
    transactions: TransactionTable,
    graph: Option<TaskGraph>,
    series_interval_us: u64,
    stats: TreeStats,
}

impl ProcessTree {
    pub fn new(
        metrics: MetricsContext,
        model: Box<dyn PowerModel>,
        classifier: Box<dyn PidClassifier>,
        series_interval_us: u64,
    ) -> Self {
        let cores = CoreTable::new(metrics.topology().num_cores());
        ProcessTree {
            metrics,
            model,
            classifier,
            branches: Vec::new(),
            by_pid: HashMap::new(),
            cores,
            gpu: GpuBranch::new(),
            transactions: TransactionTable::new(),
            graph: None,
            series_interval_us: series_interval_us.max(1),
            stats: TreeStats::default(),
        }
    }

    /// Also build the task dependency graph while replaying.
    pub fn with_graph(mut self) -> Self {
        self.graph = Some(TaskGraph::new());
        self
    }

    pub fn graph(&self) -> Option<&TaskGraph> {
        self.graph.as_ref()
    }

    pub fn branches(&self) -> &[ProcessBranch] {
        &self.branches
    }

    pub fn branch(&self, pid: u32) -> Option<&ProcessBranch> {
        self.by_pid.get(&pid).map(|id| &self.branches[id.0])
    }

    pub fn cores(&self) -> &CoreTable {
        &self.cores
    }

    pub fn gpu(&self) -> &GpuBranch {
        &self.gpu
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// Set the core and GPU state the trace starts from. Utilization not
    /// given in `initial` comes from the compiled lookups, the GPU from the
    /// first Mali sample. Fails for a seeded core outside the topology.
    pub fn seed(&mut self, initial: &InitialMetrics) -> Result<()> {
        initial.check_cores(self.metrics.topology())?;
        let ncores = self.metrics.topology().num_cores();
        for core in 0..ncores as u32 {
            let seed = initial.core(core);
            let freq = seed.map_or(0, |s| s.freq);
            let util = seed
                .and_then(|s| s.util)
                .unwrap_or_else(|| self.metrics.util(core, 0));
            if freq == 0 {
                debug!("No initial frequency for cpu{core}");
            }
            self.cores.get_mut(core).seed(freq, util);
        }

        match &initial.gpu {
            Some(gpu) => self.gpu.seed(gpu.freq, gpu.util),
            None => {
                if let Some(first) = self.metrics.gpu().intervals().first() {
                    self.gpu.seed(first.freq, first.util);
                }
            }
        }
        Ok(())
    }

    fn create_branch(&mut self, identity: ThreadIdentity, class: ThreadClass) -> BranchId {
        let id = BranchId(self.branches.len());
        debug!(
            "New {class} branch for {}/{} ({})",
            identity.process, identity.thread, identity.pid
        );
        self.by_pid.insert(identity.pid, id);
        self.branches.push(ProcessBranch::new(id, identity, class));
        id
    }

    /// Branch of a followed thread, created on first use.
    fn branch_for(&mut self, pid: u32) -> Option<BranchId> {
        if let Some(id) = self.by_pid.get(&pid) {
            return Some(*id);
        }
        let class = self.classifier.classify(pid)?;
        let identity = self
            .classifier
            .identify(pid)
            .unwrap_or_else(|| ThreadIdentity::unnamed(pid));
        Some(self.create_branch(identity, class))
    }

    fn label(&self, ts: u64, core: u32, kind: JobKind) -> Job {
        Job::new(ts, core, kind).labeled(self.cores.freq(core), self.gpu.freq)
    }

    fn append_to_occupant(&mut self, core: u32, job: Job) {
        if let Some(id) = self.cores.get(core).and_then(|c| c.occupant()) {
            self.branches[id.0].append_job(job);
        }
    }

    /// Replay one event.
    ///
    /// `subgraph` attaches the event's tasks to the dependency graph when one
    /// is being built. Events outside `window` are counted and dropped. An
    /// event on a core outside the topology is an error.
    pub fn handle_event(&mut self, event: &Event, subgraph: bool, window: &TimeWindow) -> Result<()> {
        self.stats.events += 1;
        if !window.contains(event.ts()) {
            self.stats.out_of_window += 1;
            trace!("Dropping event at {} outside the window", event.ts());
            return Ok(());
        }
        if let Some(core) = event.cpu() {
            self.metrics.topology().check_core(core)?;
        }
        let subgraph = subgraph && self.graph.is_some();

        match event {
            Event::Wakeup(_) => Ok(()),
            Event::FreqChange(e) => {
                self.handle_freq_change(e, subgraph);
                Ok(())
            }
            Event::Idle(e) => {
                self.handle_idle(e);
                Ok(())
            }
            Event::MaliUtil(e) => {
                self.handle_gpu(e);
                Ok(())
            }
            Event::TempInfo(e) => {
                self.handle_temp(e);
                Ok(())
            }
            Event::SchedSwitch(e) => self.handle_switch(e, subgraph),
            Event::BinderCall(e) => {
                self.handle_binder(e, subgraph);
                Ok(())
            }
        }
    }

    fn handle_freq_change(&mut self, e: &FreqChange, subgraph: bool) {
        trace!("cpu{} -> {} Hz at {}", e.core, e.freq, e.ts);
        let core = self.cores.get_mut(e.core);
        let (prev_freq, prev_util) = (core.freq, core.util);
        let subscribers = core.subscribers().to_vec();

        let mut interrupted = Vec::new();
        for id in subscribers {
            if let Some(task) =
                self.branches[id.0].on_core_freq_change(e.ts, e.core, prev_freq, prev_util, &self.gpu)
            {
                interrupted.push(task);
            }
        }

        let job = self.label(e.ts, e.core, JobKind::FreqChange { freq: e.freq });
        self.append_to_occupant(e.core, job);
        self.cores.get_mut(e.core).set_freq(e.ts, e.freq);

        if subgraph {
            if let Some(graph) = &mut self.graph {
                graph.add_freq_change(e.core, e.ts, e.freq, &interrupted);
            }
        }
    }

    fn handle_idle(&mut self, e: &Idle) {
        let util = self.metrics.util(e.core, e.ts);
        self.cores.get_mut(e.core).set_util(e.ts, util);
        let job = self.label(e.ts, e.core, JobKind::Idle { state: e.state });
        self.append_to_occupant(e.core, job);
    }

    fn handle_gpu(&mut self, e: &MaliUtil) {
        self.gpu.update(e.ts, e.freq, e.util);
        let job = self.label(
            e.ts,
            e.core,
            JobKind::GpuUtil {
                freq: e.freq,
                util: e.util,
            },
        );
        self.append_to_occupant(e.core, job);
    }

    fn handle_temp(&mut self, e: &TempInfo) {
        let job = self.label(
            e.ts,
            e.core,
            JobKind::Temp {
                sensor: e.sensor,
                temp: e.temp,
            },
        );
        self.append_to_occupant(e.core, job);
    }

    fn handle_switch(&mut self, e: &SchedSwitch, subgraph: bool) -> Result<()> {
        trace!("cpu{}: {} -> {} at {}", e.core, e.pid, e.next_pid, e.ts);
        if e.pid != 0 {
            if let Some(id) = self.by_pid.get(&e.pid).copied() {
                let job = self.label(
                    e.ts,
                    e.core,
                    JobKind::SwitchOut {
                        prev_state: e.prev_state,
                    },
                );
                let ctx = EnergyContext::new(&self.metrics, self.model.as_ref());
                self.branches[id.0].switch_out(job, e.prev_state, &self.cores, &ctx)?;
            }
        }
        self.cores.get_mut(e.core).set_occupant(None);

        if e.next_pid != 0 {
            self.switch_in(e.ts, e.core, e.next_pid, subgraph);
        }
        Ok(())
    }

    fn switch_in(&mut self, ts: u64, core: u32, pid: u32, subgraph: bool) {
        let Some(completed) = self.transactions.take_completed_for(pid) else {
            if let Some(id) = self.branch_for(pid) {
                self.deliver_switch_in(id, ts, core, None, subgraph);
            }
            return;
        };

        let id = match self.by_pid.get(&pid).copied() {
            Some(id) => id,
            None => match self.classifier.identify(pid) {
                Some(identity) => {
                    let class = self
                        .classifier
                        .classify(pid)
                        .unwrap_or(ThreadClass::Discovered);
                    self.create_branch(identity, class)
                }
                None => {
                    self.stats.unidentified_targets += 1;
                    debug!(
                        "Discarding transaction {} from {}: pid {pid} cannot be identified",
                        completed.send.transaction, completed.send.pid
                    );
                    return;
                }
            },
        };

        let node = match completed.node {
            Some(node) => Some(node),
            None if completed.is_async() => Some(self.emit_async_node(id, &completed, ts, core)),
            None => None,
        };
        let caller = completed.caller.or_else(|| {
            self.by_pid
                .get(&completed.send.pid)
                .and_then(|caller| self.branches[caller.0].last_task_ref())
        });

        let switched = self.deliver_switch_in(id, ts, core, node, subgraph);

        let Some(node) = node else {
            return;
        };
        if let Some(task) = self.branches[node.branch.0].task_mut(node) {
            task.dependency.depender = Some(switched.task);
        }
        debug!(
            "Transaction {} from {} woke {pid} at {ts}",
            completed.send.transaction, completed.send.pid
        );

        if subgraph {
            let node_pid = self.branches[node.branch.0].pid();
            if let Some(graph) = &mut self.graph {
                graph.add_task(node, node_pid, completed.send.ts);
                if let Some(caller) = caller {
                    graph.link(caller, node, EdgeKind::Draw);
                }
                graph.link(node, switched.task, EdgeKind::Binder);
            }
        }
    }

    /// Binder node for an ASYNC transaction, spanning from the send to the
    /// wake of the destination.
    fn emit_async_node(
        &mut self,
        id: BranchId,
        completed: &CompletedTransaction,
        ts: u64,
        core: u32,
    ) -> TaskRef {
        let send = &completed.send;
        let send_job = Job::new(
            send.ts,
            send.core,
            JobKind::BinderSend {
                transaction: send.transaction,
                peer: send.pid,
            },
        );
        let recv_job = self.label(
            ts,
            core,
            JobKind::BinderRecv {
                transaction: send.transaction,
                peer: send.pid,
            },
        );
        let branch = &mut self.branches[id.0];
        let node = branch.open_binder(send_job);
        branch.close_binder(recv_job);
        if let Some(task) = branch.task_mut(node) {
            task.dependency.kind = DependencyKind::Binder;
            task.dependency.dependee = completed.caller;
        }
        node
    }

    fn deliver_switch_in(
        &mut self,
        id: BranchId,
        ts: u64,
        core: u32,
        binder: Option<TaskRef>,
        subgraph: bool,
    ) -> SwitchedIn {
        let job = self.label(ts, core, JobKind::SwitchIn);
        let switched = self.branches[id.0].switch_in(job, &mut self.cores, &self.gpu, binder);
        self.cores.get_mut(core).set_occupant(Some(id));

        if subgraph && switched.opened {
            let branch = &self.branches[id.0];
            if let Some(graph) = &mut self.graph {
                graph.add_task(switched.task, branch.pid(), ts);
                if let Some(task) = branch.task(switched.task) {
                    if let (DependencyKind::Task, Some(prev)) =
                        (task.dependency.kind, task.dependency.dependee)
                    {
                        graph.link(prev, switched.task, EdgeKind::Task);
                    }
                }
            }
        }
        switched
    }

    fn handle_binder(&mut self, e: &BinderCall, subgraph: bool) {
        match e.kind {
            BinderKind::Call | BinderKind::Async => self.handle_binder_send(e),
            BinderKind::Reply => self.handle_binder_reply(e, subgraph),
        }
    }

    fn handle_binder_send(&mut self, e: &BinderCall) {
        match self.classifier.classify(e.pid) {
            Some(ThreadClass::App | ThreadClass::System) => {}
            _ => {
                trace!("Ignoring transaction {} from pid {}", e.transaction, e.pid);
                return;
            }
        }
        let Some(target) = TargetPids::resolve(e.dest_thread, e.dest_pid, self.classifier.as_ref())
        else {
            self.stats.unresolved_transactions += 1;
            debug!(
                "Transaction {} from {} to process {} has no known destination thread",
                e.transaction, e.pid, e.dest_pid
            );
            return;
        };
        let Some(id) = self.branch_for(e.pid) else {
            return;
        };

        let job = self.label(
            e.ts,
            e.core,
            JobKind::BinderSend {
                transaction: e.transaction,
                peer: e.dest_pid,
            },
        );
        let branch = &mut self.branches[id.0];
        let caller = branch.current_task_ref();
        branch.append_job(job);

        if e.kind == BinderKind::Async {
            self.transactions.add_completed(CompletedTransaction {
                send: e.clone(),
                recv: None,
                caller,
                node: None,
                target,
            });
        } else {
            self.transactions.add_pending(PendingTransaction {
                send: e.clone(),
                caller,
                target,
            });
        }
    }

    fn handle_binder_reply(&mut self, e: &BinderCall, subgraph: bool) {
        let Some(pending) = self.transactions.match_reply(e.pid) else {
            self.stats.dropped_replies += 1;
            debug!("Dropping reply {} from {}: no pending call", e.transaction, e.pid);
            return;
        };

        let id = match self.branch_for(e.pid) {
            Some(id) => id,
            None => {
                let identity = self
                    .classifier
                    .identify(e.pid)
                    .unwrap_or_else(|| ThreadIdentity::unnamed(e.pid));
                self.create_branch(identity, ThreadClass::Binder)
            }
        };

        let send = &pending.send;
        let send_job = Job::new(
            send.ts,
            send.core,
            JobKind::BinderSend {
                transaction: send.transaction,
                peer: send.pid,
            },
        );
        let recv_job = self.label(
            e.ts,
            e.core,
            JobKind::BinderRecv {
                transaction: e.transaction,
                peer: e.dest_pid,
            },
        );
        let branch = &mut self.branches[id.0];
        let node = branch.open_binder(send_job);
        branch.close_binder(recv_job);
        if let Some(task) = branch.task_mut(node) {
            task.dependency.kind = DependencyKind::Binder;
            task.dependency.dependee = pending.caller;
        }

        if subgraph {
            if let Some(graph) = &mut self.graph {
                graph.add_task(node, e.pid, send.ts);
            }
        }

        let target = if e.dest_thread != 0 {
            TargetPids::Thread(e.dest_thread)
        } else {
            TargetPids::Thread(send.pid)
        };
        trace!(
            "Reply {} from {} matched call {} from {}",
            e.transaction,
            e.pid,
            send.transaction,
            send.pid
        );
        self.transactions.add_completed(CompletedTransaction {
            send: pending.send,
            recv: Some(e.clone()),
            caller: pending.caller,
            node: Some(node),
            target,
        });
    }

    /// Sum the energy of every branch over the span of the finished tasks.
    pub fn finish_tree(&self) -> Result<TreeSummary> {
        let mut stats = self.stats;
        stats.leaked_pending = self.transactions.pending_len() as u64;
        stats.unmatched_completions = self.transactions.completed_len() as u64;

        let finished = self
            .branches
            .iter()
            .flat_map(|b| b.tasks.iter())
            .filter_map(|t| t.finish_time.map(|finish| (t.start_time, finish)));
        let span = finished.fold(None, |acc: Option<(u64, u64)>, (start, finish)| match acc {
            Some((s, f)) => Some((s.min(start), f.max(finish))),
            None => Some((start, finish)),
        });

        let Some((start, finish)) = span else {
            info!("No finished tasks, nothing to attribute");
            return Ok(TreeSummary {
                start_time: None,
                finish_time: None,
                branches: Vec::new(),
                totals: Totals::default(),
                series: Vec::new(),
                activity: Vec::new(),
                stats,
            });
        };

        let gpu = self.metrics.gpu();
        let temps = self.metrics.temp_lookup();
        let gpu_joules = gpu.energy(start, finish, self.model.as_ref(), temps)?;

        let mut cpu = ClusterEnergy::default();
        let mut rows = Vec::new();
        for branch in self.branches.iter().filter(|b| !b.is_empty()) {
            let window = branch.get_task_energy(start, finish);
            cpu += window.energy;
            rows.push(BranchEnergy {
                pid: branch.pid(),
                process: branch.identity.process.clone(),
                thread: branch.identity.thread.clone(),
                class: branch.class,
                tasks: branch.tasks.len(),
                binders: branch.binders.len(),
                big_joules: window.energy.big,
                little_joules: window.energy.little,
                total_joules: window.energy.total(),
                duration_us: window.duration,
                cycles: window.cycles,
            });
        }
        rows.sort_by(|a, b| b.total_joules.total_cmp(&a.total_joules));

        let mut series = Vec::new();
        let mut bucket_start = start;
        while bucket_start < finish {
            let bucket_end = bucket_start
                .saturating_add(self.series_interval_us)
                .min(finish);
            let cpu_joules: f64 = self
                .branches
                .iter()
                .map(|b| b.get_task_energy(bucket_start, bucket_end).energy.total())
                .sum();
            series.push(EnergyBucket {
                start: bucket_start,
                end: bucket_end,
                cpu_joules,
                gpu_joules: gpu.energy(bucket_start, bucket_end, self.model.as_ref(), temps)?,
            });
            bucket_start = bucket_end;
        }

        let in_window = |log: &[StateChange]| {
            log.iter()
                .filter(|c| c.ts >= start && c.ts <= finish)
                .count()
        };
        let mut activity: Vec<UnitActivity> = self
            .cores
            .iter()
            .map(|core| UnitActivity {
                unit: format!("cpu{}", core.core),
                changes: in_window(core.log()),
                freq: core.freq,
                util: core.util,
            })
            .collect();
        activity.push(UnitActivity {
            unit: "gpu".to_string(),
            changes: in_window(self.gpu.log()),
            freq: self.gpu.freq,
            util: self.gpu.util,
        });

        let totals = Totals {
            big_joules: cpu.big,
            little_joules: cpu.little,
            gpu_joules,
            total_joules: cpu.total() + gpu_joules,
        };
        info!(
            "{} threads, {:.6} J over [{start}, {finish}]",
            rows.len(),
            totals.total_joules
        );

        Ok(TreeSummary {
            start_time: Some(start),
            finish_time: Some(finish),
            branches: rows,
            totals,
            series,
            activity,
            stats,
        })
    }
}
