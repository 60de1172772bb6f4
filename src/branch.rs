//! Per-thread state machine.
//!
//! A [`ProcessBranch`] follows one thread. It is INACTIVE while the thread
//! sleeps and ACTIVE from the switch-in that wakes it until the switch-out
//! that puts it back to sleep; each ACTIVE period is one [`Task`]. A
//! preemption (switch-out in any state other than interruptible sleep) keeps
//! the task open.
//!
//! While the thread is followed, the branch is subscribed to the core it last
//! ran on so that frequency changes of that core are snapshotted into the
//! open task.

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::core_state::{CoreTable, GpuBranch};
use crate::event::TASK_INTERRUPTIBLE;
use crate::pid::{ThreadClass, ThreadIdentity};
use crate::task::{
    ClusterEnergy, Dependency, DependencyKind, EnergyContext, Job, Task, TaskKind, TaskRef,
};

/// Index of a branch in the tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BranchId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Inactive,
    Active,
}

/// Result of delivering a switch-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchedIn {
    /// The open task after the switch-in.
    pub task: TaskRef,
    /// True if the switch-in opened `task`.
    pub opened: bool,
}

/// Energy, costed time and cycles of a branch inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowEnergy {
    pub energy: ClusterEnergy,
    pub duration: f64,
    pub cycles: f64,
}

#[derive(Debug, Clone)]
pub struct ProcessBranch {
    pub id: BranchId,
    pub identity: ThreadIdentity,
    pub class: ThreadClass,
    pub tasks: Vec<Task>,
    pub binders: Vec<Task>,
    active: bool,
    current_core: Option<u32>,
    // indexes into `binders` of nodes not closed yet, most recent last
    open_binders: Vec<usize>,
}

impl ProcessBranch {
    pub fn new(id: BranchId, identity: ThreadIdentity, class: ThreadClass) -> Self {
        ProcessBranch {
            id,
            identity,
            class,
            tasks: Vec::new(),
            binders: Vec::new(),
            active: false,
            current_core: None,
            open_binders: Vec::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.identity.pid
    }

    pub fn state(&self) -> BranchState {
        if self.active {
            BranchState::Active
        } else {
            BranchState::Inactive
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn current_core(&self) -> Option<u32> {
        self.current_core
    }

    fn task_ref(&self, kind: TaskKind, index: usize) -> TaskRef {
        TaskRef {
            branch: self.id,
            kind,
            index,
        }
    }

    /// The task currently open, if any.
    pub fn current_task(&self) -> Option<&Task> {
        if self.active {
            self.tasks.last()
        } else {
            None
        }
    }

    fn current_task_mut(&mut self) -> Option<&mut Task> {
        if self.active {
            self.tasks.last_mut()
        } else {
            None
        }
    }

    pub fn current_task_ref(&self) -> Option<TaskRef> {
        if self.active && !self.tasks.is_empty() {
            Some(self.task_ref(TaskKind::Task, self.tasks.len() - 1))
        } else {
            None
        }
    }

    /// The most recent task, open or not.
    pub fn last_task_ref(&self) -> Option<TaskRef> {
        self.tasks
            .len()
            .checked_sub(1)
            .map(|index| self.task_ref(TaskKind::Task, index))
    }

    pub fn task(&self, task: TaskRef) -> Option<&Task> {
        match task.kind {
            TaskKind::Task => self.tasks.get(task.index),
            TaskKind::Binder => self.binders.get(task.index),
        }
    }

    pub fn task_mut(&mut self, task: TaskRef) -> Option<&mut Task> {
        match task.kind {
            TaskKind::Task => self.tasks.get_mut(task.index),
            TaskKind::Binder => self.binders.get_mut(task.index),
        }
    }

    /// The thread was switched in on `job.core`.
    ///
    /// On a core change the branch moves its subscription, snapshotting the
    /// old core's operating point first if the task is open and the
    /// frequencies differ. `binder` is the binder node that woke the thread,
    /// it replaces the same-thread dependency.
    pub fn switch_in(
        &mut self,
        job: Job,
        cores: &mut CoreTable,
        gpu: &GpuBranch,
        binder: Option<TaskRef>,
    ) -> SwitchedIn {
        let core = job.core;
        if self.current_core != Some(core) {
            if let Some(old) = self.current_core {
                let old_freq = cores.freq(old);
                let old_util = cores.util(old);
                if old_freq != cores.freq(core) {
                    if let Some(task) = self.current_task_mut() {
                        task.add_cpu_gpu_event(job.ts, old, old_freq, old_util, gpu.freq, gpu.util);
                    }
                }
                cores.get_mut(old).unsubscribe(self.id);
            }
            cores.get_mut(core).subscribe(self.id);
            self.current_core = Some(core);
        }

        if self.active {
            let task_ref = self.task_ref(TaskKind::Task, self.tasks.len() - 1);
            if let Some(task) = self.current_task_mut() {
                task.add_job(job);
                if let Some(binder) = binder {
                    task.dependency = Dependency {
                        kind: DependencyKind::Binder,
                        dependee: Some(binder),
                        depender: Some(task_ref),
                    };
                }
            }
            return SwitchedIn {
                task: task_ref,
                opened: false,
            };
        }

        let this = self.task_ref(TaskKind::Task, self.tasks.len());
        let mut task = Task::new(TaskKind::Task, self.pid(), job);
        match binder {
            Some(binder) => {
                task.dependency = Dependency {
                    kind: DependencyKind::Binder,
                    dependee: Some(binder),
                    depender: Some(this),
                };
            }
            None => {
                let prev = self.last_task_ref();
                if let Some(prev_task) = self.tasks.last_mut() {
                    prev_task.dependency.depender = Some(this);
                    task.dependency = Dependency {
                        kind: DependencyKind::Task,
                        dependee: prev,
                        depender: None,
                    };
                }
            }
        }
        self.tasks.push(task);
        self.active = true;

        SwitchedIn {
            task: this,
            opened: true,
        }
    }

    /// The thread was switched out. Returns the task this closed, if the
    /// thread went to sleep.
    pub fn switch_out(
        &mut self,
        job: Job,
        prev_state: i64,
        cores: &CoreTable,
        ctx: &EnergyContext,
    ) -> Result<Option<TaskRef>> {
        if !self.active {
            return Ok(None);
        }
        let task_ref = self.task_ref(TaskKind::Task, self.tasks.len() - 1);
        let Some(task) = self.tasks.last_mut() else {
            return Ok(None);
        };
        task.add_job(job);
        if prev_state != TASK_INTERRUPTIBLE {
            return Ok(None);
        }

        task.flush(job.ts, job.core, cores.freq(job.core), ctx)?;
        task.finish();
        debug!(
            "{}/{} ({}) task {} done: {}us span, {}us costed, {:.0} cycles, {:.6} J big, {:.6} J little",
            self.identity.process,
            self.identity.thread,
            self.identity.pid,
            task_ref.index,
            task.span(),
            task.duration,
            task.cpu_cycles,
            task.energy.big,
            task.energy.little,
        );
        self.active = false;
        Ok(Some(task_ref))
    }

    /// The core this branch is subscribed to is about to change frequency;
    /// `prev_freq`/`prev_util` are the values being replaced.
    pub fn on_core_freq_change(
        &mut self,
        ts: u64,
        core: u32,
        prev_freq: u64,
        prev_util: f64,
        gpu: &GpuBranch,
    ) -> Option<TaskRef> {
        let task_ref = self.current_task_ref()?;
        let task = self.current_task_mut()?;
        task.add_cpu_gpu_event(ts, core, prev_freq, prev_util, gpu.freq, gpu.util);
        Some(task_ref)
    }

    /// Record a job against the open task without changing state.
    pub fn append_job(&mut self, job: Job) -> bool {
        match self.current_task_mut() {
            Some(task) => {
                task.add_job(job);
                true
            }
            None => false,
        }
    }

    /// Open a binder node starting with `job`.
    pub fn open_binder(&mut self, job: Job) -> TaskRef {
        let index = self.binders.len();
        self.binders
            .push(Task::new(TaskKind::Binder, self.pid(), job));
        self.open_binders.push(index);
        self.task_ref(TaskKind::Binder, index)
    }

    /// Close the most recently opened binder node with `job`.
    pub fn close_binder(&mut self, job: Job) -> Option<TaskRef> {
        let index = self.open_binders.pop()?;
        let node = self.binders.get_mut(index)?;
        node.add_job(job);
        node.finish();
        Some(self.task_ref(TaskKind::Binder, index))
    }

    /// True if no task was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Overlap-weighted energy of the finished tasks inside `[start, end]`.
    pub fn get_task_energy(&self, start: u64, end: u64) -> WindowEnergy {
        let mut total = WindowEnergy::default();
        for task in &self.tasks {
            if task.start_time > end {
                break;
            }
            let fraction = task.window_fraction(start, end);
            if fraction <= 0.0 {
                continue;
            }
            total.energy += task.energy.scaled(fraction);
            total.duration += task.duration as f64 * fraction;
            total.cycles += task.cpu_cycles * fraction;
        }
        total
    }
}
