//! Live per-core and GPU operating state during the main pass.
//!
//! Each [`CoreBranch`] keeps the current and previous frequency/utilization of
//! one core, the branches subscribed to its frequency changes and the branch
//! currently running on it. The tree is the only writer; it notifies the
//! subscribers before it overwrites the current values, so a subscriber always
//! sees the outgoing operating point.

use serde::Serialize;

use crate::branch::BranchId;

/// One recorded change of a core or of the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateChange {
    pub ts: u64,
    pub freq: u64,
    pub util: f64,
}

#[derive(Debug, Clone)]
pub struct CoreBranch {
    pub core: u32,
    pub freq: u64,
    pub util: f64,
    pub prev_freq: u64,
    pub prev_util: f64,
    log: Vec<StateChange>,
    subscribers: Vec<BranchId>,
    occupant: Option<BranchId>,
}

impl CoreBranch {
    pub fn new(core: u32) -> Self {
        CoreBranch {
            core,
            freq: 0,
            util: 0.0,
            prev_freq: 0,
            prev_util: 0.0,
            log: Vec::new(),
            subscribers: Vec::new(),
            occupant: None,
        }
    }

    /// Seed the state before replay starts. Not logged.
    pub fn seed(&mut self, freq: u64, util: f64) {
        self.freq = freq;
        self.util = util;
        self.prev_freq = freq;
        self.prev_util = util;
    }

    pub fn set_freq(&mut self, ts: u64, freq: u64) {
        self.prev_freq = self.freq;
        self.prev_util = self.util;
        self.freq = freq;
        self.log.push(StateChange {
            ts,
            freq,
            util: self.util,
        });
    }

    pub fn set_util(&mut self, ts: u64, util: f64) {
        if util == self.util {
            return;
        }
        self.prev_freq = self.freq;
        self.prev_util = self.util;
        self.util = util;
        self.log.push(StateChange {
            ts,
            freq: self.freq,
            util,
        });
    }

    pub fn log(&self) -> &[StateChange] {
        &self.log
    }

    pub fn subscribe(&mut self, branch: BranchId) {
        if !self.subscribers.contains(&branch) {
            self.subscribers.push(branch);
        }
    }

    pub fn unsubscribe(&mut self, branch: BranchId) {
        self.subscribers.retain(|b| *b != branch);
    }

    pub fn subscribers(&self) -> &[BranchId] {
        &self.subscribers
    }

    pub fn occupant(&self) -> Option<BranchId> {
        self.occupant
    }

    pub fn set_occupant(&mut self, branch: Option<BranchId>) {
        self.occupant = branch;
    }
}

/// Every core of the device, indexed by core id.
#[derive(Debug, Clone, Default)]
pub struct CoreTable {
    cores: Vec<CoreBranch>,
}

impl CoreTable {
    pub fn new(ncores: usize) -> Self {
        CoreTable {
            cores: (0..ncores as u32).map(CoreBranch::new).collect(),
        }
    }

    /// Core `core`, created on first use.
    pub fn get_mut(&mut self, core: u32) -> &mut CoreBranch {
        let idx = core as usize;
        while self.cores.len() <= idx {
            let next = self.cores.len() as u32;
            self.cores.push(CoreBranch::new(next));
        }
        &mut self.cores[idx]
    }

    pub fn get(&self, core: u32) -> Option<&CoreBranch> {
        self.cores.get(core as usize)
    }

    /// Current frequency of `core`, 0 when nothing is known about it.
    pub fn freq(&self, core: u32) -> u64 {
        self.get(core).map_or(0, |c| c.freq)
    }

    pub fn util(&self, core: u32) -> f64 {
        self.get(core).map_or(0.0, |c| c.util)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreBranch> {
        self.cores.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GpuBranch {
    pub freq: u64,
    pub util: f64,
    pub prev_freq: u64,
    pub prev_util: f64,
    log: Vec<StateChange>,
}

impl GpuBranch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, freq: u64, util: f64) {
        self.freq = freq;
        self.util = util;
        self.prev_freq = freq;
        self.prev_util = util;
    }

    pub fn update(&mut self, ts: u64, freq: u64, util: f64) {
        self.prev_freq = self.freq;
        self.prev_util = self.util;
        self.freq = freq;
        self.util = util;
        self.log.push(StateChange { ts, freq, util });
    }

    pub fn log(&self) -> &[StateChange] {
        &self.log
    }
}
