//! Per-core utilization history built from `cpu_idle` transitions.

use crate::event::IDLE_EXIT;

/// A span during which a core stayed in one state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilSlice {
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    pub active: bool,
    /// Utilization (percent) over the trailing window ending at `end`.
    pub util: f64,
}

impl UtilSlice {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Clone)]
pub struct CoreUtilHistory {
    core: u32,
    window: u64,
    // None until the first idle event establishes the baseline
    state: Option<bool>,
    last_ts: u64,
    slices: Vec<UtilSlice>,
}

impl CoreUtilHistory {
    pub fn new(core: u32, window: u64) -> Self {
        CoreUtilHistory {
            core,
            window,
            state: None,
            last_ts: 0,
            slices: Vec::new(),
        }
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn slices(&self) -> &[UtilSlice] {
        &self.slices
    }

    /// Feed one `cpu_idle` transition.
    ///
    /// The first call only sets the baseline. Every later call closes the
    /// slice since the previous transition, in the previous state.
    pub fn handle_idle(&mut self, ts: u64, state: u32) {
        let active = state == IDLE_EXIT;
        let Some(prev_active) = self.state else {
            self.state = Some(active);
            self.last_ts = ts;
            return;
        };

        if ts > self.last_ts {
            self.slices.push(UtilSlice {
                start: self.last_ts,
                end: ts,
                active: prev_active,
                util: 0.0,
            });
            let util = self.trailing_util();
            if let Some(slice) = self.slices.last_mut() {
                slice.util = util;
            }
            self.last_ts = ts;
        }
        self.state = Some(active);
    }

    /// Active share of the trailing window ending at the newest slice.
    fn trailing_util(&self) -> f64 {
        let mut remaining = self.window;
        let mut covered = 0u64;
        let mut active = 0u64;

        for slice in self.slices.iter().rev() {
            if remaining == 0 {
                break;
            }
            let take = slice.len().min(remaining);
            covered += take;
            if slice.active {
                active += take;
            }
            remaining -= take;
        }

        if covered == 0 {
            return 0.0;
        }
        active as f64 / covered as f64 * 100.0
    }

    /// Utilization reported where no slice applies.
    fn fallback(&self) -> f64 {
        match self.state {
            Some(false) => 0.0,
            _ => 100.0,
        }
    }

    /// Expand the slices into a dense per-microsecond table over
    /// `[start, end]`.
    pub fn compile_lookup(&self, start: u64, end: u64) -> UtilLookup {
        let fallback = self.fallback();
        if end < start {
            return UtilLookup {
                start,
                values: Vec::new(),
                fallback,
            };
        }

        let len = (end - start + 1) as usize;
        let mut values = Vec::with_capacity(len);
        let mut idx = 0;
        for ts in start..=end {
            while idx + 1 < self.slices.len() && ts >= self.slices[idx].end {
                idx += 1;
            }
            values.push(self.slices.get(idx).map_or(fallback, |s| s.util));
        }

        UtilLookup {
            start,
            values,
            fallback,
        }
    }
}

/// Compiled utilization table of one core.
#[derive(Debug, Clone)]
pub struct UtilLookup {
    start: u64,
    values: Vec<f64>,
    fallback: f64,
}

impl UtilLookup {
    /// Table for a core that never reported an idle transition.
    pub fn constant(util: f64) -> Self {
        UtilLookup {
            start: 0,
            values: Vec::new(),
            fallback: util,
        }
    }

    /// Utilization at `ts`, clamped to the first/last compiled sample.
    pub fn get_util(&self, ts: u64) -> f64 {
        if self.values.is_empty() {
            return self.fallback;
        }
        let idx = (ts.saturating_sub(self.start) as usize).min(self.values.len() - 1);
        self.values[idx]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
