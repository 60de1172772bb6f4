//! Utilization, temperature and GPU history.
//!
//! These tables are built in a preprocessing pass over the system-wide events
//! and then frozen into a [`MetricsContext`]. Energy integration during the
//! main pass only ever reads from the context, so it must be complete before
//! the first scheduler event is replayed.

pub mod gpu;
pub mod temp;
pub mod util;

use std::sync::mpsc::channel;

use anyhow::{bail, Result};
use tracing::debug;
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::config::Topology;
use crate::event::Event;
use crate::power::{CoreClass, Temperatures};

pub use gpu::{GpuHistory, GpuInterval};
pub use temp::{TempHistory, TempLookup};
pub use util::{CoreUtilHistory, UtilLookup, UtilSlice};

/// Collects the system-wide events of a trace.
pub struct MetricsBuilder {
    topology: Topology,
    util_window_us: u64,
    default_temperature: f64,
    cores: Vec<CoreUtilHistory>,
    temps: TempHistory,
    gpu: GpuHistory,
}

impl MetricsBuilder {
    pub fn new(topology: Topology, util_window_us: u64, default_temperature: f64) -> Self {
        let cores = (0..topology.num_cores() as u32)
            .map(|core| CoreUtilHistory::new(core, util_window_us))
            .collect();
        MetricsBuilder {
            topology,
            util_window_us,
            default_temperature,
            cores,
            temps: TempHistory::new(),
            gpu: GpuHistory::new(),
        }
    }

    fn core_mut(&mut self, core: u32) -> &mut CoreUtilHistory {
        let idx = core as usize;
        while self.cores.len() <= idx {
            let next = self.cores.len() as u32;
            self.cores.push(CoreUtilHistory::new(next, self.util_window_us));
        }
        &mut self.cores[idx]
    }

    pub fn observe(&mut self, event: &Event) {
        match event {
            Event::Idle(e) => self.core_mut(e.core).handle_idle(e.ts, e.state),
            Event::TempInfo(e) => self.temps.add_sample(e.sensor, e.ts, e.temp),
            Event::MaliUtil(e) => self.gpu.add(e.ts, e.freq, e.util),
            _ => {}
        }
    }

    pub fn observe_all<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        for event in events {
            self.observe(event);
        }
    }

    /// Compile every lookup over `[start, end]`.
    ///
    /// Cores are compiled on a pool of `workers` threads; this returns only
    /// once all of them are done.
    pub fn build(self, start: u64, end: u64, workers: usize) -> Result<MetricsContext> {
        let ncores = self.cores.len();
        let pool = Pool::<ThunkWorker<(usize, UtilLookup)>>::new(workers.max(1));
        let (tx, rx) = channel();

        for (idx, history) in self.cores.into_iter().enumerate() {
            pool.execute_to(
                tx.clone(),
                Thunk::of(move || (idx, history.compile_lookup(start, end))),
            );
        }
        drop(tx);

        let temps = self
            .temps
            .compile_lookup(start, end, self.default_temperature);

        let mut util: Vec<Option<UtilLookup>> = vec![None; ncores];
        for (idx, lookup) in rx.iter().take(ncores) {
            util[idx] = Some(lookup);
        }
        pool.join();

        let util = util
            .into_iter()
            .enumerate()
            .map(|(core, lookup)| match lookup {
                Some(lookup) => Ok(lookup),
                None => bail!("Utilization lookup for core {core} was not compiled"),
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Compiled utilization for {} cores over [{start}, {end}], {} GPU samples",
            util.len(),
            self.gpu.len()
        );

        Ok(MetricsContext {
            topology: self.topology,
            util,
            temps,
            gpu: self.gpu,
        })
    }
}

/// Read-only utilization, temperature and GPU lookups for one trace.
#[derive(Debug, Clone)]
pub struct MetricsContext {
    topology: Topology,
    util: Vec<UtilLookup>,
    temps: TempLookup,
    gpu: GpuHistory,
}

impl MetricsContext {
    /// Context for a trace without idle, thermal or GPU events: every core
    /// fully busy, every sensor at `temp`.
    pub fn constant(topology: Topology, temp: f64) -> Self {
        let util = vec![UtilLookup::constant(100.0); topology.num_cores()];
        MetricsContext {
            topology,
            util,
            temps: TempLookup::constant(temp),
            gpu: GpuHistory::new(),
        }
    }

    /// Run the preprocessing pass over `events` and compile the result.
    /// Fails for an event on a core the topology does not list.
    pub fn from_events(
        events: &[Event],
        topology: Topology,
        util_window_us: u64,
        default_temperature: f64,
        start: u64,
        end: u64,
        workers: usize,
    ) -> Result<Self> {
        crate::event::check_cores(events, &topology)?;
        let mut builder = MetricsBuilder::new(topology, util_window_us, default_temperature);
        builder.observe_all(events);
        builder.build(start, end, workers)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Utilization (percent) of `core` at `ts`. Cores without a table are
    /// treated as fully busy.
    pub fn util(&self, core: u32, ts: u64) -> f64 {
        self.util
            .get(core as usize)
            .map_or(100.0, |lookup| lookup.get_util(ts))
    }

    /// Utilization of every core of `class` at `ts`, in topology order.
    pub fn cluster_utils(&self, class: CoreClass, ts: u64) -> Vec<f64> {
        self.topology
            .cluster(class)
            .iter()
            .map(|core| self.util(*core, ts))
            .collect()
    }

    pub fn temps(&self, ts: u64) -> Temperatures {
        self.temps.get(ts)
    }

    pub fn temp_lookup(&self) -> &TempLookup {
        &self.temps
    }

    pub fn gpu(&self) -> &GpuHistory {
        &self.gpu
    }
}
