//! GPU frequency/utilization history from the Mali driver hook.

use anyhow::Result;
use serde::Serialize;

use super::temp::TempLookup;
use crate::power::{CoreClass, PowerModel};

/// A span with constant GPU frequency and utilization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpuInterval {
    pub start: u64,
    pub end: u64,
    pub freq: u64,
    pub util: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct GpuSample {
    ts: u64,
    freq: u64,
    util: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GpuHistory {
    samples: Vec<GpuSample>,
}

impl GpuHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ts: u64, freq: u64, util: f64) {
        self.samples.push(GpuSample { ts, freq, util });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Intervals bounded by consecutive samples, each carrying the earlier
    /// sample's values.
    pub fn intervals(&self) -> Vec<GpuInterval> {
        self.samples
            .windows(2)
            .filter(|pair| pair[1].ts > pair[0].ts)
            .map(|pair| GpuInterval {
                start: pair[0].ts,
                end: pair[1].ts,
                freq: pair[0].freq,
                util: pair[0].util,
            })
            .collect()
    }

    /// Joules drawn by the GPU over `[start, end]`.
    ///
    /// Intervals at 0 Hz are a powered-down GPU and cost nothing.
    pub fn energy(
        &self,
        start: u64,
        end: u64,
        model: &dyn PowerModel,
        temps: &TempLookup,
    ) -> Result<f64> {
        let mut joules = 0.0;
        for interval in self.intervals() {
            if interval.start >= end {
                break;
            }
            let from = interval.start.max(start);
            let to = interval.end.min(end);
            if to <= from || interval.freq == 0 {
                continue;
            }
            let watts = model.power(
                CoreClass::Gpu,
                interval.freq,
                &[interval.util],
                &temps.get(from),
            )?;
            joules += watts * (to - from) as f64 * 1e-6;
        }
        Ok(joules)
    }
}
