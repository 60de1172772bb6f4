//! Initial core and GPU state.
//!
//! The tracer only reports frequency *changes*, so the frequency each core
//! was running at when capture started has to be read separately. It is
//! either given as JSON:
//!
//! ```text
//! {
//!   "cores": [{"core": 0, "freq": 999000000, "util": 40.0}],
//!   "gpu": {"freq": 400000000, "util": 10.0}
//! }
//! ```
//!
//! or read from a copy of the device's `/sys/devices/system/cpu` directory.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::Topology;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreSeed {
    pub core: u32,
    /// Hz
    pub freq: u64,
    /// Percent; taken from the compiled utilization when missing.
    #[serde(default)]
    pub util: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuSeed {
    pub freq: u64,
    #[serde(default)]
    pub util: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitialMetrics {
    #[serde(default)]
    pub cores: Vec<CoreSeed>,
    #[serde(default)]
    pub gpu: Option<GpuSeed>,
}

impl InitialMetrics {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse initial metrics")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Read `cpuN/cpufreq/scaling_cur_freq` (kHz) for every `cpuN` under
    /// `root`. Offline cores without a cpufreq node are skipped.
    pub fn from_sysfs(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root)
            .with_context(|| format!("Failed to read sysfs directory {}", root.display()))?;

        let mut cores = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(core) = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let path = entry.path().join("cpufreq").join("scaling_cur_freq");
            if !path.exists() {
                debug!("cpu{core} has no cpufreq node, skipping");
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let khz: u64 = contents
                .trim()
                .parse()
                .with_context(|| format!("Invalid frequency in {}", path.display()))?;
            cores.push(CoreSeed {
                core,
                freq: khz * 1000,
                util: None,
            });
        }

        if cores.is_empty() {
            bail!("No cpufreq entries found under {}", root.display());
        }
        cores.sort_by_key(|c| c.core);
        Ok(InitialMetrics { cores, gpu: None })
    }

    pub fn core(&self, core: u32) -> Option<&CoreSeed> {
        self.cores.iter().find(|c| c.core == core)
    }

    /// Fail when a seeded core is not part of `topology`.
    pub fn check_cores(&self, topology: &Topology) -> Result<()> {
        for seed in &self.cores {
            topology
                .check_core(seed.core)
                .context("Invalid initial core state")?;
        }
        Ok(())
    }
}
