//! Run configuration.
//!
//! [`Config`] is filled from the command line; the numeric tunables can also
//! come from a JSON file:
//!
//! ```text
//! {
//!   "util_window_us": 250,
//!   "series_interval_us": 1000000,
//!   "default_temperature": 25.0,
//!   "workers": 4,
//!   "topology": { "little": [0, 1, 2, 3], "big": [4, 5, 6, 7] }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::power::CoreClass;

/// Trailing window used to turn idle slices into a utilization percentage.
pub const DEFAULT_UTIL_WINDOW_US: u64 = 250;

/// Bucket size of the energy-vs-time series.
pub const DEFAULT_SERIES_INTERVAL_US: u64 = 1_000_000;

/// Temperature reported for a sensor that never produced a sample.
pub const DEFAULT_TEMPERATURE: f64 = 25.0;

const DEFAULT_WORKERS: usize = 4;

/// Highest core id a topology may list.
pub const MAX_CORE_ID: u32 = 1023;

/// Which cores make up each cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    pub little: Vec<u32>,
    pub big: Vec<u32>,
}

impl Default for Topology {
    fn default() -> Self {
        Topology {
            little: vec![0, 1, 2, 3],
            big: vec![4, 5, 6, 7],
        }
    }
}

impl Topology {
    pub fn validate(&self) -> Result<()> {
        if self.little.is_empty() && self.big.is_empty() {
            bail!("Topology has no cores");
        }
        if let Some(core) = self.little.iter().find(|c| self.big.contains(c)) {
            bail!("Core {core} is listed in both clusters");
        }
        if let Some(core) = self.little.iter().chain(&self.big).find(|c| **c > MAX_CORE_ID) {
            bail!("Core {core} is above the highest supported id {MAX_CORE_ID}");
        }
        Ok(())
    }

    pub fn contains(&self, core: u32) -> bool {
        self.little.contains(&core) || self.big.contains(&core)
    }

    /// Fail for a core id the topology does not list. Per-core state is
    /// indexed by id, so an unchecked id from a trace sizes every table.
    pub fn check_core(&self, core: u32) -> Result<()> {
        if !self.contains(core) {
            bail!(
                "Core {core} is not in the topology (little {:?}, big {:?})",
                self.little,
                self.big
            );
        }
        Ok(())
    }

    /// Cluster of `core`. Unknown cores are treated as little cores.
    pub fn class_of(&self, core: u32) -> CoreClass {
        if self.big.contains(&core) {
            CoreClass::Big
        } else {
            CoreClass::Little
        }
    }

    pub fn cluster(&self, class: CoreClass) -> &[u32] {
        match class {
            CoreClass::Big => &self.big,
            CoreClass::Little | CoreClass::Gpu => &self.little,
        }
    }

    /// Number of per-core slots needed to index every listed core.
    pub fn num_cores(&self) -> usize {
        self.little
            .iter()
            .chain(self.big.iter())
            .max()
            .map_or(0, |max| *max as usize + 1)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TunablesJson {
    util_window_us: Option<u64>,
    series_interval_us: Option<u64>,
    default_temperature: Option<f64>,
    workers: Option<usize>,
    topology: Option<Topology>,
}

/// Output format of the energy report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => bail!("Invalid output format: {s}. Must be one of: table, json, csv"),
        }
    }
}

/// Configuration for an energy attribution run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// JSON-lines event stream
    pub events: PathBuf,
    /// Thread classification table
    pub pids: PathBuf,
    /// Power model to use
    pub device: String,
    /// Initial core/GPU state as JSON
    pub snapshot: Option<PathBuf>,
    /// Initial core frequencies from a pulled sysfs cpu directory
    pub sysfs: Option<PathBuf>,
    /// Events before this timestamp (us) are dropped
    pub window_start: Option<u64>,
    /// Events after this timestamp (us) are dropped
    pub window_end: Option<u64>,
    /// Trailing window for utilization (us)
    pub util_window_us: u64,
    /// Energy series bucket size (us)
    pub series_interval_us: u64,
    /// Fallback temperature for sensors without samples
    pub default_temperature: f64,
    /// Worker threads for lookup compilation
    pub workers: usize,
    /// Cluster layout
    pub topology: Topology,
    /// Write the task dependency graph as DOT here
    pub graph: Option<PathBuf>,
    /// Report format
    pub format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            events: PathBuf::from("trace.jsonl"),
            pids: PathBuf::from("pids.json"),
            device: "hikey960".to_string(),
            snapshot: None,
            sysfs: None,
            window_start: None,
            window_end: None,
            util_window_us: DEFAULT_UTIL_WINDOW_US,
            series_interval_us: DEFAULT_SERIES_INTERVAL_US,
            default_temperature: DEFAULT_TEMPERATURE,
            workers: DEFAULT_WORKERS,
            topology: Topology::default(),
            graph: None,
            format: OutputFormat::Table,
        }
    }
}

impl Config {
    /// Overlay the tunables found in a JSON document.
    pub fn apply_tunables_json(&mut self, json: &str) -> Result<()> {
        let tunables: TunablesJson =
            serde_json::from_str(json).context("Failed to parse tunables")?;
        if let Some(window) = tunables.util_window_us {
            self.util_window_us = window;
        }
        if let Some(interval) = tunables.series_interval_us {
            self.series_interval_us = interval;
        }
        if let Some(temp) = tunables.default_temperature {
            self.default_temperature = temp;
        }
        if let Some(workers) = tunables.workers {
            self.workers = workers;
        }
        if let Some(topology) = tunables.topology {
            self.topology = topology;
        }
        self.validate()
    }

    pub fn apply_tunables_file(&mut self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        self.apply_tunables_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.util_window_us == 0 {
            bail!("util_window_us must be greater than 0");
        }
        if self.series_interval_us == 0 {
            bail!("series_interval_us must be greater than 0");
        }
        if self.workers == 0 {
            bail!("workers must be greater than 0");
        }
        if let (Some(start), Some(end)) = (self.window_start, self.window_end) {
            if start > end {
                bail!("Window start {start} is after window end {end}");
            }
        }
        self.topology.validate()
    }
}
