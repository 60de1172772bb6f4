//! Device power models.
//!
//! A power model maps an operating point of one cluster (frequency, per-core
//! utilization and temperatures) to the power drawn by that cluster. Models
//! are fitted per device, so the engine only depends on the [`PowerModel`]
//! trait and the concrete model is picked by name.

mod hikey960;

use std::fmt;

use anyhow::{bail, Result};
use serde::Serialize;

pub use hikey960::Hikey960Model;

/// A group of cores sharing one frequency domain, or the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreClass {
    Little,
    Big,
    Gpu,
}

impl CoreClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Little => "little",
            Self::Big => "big",
            Self::Gpu => "gpu",
        }
    }
}

impl fmt::Display for CoreClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temperatures (degrees Celsius) of every thermal zone the models use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Temperatures {
    pub big: f64,
    pub little: f64,
    pub gpu: f64,
}

impl Temperatures {
    pub fn uniform(temp: f64) -> Self {
        Temperatures {
            big: temp,
            little: temp,
            gpu: temp,
        }
    }

    pub fn for_class(&self, class: CoreClass) -> f64 {
        match class {
            CoreClass::Big => self.big,
            CoreClass::Little => self.little,
            CoreClass::Gpu => self.gpu,
        }
    }
}

pub trait PowerModel: Send + Sync {
    /// Power in watts drawn by the `class` cluster running at `freq` Hz.
    ///
    /// `utils` holds the utilization (percent) of every core in the cluster,
    /// a single entry for the GPU. Fails when `freq` is not an operating
    /// point the model was fitted for.
    fn power(&self, class: CoreClass, freq: u64, utils: &[f64], temps: &Temperatures)
        -> Result<f64>;
}

/// Names accepted by [`model_for_device`].
pub const DEVICES: &[&str] = &["hikey960"];

pub fn model_for_device(name: &str) -> Result<Box<dyn PowerModel>> {
    match name {
        "hikey960" => Ok(Box::new(Hikey960Model::new())),
        _ => bail!(
            "Unknown device: {name}. Must be one of: {}",
            DEVICES.join(", ")
        ),
    }
}

/// Frequency to voltage mapping of one clock domain.
#[derive(Debug, Clone)]
pub struct VoltageTable {
    class: CoreClass,
    // (Hz, volts) sorted by frequency
    points: Vec<(u64, f64)>,
}

impl VoltageTable {
    pub fn new(class: CoreClass, mut points: Vec<(u64, f64)>) -> Self {
        points.sort_by_key(|(freq, _)| *freq);
        VoltageTable { class, points }
    }

    /// Voltage of an exact operating point.
    ///
    /// There is no interpolation: an untested operating point cannot be
    /// costed safely, so it is an error.
    pub fn voltage(&self, freq: u64) -> Result<f64> {
        match self.points.binary_search_by_key(&freq, |(f, _)| *f) {
            Ok(idx) => Ok(self.points[idx].1),
            Err(_) => bail!(
                "No voltage entry for {freq} Hz on the {} cluster",
                self.class
            ),
        }
    }

    pub fn frequencies(&self) -> impl Iterator<Item = u64> + '_ {
        self.points.iter().map(|(freq, _)| *freq)
    }
}
