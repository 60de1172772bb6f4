//! Regression power model for the HiKey960 board (Kirin 960: 4x Cortex-A53,
//! 4x Cortex-A73, Mali-G71 MP8).
//!
//! The little cluster uses a dynamic term plus a voltage-proportional static
//! term. The big cluster and the GPU leak noticeably with temperature, so
//! their static term grows exponentially with it (the three-constant voltage
//! model).

use anyhow::Result;

use super::{CoreClass, PowerModel, Temperatures, VoltageTable};

/// Switched capacitance coefficients (W / (V^2 * GHz)).
const LITTLE_C_DYN: f64 = 0.31;
const BIG_C_DYN: f64 = 0.86;
const GPU_C_DYN: f64 = 1.92;

/// Static power coefficients (W / V).
const LITTLE_C_LEAK: f64 = 0.046;
const BIG_C_LEAK: f64 = 0.072;
const GPU_C_LEAK: f64 = 0.110;

/// Leakage temperature sensitivity (1 / degC).
const BIG_K_TEMP: f64 = 0.0141;
const GPU_K_TEMP: f64 = 0.0117;

#[derive(Debug, Clone)]
pub struct Hikey960Model {
    little: VoltageTable,
    big: VoltageTable,
    gpu: VoltageTable,
}

impl Default for Hikey960Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Hikey960Model {
    pub fn new() -> Self {
        Hikey960Model {
            little: VoltageTable::new(
                CoreClass::Little,
                vec![
                    (533_000_000, 0.700),
                    (999_000_000, 0.800),
                    (1_402_000_000, 0.900),
                    (1_709_000_000, 1.000),
                    (1_844_000_000, 1.100),
                ],
            ),
            big: VoltageTable::new(
                CoreClass::Big,
                vec![
                    (903_000_000, 0.700),
                    (1_421_000_000, 0.800),
                    (1_805_000_000, 0.900),
                    (2_112_000_000, 1.000),
                    (2_362_000_000, 1.100),
                ],
            ),
            gpu: VoltageTable::new(
                CoreClass::Gpu,
                vec![
                    (178_000_000, 0.700),
                    (400_000_000, 0.750),
                    (533_000_000, 0.800),
                    (807_000_000, 0.900),
                    (960_000_000, 1.000),
                    (1_037_000_000, 1.100),
                ],
            ),
        }
    }

    pub fn voltage_table(&self, class: CoreClass) -> &VoltageTable {
        match class {
            CoreClass::Little => &self.little,
            CoreClass::Big => &self.big,
            CoreClass::Gpu => &self.gpu,
        }
    }
}

/// Summed utilization in units of fully busy cores.
fn busy_cores(utils: &[f64]) -> f64 {
    utils.iter().map(|u| u.clamp(0.0, 100.0) / 100.0).sum()
}

impl PowerModel for Hikey960Model {
    fn power(
        &self,
        class: CoreClass,
        freq: u64,
        utils: &[f64],
        temps: &Temperatures,
    ) -> Result<f64> {
        let volts = self.voltage_table(class).voltage(freq)?;
        let ghz = freq as f64 / 1e9;
        let busy = busy_cores(utils);
        let temp = temps.for_class(class);

        let watts = match class {
            CoreClass::Little => {
                LITTLE_C_DYN * volts * volts * ghz * busy + LITTLE_C_LEAK * volts
            }
            CoreClass::Big => {
                BIG_C_DYN * volts * volts * ghz * busy
                    + BIG_C_LEAK * volts * (BIG_K_TEMP * temp).exp()
            }
            CoreClass::Gpu => {
                GPU_C_DYN * volts * volts * ghz * busy
                    + GPU_C_LEAK * volts * (GPU_K_TEMP * temp).exp()
            }
        };
        Ok(watts)
    }
}
