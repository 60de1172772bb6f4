//! Thermal zone history.

use crate::event::TempSensor;
use crate::power::Temperatures;

const SENSORS: [TempSensor; 3] = [TempSensor::Big, TempSensor::Little, TempSensor::Gpu];

fn sensor_index(sensor: TempSensor) -> usize {
    match sensor {
        TempSensor::Big => 0,
        TempSensor::Little => 1,
        TempSensor::Gpu => 2,
    }
}

#[derive(Debug, Clone, Default)]
pub struct TempHistory {
    // (ts, degC) per sensor in arrival order
    samples: [Vec<(u64, f64)>; 3],
}

impl TempHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sensor: TempSensor, ts: u64, temp: f64) {
        self.samples[sensor_index(sensor)].push((ts, temp));
    }

    /// Expand every sensor into a dense per-microsecond table over
    /// `[start, end]`, holding each sample until the next one.
    pub fn compile_lookup(&self, start: u64, end: u64, default: f64) -> TempLookup {
        let mut values: [Vec<f64>; 3] = Default::default();
        let mut fallback = [default; 3];

        for sensor in SENSORS {
            let idx = sensor_index(sensor);
            let samples = &self.samples[idx];
            if let Some((_, last)) = samples.last() {
                fallback[idx] = *last;
            }
            if samples.is_empty() || end < start {
                continue;
            }

            let mut table = Vec::with_capacity((end - start + 1) as usize);
            let mut cur = 0;
            for ts in start..=end {
                while cur + 1 < samples.len() && ts >= samples[cur + 1].0 {
                    cur += 1;
                }
                table.push(samples[cur].1);
            }
            values[idx] = table;
        }

        TempLookup {
            start,
            values,
            fallback,
        }
    }
}

/// Compiled temperature tables.
#[derive(Debug, Clone)]
pub struct TempLookup {
    start: u64,
    values: [Vec<f64>; 3],
    fallback: [f64; 3],
}

impl TempLookup {
    /// Lookup that always answers `temp`.
    pub fn constant(temp: f64) -> Self {
        TempLookup {
            start: 0,
            values: Default::default(),
            fallback: [temp; 3],
        }
    }

    pub fn get_temp(&self, sensor: TempSensor, ts: u64) -> f64 {
        let idx = sensor_index(sensor);
        let table = &self.values[idx];
        if table.is_empty() {
            return self.fallback[idx];
        }
        let pos = (ts.saturating_sub(self.start) as usize).min(table.len() - 1);
        table[pos]
    }

    pub fn get(&self, ts: u64) -> Temperatures {
        Temperatures {
            big: self.get_temp(TempSensor::Big, ts),
            little: self.get_temp(TempSensor::Little, ts),
            gpu: self.get_temp(TempSensor::Gpu, ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_interpolation() {
        let mut history = TempHistory::new();
        history.add_sample(TempSensor::Big, 100, 40.0);
        history.add_sample(TempSensor::Big, 200, 50.0);
        let lookup = history.compile_lookup(0, 300, 25.0);

        assert_eq!(lookup.get_temp(TempSensor::Big, 100), 40.0);
        assert_eq!(lookup.get_temp(TempSensor::Big, 150), 40.0);
        assert_eq!(lookup.get_temp(TempSensor::Big, 199), 40.0);
        assert_eq!(lookup.get_temp(TempSensor::Big, 200), 50.0);
    }

    #[test]
    fn test_clamps_to_edge_samples() {
        let mut history = TempHistory::new();
        history.add_sample(TempSensor::Little, 100, 35.0);
        history.add_sample(TempSensor::Little, 200, 45.0);
        let lookup = history.compile_lookup(0, 300, 25.0);

        assert_eq!(lookup.get_temp(TempSensor::Little, 0), 35.0);
        assert_eq!(lookup.get_temp(TempSensor::Little, 300), 45.0);
        assert_eq!(lookup.get_temp(TempSensor::Little, 10_000), 45.0);
    }

    #[test]
    fn test_missing_sensor_uses_default() {
        let mut history = TempHistory::new();
        history.add_sample(TempSensor::Gpu, 10, 60.0);
        let lookup = history.compile_lookup(0, 20, 25.0);
        let temps = lookup.get(15);
        assert_eq!(temps.gpu, 60.0);
        assert_eq!(temps.big, 25.0);
        assert_eq!(temps.little, 25.0);
    }

    #[test]
    fn test_constant() {
        let lookup = TempLookup::constant(30.0);
        assert_eq!(lookup.get(12345), Temperatures::uniform(30.0));
    }
}
