//! Stateful soil moisture simulator for local development.
//!
//! Produces moisture in percent (0–100, higher is wetter), modelling:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading sensor noise and occasional spikes
//! - Closed-loop pump response (moisture rises while the pump runs)

use std::fmt;

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily.
    Drying,
    /// Hovers around the centre with little noise.
    Stable,
    /// High noise and frequent spikes.
    Flaky,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SoilMoistureSim {
    /// Current "true" moisture, percent.
    level: f64,
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
    pumping: bool,
    /// Percentage points gained per sample while the pump runs.
    pump_rate: f64,
}

impl SoilMoistureSim {
    pub fn new(scenario: Scenario) -> Self {
        // (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start)
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start) =
            match scenario {
                Scenario::Drying => (-0.1, 0.4, 0.01, 0.3, 0.03_f32, 8.0, 45.0),
                Scenario::Stable => (-0.01, 0.15, 0.05, 0.1, 0.005, 4.0, 45.0),
                Scenario::Flaky => (-0.05, 0.8, 0.02, 1.5, 0.10, 15.0, 45.0),
                Scenario::Wet => (-0.02, 0.2, 0.02, 0.2, 0.02, 5.0, 80.0),
            };

        Self {
            level: (start + gaussian(0.0, 2.0)).clamp(0.0, 100.0),
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center: 45.0,
            noise_sigma,
            spike_prob,
            spike_sigma,
            pumping: false,
            pump_rate: 2.5,
        }
    }

    /// Inform the simulator whether the pump is currently running.
    pub fn set_pumping(&mut self, active: bool) {
        self.pumping = active;
    }

    /// Produce the next reading. The underlying level evolves on every call.
    pub fn sample(&mut self) -> f64 {
        let pull = self.mean_reversion * (self.center - self.level);
        let walk = gaussian(0.0, self.walk_sigma);
        let pump = if self.pumping { self.pump_rate } else { 0.0 };

        self.level = (self.level + self.drift_per_sample + pull + walk + pump).clamp(0.0, 100.0);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        let reading = (self.level + noise + spike).clamp(0.0, 100.0);
        (reading * 10.0).round() / 10.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_of(sim: &mut SoilMoistureSim, n: usize) -> f64 {
        (0..n).map(|_| sim.sample()).sum::<f64>() / n as f64
    }

    #[test]
    fn readings_within_percent_range() {
        let mut sim = SoilMoistureSim::new(Scenario::Flaky);
        for _ in 0..1000 {
            let v = sim.sample();
            assert!((0.0..=100.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn readings_have_one_decimal() {
        let mut sim = SoilMoistureSim::new(Scenario::Stable);
        for _ in 0..50 {
            let v = sim.sample();
            assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-9, "{v}");
        }
    }

    #[test]
    fn pumping_raises_moisture() {
        let mut sim = SoilMoistureSim::new(Scenario::Drying);
        for _ in 0..20 {
            sim.sample();
        }
        let before = mean_of(&mut sim, 20);

        sim.set_pumping(true);
        for _ in 0..20 {
            sim.sample();
        }
        let after = mean_of(&mut sim, 20);

        assert!(after > before, "pumping should raise moisture: before={before:.1} after={after:.1}");
    }

    #[test]
    fn wet_scenario_starts_high() {
        let mut sim = SoilMoistureSim::new(Scenario::Wet);
        let avg = mean_of(&mut sim, 10);
        assert!(avg > 60.0, "wet scenario should start high: {avg:.1}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Drying);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Drying.to_string(), "drying");
        assert_eq!(Scenario::Wet.to_string(), "wet");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
