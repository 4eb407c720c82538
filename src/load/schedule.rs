use std::time::Duration;

use super::{LoadProfile, LoadTestConfig, RunPhase};
use crate::config::STRESS_RAMP_FACTOR;

/// When each virtual user starts and stops, relative to controller start.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSchedule {
    pub profile: LoadProfile,
    /// Spawn offset per driver, ascending.
    pub spawn_offsets: Vec<Duration>,
    /// Retire offset per driver. `None` means the driver runs until `duration`.
    pub retire_offsets: Vec<Option<Duration>>,
    pub ramp_down_start: Option<Duration>,
    pub duration: Duration,
}

impl LoadSchedule {
    pub fn ramp_up_end(&self) -> Duration {
        self.spawn_offsets.last().copied().unwrap_or_default()
    }

    /// Phase entered once every driver has been spawned.
    pub fn hold_phase(&self) -> RunPhase {
        match self.profile {
            LoadProfile::Spike => RunPhase::Spiking,
            _ => RunPhase::Steady,
        }
    }
}

/// Build the spawn/retire plan for a validated config.
///
/// - gradual, load: driver `i` spawns at `i * R / N`
/// - stress: same spacing over a compressed ramp of `R * STRESS_RAMP_FACTOR`
/// - spike: every driver spawns at `t = 0`
///
/// Only gradual ramps down: starting at `max(duration - R, last spawn)`, the
/// last-spawned driver retires first, one every `R / N`.
pub fn plan(config: &LoadTestConfig) -> LoadSchedule {
    let users = config.users.max(1) as usize;
    let duration = config.duration();
    let duration_secs = duration.as_secs_f64();

    let ramp = config.ramp_up().as_secs_f64();
    let ramp_secs = match config.test_type {
        LoadProfile::Spike => 0.0,
        LoadProfile::Stress => ramp * STRESS_RAMP_FACTOR,
        LoadProfile::Gradual | LoadProfile::Load => ramp,
    }
    .clamp(0.0, duration_secs);

    let step = ramp_secs / users as f64;
    let spawn_offsets: Vec<Duration> = (0..users)
        .map(|i| Duration::from_secs_f64(i as f64 * step))
        .collect();

    let mut retire_offsets = vec![None; users];
    let mut ramp_down_start = None;

    if config.test_type == LoadProfile::Gradual && ramp_secs > 0.0 {
        let last_spawn = (users - 1) as f64 * step;
        let start = (duration_secs - ramp_secs).max(last_spawn);
        if start < duration_secs {
            ramp_down_start = Some(Duration::from_secs_f64(start));
            for (i, slot) in retire_offsets.iter_mut().enumerate() {
                let at = start + (users - 1 - i) as f64 * step;
                if at < duration_secs {
                    *slot = Some(Duration::from_secs_f64(at));
                }
            }
        }
    }

    LoadSchedule {
        profile: config.test_type,
        spawn_offsets,
        retire_offsets,
        ramp_down_start,
        duration,
    }
}
