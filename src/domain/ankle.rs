//! Virtual ankle trackers
//!
//! Trackers with an ankle sensor append a raw ankle byte to their IMU
//! frames. The bridge turns it into a foot rotation for a virtual tracker:
//! the pitch comes from the smoothed ankle value, yaw and roll are taken
//! from the physical tracker as they are. This is a heuristic, not a
//! validated kinematic model.

use crate::domain::math::Quaternion;
use std::collections::{HashMap, VecDeque};

/// Number of ankle samples averaged
pub const DEFAULT_WINDOW: usize = 10;

const ANKLE_RAW_MAX: f32 = 255.0;
const ANKLE_MIN_DEGREES: f32 = -90.0;
const PITCH_MIN_RAD: f32 = -2.0;
const PITCH_MAX_RAD: f32 = -0.2;

/// Map an averaged raw ankle value to a foot pitch in radians
pub fn ankle_pitch(average: f32) -> f32 {
    let degrees = (average / ANKLE_RAW_MAX).clamp(0.0, 1.0) * ANKLE_MIN_DEGREES;
    degrees.to_radians().clamp(PITCH_MIN_RAD, PITCH_MAX_RAD)
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualSample {
    pub tracker_id: String,
    pub rotation: Quaternion,
}

pub struct AnkleSynthesizer {
    window: usize,
    suffix: String,
    samples: HashMap<String, VecDeque<u8>>,
}

impl AnkleSynthesizer {
    pub fn new(window: usize, suffix: impl Into<String>) -> Self {
        Self {
            window: window.max(1),
            suffix: suffix.into(),
            samples: HashMap::new(),
        }
    }

    pub fn virtual_id(&self, tracker_id: &str) -> String {
        format!("{}{}", tracker_id, self.suffix)
    }

    pub fn is_virtual(&self, tracker_id: &str) -> bool {
        !self.suffix.is_empty() && tracker_id.ends_with(&self.suffix)
    }

    /// Add a sample and return the moving average
    pub fn push(&mut self, tracker_id: &str, raw: u8) -> f32 {
        let buffer = self.samples.entry(tracker_id.to_string()).or_default();
        buffer.push_back(raw);
        while buffer.len() > self.window {
            buffer.pop_front();
        }
        buffer.iter().map(|&v| f32::from(v)).sum::<f32>() / buffer.len() as f32
    }

    /// Produce the virtual foot rotation for one ankle reading
    pub fn synthesize(&mut self, tracker_id: &str, raw: u8, real: Quaternion) -> VirtualSample {
        let average = self.push(tracker_id, raw);
        let mut euler = real.to_euler();
        euler.x = ankle_pitch(average);

        VirtualSample {
            tracker_id: self.virtual_id(tracker_id),
            rotation: Quaternion::from_euler(euler),
        }
    }

    pub fn forget(&mut self, tracker_id: &str) {
        self.samples.remove(tracker_id);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::math::EulerAngles;

    #[test]
    fn test_pitch_mapping_is_clamped() {
        assert!((ankle_pitch(0.0) - PITCH_MAX_RAD).abs() < 1e-6);
        assert!((ankle_pitch(255.0) - (-90f32).to_radians()).abs() < 1e-6);
        assert!((ankle_pitch(127.5) - (-45f32).to_radians()).abs() < 1e-5);
        assert!((ankle_pitch(1000.0) - (-90f32).to_radians()).abs() < 1e-6);
    }

    #[test]
    fn test_moving_average_window() {
        let mut synth = AnkleSynthesizer::new(DEFAULT_WINDOW, "-ankle");
        for _ in 0..DEFAULT_WINDOW {
            synth.push("t", 0);
        }
        assert_eq!(synth.push("t", 100), 10.0);
        for _ in 0..DEFAULT_WINDOW {
            synth.push("t", 200);
        }
        assert_eq!(synth.push("t", 200), 200.0);
        assert_eq!(synth.push("other", 50), 50.0);
    }

    #[test]
    fn test_virtual_rotation_keeps_yaw_and_roll() {
        let mut synth = AnkleSynthesizer::new(DEFAULT_WINDOW, "-ankle");
        let real = Quaternion::from_euler(EulerAngles {
            x: 0.4,
            y: 0.25,
            z: -1.1,
        });
        let sample = synth.synthesize("Tracker0", 255, real);
        assert_eq!(sample.tracker_id, "Tracker0-ankle");
        assert!(synth.is_virtual(&sample.tracker_id));

        let euler = sample.rotation.to_euler();
        assert!((euler.x - (-90f32).to_radians()).abs() < 1e-3);
        assert!((euler.y - 0.25).abs() < 1e-3);
        assert!((euler.z + 1.1).abs() < 1e-3);
    }
}
