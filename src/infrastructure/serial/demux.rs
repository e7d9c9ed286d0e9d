//! Serial demultiplexer
//!
//! Each GX dongle port carries two trackers, told apart by the sub-index in
//! the line label. Ports are numbered by their position in the start
//! request, so port `i` owns `Tracker{2i}` and `Tracker{2i+1}`.

use crate::domain::frame::{self, Frame, FrameError};
use crate::domain::tracker_settings::{self, SettingsError, TrackerSettings};
use std::collections::HashMap;

const TRACKER_PREFIX: &str = "Tracker";
const TRACKERS_PER_PORT: usize = 2;

/// A decoded line attributed to its tracker
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedFrame {
    pub tracker_id: String,
    pub frame: Frame,
}

/// Settings write addressed to one port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortWrite {
    pub port_index: usize,
    pub payload: String,
}

#[derive(Debug, Clone, Default)]
pub struct SerialDemux {
    ports: Vec<String>,
    /// Last raw settings string seen or written per tracker
    last_settings: HashMap<String, String>,
}

impl SerialDemux {
    pub fn new(ports: Vec<String>) -> Self {
        Self {
            ports,
            last_settings: HashMap::new(),
        }
    }

    pub fn port_name(&self, port_index: usize) -> Option<&str> {
        self.ports.get(port_index).map(String::as_str)
    }

    pub fn tracker_id(port_index: usize, sub_index: u8) -> String {
        format!(
            "{}{}",
            TRACKER_PREFIX,
            port_index * TRACKERS_PER_PORT + usize::from(sub_index)
        )
    }

    /// Both trackers a port owns
    pub fn trackers_on(&self, port_index: usize) -> [String; 2] {
        [Self::tracker_id(port_index, 0), Self::tracker_id(port_index, 1)]
    }

    /// Map a tracker id back to `(port index, sub-index)`
    pub fn locate(&self, tracker_id: &str) -> Option<(usize, u8)> {
        let number: usize = tracker_id.strip_prefix(TRACKER_PREFIX)?.parse().ok()?;
        let port_index = number / TRACKERS_PER_PORT;
        if port_index >= self.ports.len() {
            return None;
        }
        Some((port_index, (number % TRACKERS_PER_PORT) as u8))
    }

    /// Decode one line from `port_index`. Only ports of the start request
    /// map to trackers.
    pub fn route(&mut self, port_index: usize, line: &str) -> Result<RoutedFrame, FrameError> {
        if port_index >= self.ports.len() {
            return Err(FrameError::UnknownPort(port_index));
        }
        let parsed = frame::split_serial_line(line)?;
        let tracker_id = Self::tracker_id(port_index, parsed.sub_index);
        let frame = frame::decode_serial(&parsed)?;

        if let Frame::SettingsEcho(raw) = &frame {
            self.last_settings.insert(tracker_id.clone(), raw.trim().to_string());
        }

        Ok(RoutedFrame { tracker_id, frame })
    }

    /// Raw settings string for a tracker, or the encoded defaults
    pub fn raw_settings(&self, tracker_id: &str) -> Result<String, SettingsError> {
        match self.last_settings.get(tracker_id) {
            Some(raw) => Ok(raw.clone()),
            None => TrackerSettings::default().encode(),
        }
    }

    /// Build the paired write that changes one tracker and passes its
    /// port neighbour through unchanged.
    pub fn settings_write(
        &mut self,
        tracker_id: &str,
        settings: &TrackerSettings,
    ) -> Option<Result<PortWrite, SettingsError>> {
        let (port_index, sub_index) = self.locate(tracker_id)?;
        Some(self.build_write(port_index, sub_index, settings))
    }

    fn build_write(
        &mut self,
        port_index: usize,
        sub_index: u8,
        settings: &TrackerSettings,
    ) -> Result<PortWrite, SettingsError> {
        let encoded = settings.encode()?;
        let counterpart = Self::tracker_id(port_index, 1 - sub_index);
        let counterpart_raw = self.raw_settings(&counterpart)?;
        let payload = tracker_settings::paired_serial_write(sub_index, &encoded, &counterpart_raw)?;

        self.last_settings
            .insert(Self::tracker_id(port_index, sub_index), encoded);
        Ok(PortWrite {
            port_index,
            payload,
        })
    }

    /// One write per port carrying `settings` for both sub-indices
    pub fn settings_write_all(
        &mut self,
        settings: &TrackerSettings,
    ) -> Result<Vec<PortWrite>, SettingsError> {
        let encoded = settings.encode()?;
        let payload = tracker_settings::paired_serial_write(0, &encoded, &encoded)?;

        let mut writes = Vec::with_capacity(self.ports.len());
        for port_index in 0..self.ports.len() {
            for id in self.trackers_on(port_index) {
                self.last_settings.insert(id, encoded.clone());
            }
            writes.push(PortWrite {
                port_index,
                payload: payload.clone(),
            });
        }
        Ok(writes)
    }
}
