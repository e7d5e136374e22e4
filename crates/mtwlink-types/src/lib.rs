use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Vendor-assigned identifier of a sensor or base station, e.g. `"00B42D54"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Link state reported by a base station for one of its peer devices.
///
/// Only [`ConnectivityState::Connected`] counts as membership in the
/// connected set; every other state removes the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// Device is wirelessly connected and ready for measurement.
    Connected,
    /// Device left the network (powered off, out of range).
    Disconnected,
    /// Base station refused the device (e.g. too many peers).
    Rejected,
    /// Device is docked over USB instead of radio.
    PluggedIn,
    /// Device is on air but has not finished joining.
    Wireless,
    /// Device is flushing its retransmission buffer.
    OutputBuffering,
    Unknown,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected)
    }
}

/// One decoded orientation measurement, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EulerSample {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl EulerSample {
    /// Number of output channels a single sample occupies.
    pub const CHANNELS: usize = 3;

    pub fn new(roll: f32, pitch: f32, yaw: f32) -> Self {
        Self { roll, pitch, yaw }
    }

    pub fn channels(&self) -> [f32; Self::CHANNELS] {
        [self.roll, self.pitch, self.yaw]
    }
}

/// One fixed-width output row: roll, pitch, yaw for every sensor, in sensor
/// index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputRecord(Vec<f32>);

impl OutputRecord {
    /// A zeroed row wide enough for `sensors` sensors.
    pub fn for_sensors(sensors: usize) -> Self {
        Self(vec![0.0; sensors * EulerSample::CHANNELS])
    }

    pub fn sensor_count(&self) -> usize {
        self.0.len() / EulerSample::CHANNELS
    }

    pub fn channel_count(&self) -> usize {
        self.0.len()
    }

    /// Overwrite the three channels of sensor `index`.  Out-of-range indices
    /// are ignored.
    pub fn set_sensor(&mut self, index: usize, sample: &EulerSample) {
        let start = index * EulerSample::CHANNELS;
        if let Some(slot) = self.0.get_mut(start..start + EulerSample::CHANNELS) {
            slot.copy_from_slice(&sample.channels());
        }
    }

    pub fn sensor(&self, index: usize) -> Option<EulerSample> {
        let start = index * EulerSample::CHANNELS;
        match self.0.get(start..start + EulerSample::CHANNELS)? {
            [roll, pitch, yaw] => Some(EulerSample::new(*roll, *pitch, *yaw)),
            _ => None,
        }
    }

    pub fn channels(&self) -> &[f32] {
        &self.0
    }
}

/// Global error type spanning device setup, streaming and configuration.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("No wireless masters found")]
    DeviceNotFound,

    #[error("Failed to open port {port}: {details}")]
    PortOpen { port: String, details: String },

    #[error("Failed to construct device instance: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to {action}: {device}")]
    ModeTransition { device: DeviceId, action: String },

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Publish sink error: {0}")]
    Sink(String),

    #[error("Control channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Shorthand for a failed mode transition on `device`.
    pub fn transition(device: &DeviceId, action: impl Into<String>) -> Self {
        BridgeError::ModeTransition {
            device: device.clone(),
            action: action.into(),
        }
    }

    /// `true` for failures raised while bringing the hardware up. These abort
    /// the whole run.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::DeviceNotFound
                | BridgeError::PortOpen { .. }
                | BridgeError::DeviceUnavailable(_)
                | BridgeError::ModeTransition { .. }
                | BridgeError::UnsupportedConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_serializes_as_plain_string() {
        let id = DeviceId::new("00B42D54");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00B42D54\"");
        assert_eq!(id.to_string(), "00B42D54");
    }

    #[test]
    fn only_connected_state_is_connected() {
        assert!(ConnectivityState::Connected.is_connected());
        for state in [
            ConnectivityState::Disconnected,
            ConnectivityState::Rejected,
            ConnectivityState::PluggedIn,
            ConnectivityState::Wireless,
            ConnectivityState::OutputBuffering,
            ConnectivityState::Unknown,
        ] {
            assert!(!state.is_connected(), "{state:?} must not count as connected");
        }
    }

    #[test]
    fn connectivity_state_uses_snake_case() {
        let json = serde_json::to_string(&ConnectivityState::OutputBuffering).unwrap();
        assert_eq!(json, "\"output_buffering\"");
    }

    #[test]
    fn euler_sample_channel_order_is_roll_pitch_yaw() {
        let s = EulerSample::new(1.0, 2.0, 3.0);
        assert_eq!(s.channels(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn output_record_places_sensors_side_by_side() {
        let mut record = OutputRecord::for_sensors(2);
        assert_eq!(record.channel_count(), 6);

        record.set_sensor(1, &EulerSample::new(4.0, 5.0, 6.0));
        assert_eq!(record.channels(), &[0.0, 0.0, 0.0, 4.0, 5.0, 6.0]);
        assert_eq!(record.sensor(1), Some(EulerSample::new(4.0, 5.0, 6.0)));
        assert_eq!(record.sensor_count(), 2);

        // Out of range: ignored / None.
        record.set_sensor(2, &EulerSample::new(9.0, 9.0, 9.0));
        assert_eq!(record.channel_count(), 6);
        assert!(record.sensor(2).is_none());
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::transition(&DeviceId::new("master-1"), "goto config mode");
        assert_eq!(err.to_string(), "Failed to goto config mode: master-1");
        assert!(err.is_setup_failure());

        let err = BridgeError::Sink("closed".to_string());
        assert!(err.to_string().contains("closed"));
        assert!(!err.is_setup_failure());
    }
}
