//! Device contracts the bridge core needs from the hardware layer.
//!
//! Drivers implement these traits; the rest of the bridge only ever talks to
//! the traits, so a vendor SDK binding and the in-process
//! [`sim`][crate::sim] driver are interchangeable.
//!
//! | Trait | Role |
//! |---|---|
//! | [`Driver`] | Scans ports and opens a base station. |
//! | [`BaseStation`] | Mode transitions, update rate, radio, peer enumeration. |
//! | [`Sensor`] | Delivers decoded samples to a subscribed callback. |
//! | [`ConnectivityListener`] | Receives asynchronous link-state changes. |

use std::fmt;
use std::sync::Arc;

use mtwlink_types::{BridgeError, ConnectivityState, DeviceId, EulerSample};

/// Anything with a vendor id and a link state.
pub trait Device: Send + Sync {
    fn id(&self) -> &DeviceId;

    /// Current link state as last reported by the hardware.
    fn connectivity(&self) -> ConnectivityState;
}

/// Callback invoked by the device runtime on its own delivery thread for
/// every new decoded sample.
pub type SampleCallback = Box<dyn FnMut(EulerSample) + Send + 'static>;

/// A wireless motion tracker.
pub trait Sensor: Device {
    /// Install `callback` as this sensor's live-data handler.
    ///
    /// The callback stays installed until the returned [`Subscription`] is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceUnavailable`] when the sensor can no
    /// longer deliver data (e.g. it left the network).
    fn subscribe(&self, callback: SampleCallback) -> Result<Subscription, BridgeError>;
}

/// Receives link-state changes from a base station.  Called from the
/// runtime's connectivity thread, never from the control loop.
pub trait ConnectivityListener: Send + Sync {
    fn on_connectivity_changed(&self, device: Arc<dyn Device>, state: ConnectivityState);
}

/// Radio hub the sensors connect through.
pub trait BaseStation: Device {
    /// Enter configuration mode.
    fn goto_config(&mut self) -> Result<(), BridgeError>;

    /// Enter measurement mode; sensors start delivering samples.
    fn goto_measurement(&mut self) -> Result<(), BridgeError>;

    /// Update rates (Hz) the network can run at.
    fn supported_update_rates(&self) -> Vec<u32>;

    fn set_update_rate(&mut self, rate_hz: u32) -> Result<(), BridgeError>;

    fn is_radio_enabled(&self) -> bool;

    /// Enable the radio on `channel`.
    fn enable_radio(&mut self, channel: u8) -> Result<(), BridgeError>;

    fn disable_radio(&mut self) -> Result<(), BridgeError>;

    /// Route connectivity notifications to `listener`.  Replaces any
    /// previously attached listener.
    fn set_connectivity_listener(&mut self, listener: Arc<dyn ConnectivityListener>);

    /// Handles for every sensor currently attached to this station.
    fn sensors(&self) -> Result<Vec<Arc<dyn Sensor>>, BridgeError>;

    /// Release the port.  Safe to call more than once.
    fn close(&mut self);
}

/// Entry point of a hardware backend.
pub trait Driver {
    /// Enumerate every port that has a recognised device behind it.
    fn scan_ports(&mut self) -> Vec<PortInfo>;

    /// Open `port` and return the base station behind it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::PortOpen`] if the port cannot be opened.
    fn open_port(&mut self, port: &PortInfo) -> Result<Box<dyn BaseStation>, BridgeError>;
}

/// Result of a port scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port_name: String,
    pub baud_rate: u32,
    pub device_id: DeviceId,
    pub is_wireless_master: bool,
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Port: {} @ {} Bd, ID: {}",
            self.port_name, self.baud_rate, self.device_id
        )
    }
}

/// Live-data registration on a [`Sensor`].  Dropping it uninstalls the
/// callback; samples already buffered downstream are left alone.
pub struct Subscription {
    device: DeviceId,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(device: DeviceId, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            device,
            release: Some(Box::new(release)),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("device", &self.device)
            .field("active", &self.release.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
