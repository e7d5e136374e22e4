//! In-process simulated sensor network for CI and demos without hardware.
//!
//! [`SimDriver`] implements [`Driver`] and opens a [`SimBaseStation`] whose
//! sensors behave like real wireless trackers:
//!
//! | Action | Simulated behaviour |
//! |---|---|
//! | `enable_radio` | Every sensor announces `Connected` from a separate connectivity thread. |
//! | `disable_radio` | Every sensor announces `Disconnected` the same way. |
//! | `Sensor::subscribe` | Spawns a delivery thread producing [`waveform`] samples at the station's update rate while in measurement mode. |
//!
//! Any step can be made to fail with [`SimDriver::failing_at`] to exercise
//! the setup error paths.
//!
//! # Example
//!
//! ```rust
//! use mtwlink_hal::device::Driver;
//! use mtwlink_hal::sim::SimDriver;
//!
//! let mut driver = SimDriver::builder()
//!     .with_sensor("00B42D54")
//!     .with_sensor("00B42D55");
//!
//! let ports = driver.scan_ports();
//! let station = driver.open_port(&ports[0]).expect("sim port opens");
//! assert_eq!(station.supported_update_rates(), vec![60, 75, 80, 100, 120]);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mtwlink_types::{BridgeError, ConnectivityState, DeviceId, EulerSample};
use tracing::{debug, warn};

use crate::device::{
    BaseStation, ConnectivityListener, Device, Driver, PortInfo, SampleCallback, Sensor,
    Subscription,
};

const SIM_PORT: &str = "sim0";
const SIM_BAUD_RATE: u32 = 921_600;
const SIM_MASTER_ID: &str = "SIM-MASTER";
const DEFAULT_RATES: [u32; 5] = [60, 75, 80, 100, 120];

/// Setup step at which the simulation reports a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The scan finds no wireless master.
    NoMaster,
    PortOpen,
    GotoConfig,
    SetUpdateRate,
    EnableRadio,
    DisableRadio,
    GotoMeasurement,
}

/// Hardware-side action recorded by the simulation, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimAction {
    OpenPort,
    GotoConfig,
    SetUpdateRate(u32),
    EnableRadio(u8),
    DisableRadio,
    GotoMeasurement,
    Close,
}

/// Shared, cloneable view of the actions a [`SimBaseStation`] performed.
#[derive(Debug, Clone, Default)]
pub struct SimActionLog(Arc<Mutex<Vec<SimAction>>>);

impl SimActionLog {
    pub fn actions(&self) -> Vec<SimAction> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, action: SimAction) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }
}

/// Deterministic orientation for the `n`-th sample of sensor `index`.
pub fn waveform(index: usize, n: u64) -> EulerSample {
    let phase = n as f32 * 0.05 + index as f32;
    EulerSample {
        roll: 30.0 * phase.sin(),
        pitch: 15.0 * phase.cos(),
        yaw: ((n as f32 * 0.5 + index as f32 * 30.0) % 360.0) - 180.0,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimDriver
// ────────────────────────────────────────────────────────────────────────────

/// Builder and [`Driver`] for the simulated network.
#[derive(Debug, Clone)]
pub struct SimDriver {
    sensor_ids: Vec<DeviceId>,
    supported_rates: Vec<u32>,
    radio_initially_enabled: bool,
    fault: Option<SimFault>,
    log: SimActionLog,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self {
            sensor_ids: Vec::new(),
            supported_rates: DEFAULT_RATES.to_vec(),
            radio_initially_enabled: false,
            fault: None,
            log: SimActionLog::default(),
        }
    }
}

impl SimDriver {
    /// Create a driver with no sensors and the default rate table.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Attach a simulated sensor with the given id.
    pub fn with_sensor(mut self, id: impl Into<String>) -> Self {
        self.sensor_ids.push(DeviceId::new(id));
        self
    }

    /// Attach `count` sensors with generated ids.
    pub fn with_sensors(mut self, count: usize) -> Self {
        for n in 0..count {
            self.sensor_ids.push(DeviceId::new(format!("00B4{:04X}", n + 1)));
        }
        self
    }

    pub fn with_supported_rates(mut self, rates: Vec<u32>) -> Self {
        self.supported_rates = rates;
        self
    }

    /// Start with the radio already on, as left behind by a previous run.
    pub fn with_radio_enabled(mut self) -> Self {
        self.radio_initially_enabled = true;
        self
    }

    pub fn failing_at(mut self, fault: SimFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn action_log(&self) -> SimActionLog {
        self.log.clone()
    }
}

impl Driver for SimDriver {
    fn scan_ports(&mut self) -> Vec<PortInfo> {
        vec![PortInfo {
            port_name: SIM_PORT.to_string(),
            baud_rate: SIM_BAUD_RATE,
            device_id: DeviceId::new(SIM_MASTER_ID),
            is_wireless_master: self.fault != Some(SimFault::NoMaster),
        }]
    }

    fn open_port(&mut self, port: &PortInfo) -> Result<Box<dyn BaseStation>, BridgeError> {
        if self.fault == Some(SimFault::PortOpen) {
            return Err(BridgeError::PortOpen {
                port: port.to_string(),
                details: "simulated open failure".to_string(),
            });
        }
        self.log.record(SimAction::OpenPort);
        Ok(Box::new(SimBaseStation::new(port.device_id.clone(), self)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimBaseStation
// ────────────────────────────────────────────────────────────────────────────

/// Simulated wireless master.
pub struct SimBaseStation {
    id: DeviceId,
    sensors: Vec<Arc<SimSensor>>,
    supported_rates: Vec<u32>,
    update_rate: Arc<AtomicU32>,
    measuring: Arc<AtomicBool>,
    radio_channel: Option<u8>,
    listener: Option<Arc<dyn ConnectivityListener>>,
    announcers: Vec<JoinHandle<()>>,
    fault: Option<SimFault>,
    log: SimActionLog,
    closed: bool,
}

impl SimBaseStation {
    fn new(id: DeviceId, driver: &SimDriver) -> Self {
        let update_rate = Arc::new(AtomicU32::new(
            driver.supported_rates.first().copied().unwrap_or(60),
        ));
        let measuring = Arc::new(AtomicBool::new(false));
        let sensors = driver
            .sensor_ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                Arc::new(SimSensor {
                    id: id.clone(),
                    index,
                    state: Mutex::new(ConnectivityState::Disconnected),
                    update_rate: Arc::clone(&update_rate),
                    measuring: Arc::clone(&measuring),
                })
            })
            .collect();
        Self {
            id,
            sensors,
            supported_rates: driver.supported_rates.clone(),
            update_rate,
            measuring,
            radio_channel: driver.radio_initially_enabled.then_some(11),
            listener: None,
            announcers: Vec::new(),
            fault: driver.fault,
            log: driver.log.clone(),
            closed: false,
        }
    }

    fn check(&self, step: SimFault, action: &str) -> Result<(), BridgeError> {
        if self.fault == Some(step) {
            Err(BridgeError::transition(&self.id, action))
        } else {
            Ok(())
        }
    }

    /// Set every sensor to `state` and report it from a separate thread, the
    /// way a radio stack delivers link events.
    ///
    /// The previous batch is delivered in full before the next one starts, so
    /// listeners see radio transitions in call order.
    fn announce(&mut self, state: ConnectivityState) {
        self.join_announcers();
        for sensor in &self.sensors {
            sensor.set_state(state);
        }
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let sensors = self.sensors.clone();
        self.announcers.push(thread::spawn(move || {
            for sensor in sensors {
                let device: Arc<dyn Device> = sensor;
                listener.on_connectivity_changed(device, state);
            }
        }));
    }

    fn join_announcers(&mut self) {
        for handle in self.announcers.drain(..) {
            if handle.join().is_err() {
                warn!(station = %self.id, "connectivity announcer panicked");
            }
        }
    }
}

impl Device for SimBaseStation {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn connectivity(&self) -> ConnectivityState {
        if self.closed {
            ConnectivityState::Disconnected
        } else {
            ConnectivityState::PluggedIn
        }
    }
}

impl BaseStation for SimBaseStation {
    fn goto_config(&mut self) -> Result<(), BridgeError> {
        self.check(SimFault::GotoConfig, "goto config mode")?;
        self.measuring.store(false, Ordering::SeqCst);
        self.log.record(SimAction::GotoConfig);
        Ok(())
    }

    fn goto_measurement(&mut self) -> Result<(), BridgeError> {
        self.check(SimFault::GotoMeasurement, "goto measurement mode")?;
        self.measuring.store(true, Ordering::SeqCst);
        self.log.record(SimAction::GotoMeasurement);
        Ok(())
    }

    fn supported_update_rates(&self) -> Vec<u32> {
        self.supported_rates.clone()
    }

    fn set_update_rate(&mut self, rate_hz: u32) -> Result<(), BridgeError> {
        self.check(SimFault::SetUpdateRate, "set update rate")?;
        if !self.supported_rates.contains(&rate_hz) {
            return Err(BridgeError::UnsupportedConfig(format!(
                "update rate {rate_hz} Hz is not supported by {}",
                self.id
            )));
        }
        self.update_rate.store(rate_hz, Ordering::SeqCst);
        self.log.record(SimAction::SetUpdateRate(rate_hz));
        Ok(())
    }

    fn is_radio_enabled(&self) -> bool {
        self.radio_channel.is_some()
    }

    fn enable_radio(&mut self, channel: u8) -> Result<(), BridgeError> {
        self.check(SimFault::EnableRadio, "set radio channel")?;
        self.radio_channel = Some(channel);
        self.log.record(SimAction::EnableRadio(channel));
        self.announce(ConnectivityState::Connected);
        Ok(())
    }

    fn disable_radio(&mut self) -> Result<(), BridgeError> {
        self.check(SimFault::DisableRadio, "disable radio")?;
        self.radio_channel = None;
        self.log.record(SimAction::DisableRadio);
        self.announce(ConnectivityState::Disconnected);
        Ok(())
    }

    fn set_connectivity_listener(&mut self, listener: Arc<dyn ConnectivityListener>) {
        self.listener = Some(listener);
    }

    fn sensors(&self) -> Result<Vec<Arc<dyn Sensor>>, BridgeError> {
        Ok(self
            .sensors
            .iter()
            .filter(|s| s.connectivity().is_connected())
            .map(|s| Arc::clone(s) as Arc<dyn Sensor>)
            .collect())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.measuring.store(false, Ordering::SeqCst);
        self.join_announcers();
        self.closed = true;
        self.log.record(SimAction::Close);
        debug!(station = %self.id, "simulated port closed");
    }
}

impl Drop for SimBaseStation {
    fn drop(&mut self) {
        self.close();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimSensor
// ────────────────────────────────────────────────────────────────────────────

/// Simulated wireless tracker.
pub struct SimSensor {
    id: DeviceId,
    index: usize,
    state: Mutex<ConnectivityState>,
    update_rate: Arc<AtomicU32>,
    measuring: Arc<AtomicBool>,
}

impl SimSensor {
    fn set_state(&self, state: ConnectivityState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Device for SimSensor {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn connectivity(&self) -> ConnectivityState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sensor for SimSensor {
    fn subscribe(&self, mut callback: SampleCallback) -> Result<Subscription, BridgeError> {
        if !self.connectivity().is_connected() {
            return Err(BridgeError::DeviceUnavailable(format!(
                "{} is not connected",
                self.id
            )));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let index = self.index;
        let update_rate = Arc::clone(&self.update_rate);
        let measuring = Arc::clone(&self.measuring);
        let thread_stop = Arc::clone(&stop);

        let delivery = thread::spawn(move || {
            let mut n = 0u64;
            while !thread_stop.load(Ordering::SeqCst) {
                if measuring.load(Ordering::SeqCst) {
                    callback(waveform(index, n));
                    n += 1;
                }
                let rate = update_rate.load(Ordering::SeqCst).max(1);
                thread::sleep(Duration::from_secs_f64(1.0 / f64::from(rate)));
            }
        });

        let id = self.id.clone();
        debug!(sensor = %id, "simulated delivery thread started");
        Ok(Subscription::new(self.id.clone(), move || {
            stop.store(true, Ordering::SeqCst);
            if delivery.join().is_err() {
                warn!(sensor = %id, "simulated delivery thread panicked");
            }
        }))
    }
}
