//! [`Session`] – one bring-up / stream / shut-down cycle of a wireless
//! network.
//!
//! # Phases
//!
//! ```text
//!  scan ─▶ open ─▶ config mode ─▶ listener ─▶ update rate ─▶ radio on
//!                                                              │
//!        ┌──────────────── Quit ◀── wait for sensors ◀─────────┘
//!        │                              │ Start
//!        │                              ▼
//!        │        measurement ─▶ subscribe ─▶ declare stream ─▶ BridgeLoop
//!        │                                                         │ Quit
//!        ▼                                                         ▼
//!   config mode ─▶ radio off ─▶ close ◀──── release subscriptions ◀┘
//! ```
//!
//! Every setup step returns `Result<_, BridgeError>`.  The first failure
//! aborts the run: the error and the `****ABORT****` banner are logged, the
//! radio is switched off on a best-effort basis and the port is closed.
//! Faults while streaming (sink errors) only end the streaming phase; the
//! regular shutdown still runs.

use std::sync::Arc;
use std::time::Duration;

use mtwlink_hal::{
    BaseStation, ConnectivityListener, ConnectivityRegistry, DataSignal, Device, Driver,
    PacketQueue, PortInfo, QueuePolicy, Subscription,
};
use mtwlink_middleware::{PublishSink, StreamInfo};
use mtwlink_types::{BridgeError, DeviceId, EulerSample};
use tracing::{error, info, instrument, warn};

use crate::bridge_loop::{BridgeLoop, BridgeLoopConfig, LoopStats, SensorFeed};
use crate::control::{ControlCommand, ControlReceiver};
use crate::rate::find_closest_update_rate;

pub const DEFAULT_UPDATE_RATE: u32 = 75;
pub const DEFAULT_RADIO_CHANNEL: u8 = 19;
pub const DEFAULT_STREAM_NAME: &str = "XsensRaw";
pub const DEFAULT_STREAM_TYPE: &str = "rawAngles";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and outcome
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Update rate (Hz) to approximate.
    pub desired_update_rate: u32,
    pub radio_channel: u8,
    pub stream_name: String,
    pub stream_type: String,
    pub queue_policy: QueuePolicy,
    pub loop_config: BridgeLoopConfig,
    /// How often the connection wait re-checks the sensor count.
    pub connection_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            desired_update_rate: DEFAULT_UPDATE_RATE,
            radio_channel: DEFAULT_RADIO_CHANNEL,
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            stream_type: DEFAULT_STREAM_TYPE.to_string(),
            queue_policy: QueuePolicy::default(),
            loop_config: BridgeLoopConfig::default(),
            connection_poll: Duration::from_millis(100),
        }
    }
}

/// What happened during the streaming phase.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    /// Update rate the network actually ran at.
    pub update_rate: u32,
    /// Subscribed sensors, in output column order.
    pub sensors: Vec<DeviceId>,
    pub stats: LoopStats,
    /// Samples evicted by queue overflow.
    pub dropped: u64,
    /// Error that ended streaming early, if any.
    pub fault: Option<BridgeError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Measurement ran and was stopped.
    Streamed(StreamReport),
    /// The operator quit before measurement started.
    Cancelled,
    /// A setup step failed.
    Aborted(BridgeError),
}

impl SessionOutcome {
    /// `false` only for [`SessionOutcome::Aborted`].
    pub fn is_success(&self) -> bool {
        !matches!(self, SessionOutcome::Aborted(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

pub struct Session<D: Driver> {
    driver: D,
    config: SessionConfig,
    registry: Arc<ConnectivityRegistry>,
}

impl<D: Driver> Session<D> {
    pub fn new(driver: D, config: SessionConfig) -> Self {
        Self {
            driver,
            config,
            registry: Arc::new(ConnectivityRegistry::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Registry fed by the base station's connectivity notifications.
    pub fn registry(&self) -> &Arc<ConnectivityRegistry> {
        &self.registry
    }

    /// Run the full cycle.  `open_sink` is called once, with the declared
    /// stream identity, right before streaming starts.
    ///
    /// Never panics on device failures; the outcome says how far it got.
    /// Shutdown always runs and the last log line is `Successful exit.`.
    pub fn run<F>(&mut self, control: &ControlReceiver, open_sink: F) -> SessionOutcome
    where
        F: FnOnce(StreamInfo) -> Result<Box<dyn PublishSink>, BridgeError>,
    {
        let mut station: Option<Box<dyn BaseStation>> = None;
        let outcome = match self.drive(&mut station, control, open_sink) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{e}");
                error!("****ABORT****");
                if let Some(station) = station.as_deref_mut() {
                    radio_off_best_effort(station);
                }
                SessionOutcome::Aborted(e)
            }
        };

        if let Some(mut station) = station.take() {
            info!("Closing port...");
            station.close();
        }
        info!("Successful exit.");
        outcome
    }

    fn drive<F>(
        &mut self,
        slot: &mut Option<Box<dyn BaseStation>>,
        control: &ControlReceiver,
        open_sink: F,
    ) -> Result<SessionOutcome, BridgeError>
    where
        F: FnOnce(StreamInfo) -> Result<Box<dyn PublishSink>, BridgeError>,
    {
        let port = self.find_master()?;
        let station = &mut **slot.insert(self.open(&port)?);

        info!("Putting device into configuration mode...");
        station.goto_config()?;

        info!("Attaching callback handler...");
        let listener: Arc<dyn ConnectivityListener> = self.registry.clone();
        station.set_connectivity_listener(listener);

        let rate = self.configure_rate(station)?;
        self.configure_radio(station)?;

        if !self.wait_for_sensors(control) {
            info!("Quit requested before measurement");
            stop_measurement(station)?;
            return Ok(SessionOutcome::Cancelled);
        }

        let report = self.stream(station, rate, control, open_sink)?;
        stop_measurement(station)?;
        Ok(SessionOutcome::Streamed(report))
    }

    #[instrument(skip_all)]
    fn find_master(&mut self) -> Result<PortInfo, BridgeError> {
        info!("Scanning ports...");
        let port = self
            .driver
            .scan_ports()
            .into_iter()
            .find(|p| p.is_wireless_master)
            .ok_or(BridgeError::DeviceNotFound)?;
        info!("Found a device with: {port}");
        Ok(port)
    }

    #[instrument(skip_all, fields(port = %port.port_name))]
    fn open(&mut self, port: &PortInfo) -> Result<Box<dyn BaseStation>, BridgeError> {
        info!("Opening port...");
        self.driver.open_port(port)
    }

    #[instrument(skip_all, fields(desired = self.config.desired_update_rate))]
    fn configure_rate(&self, station: &mut dyn BaseStation) -> Result<u32, BridgeError> {
        let rates = station.supported_update_rates();
        let listed = rates
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        info!("Supported update rates: {listed}");

        let rate = find_closest_update_rate(&rates, self.config.desired_update_rate)
            .ok_or_else(|| {
                BridgeError::UnsupportedConfig(format!(
                    "{} reports no supported update rates",
                    station.id()
                ))
            })?;
        info!("Setting update rate to {rate} Hz...");
        station.set_update_rate(rate)?;
        Ok(rate)
    }

    #[instrument(skip_all, fields(channel = self.config.radio_channel))]
    fn configure_radio(&self, station: &mut dyn BaseStation) -> Result<(), BridgeError> {
        if station.is_radio_enabled() {
            info!("Disabling radio channel left enabled by a previous run...");
            station.disable_radio()?;
        }
        info!(
            "Setting radio channel to {} and enabling radio...",
            self.config.radio_channel
        );
        station.enable_radio(self.config.radio_channel)
    }

    /// Report the connected count until the operator decides.  `true` means
    /// start measuring.
    #[instrument(skip_all)]
    fn wait_for_sensors(&self, control: &ControlReceiver) -> bool {
        info!("Waiting for MTW to wirelessly connect...");
        let mut known = 0;
        loop {
            let connected = self.registry.len();
            if connected != known {
                info!(
                    "Number of connected MTWs: {connected}. Send 'start' to start measurement or 'quit' to exit."
                );
                known = connected;
            }
            match control.recv_timeout(self.config.connection_poll) {
                Some(ControlCommand::Start) => {
                    info!(connected = self.registry.len(), "start requested");
                    return true;
                }
                Some(ControlCommand::Quit) => return false,
                None => {}
            }
        }
    }

    #[instrument(skip_all, fields(rate_hz = rate))]
    fn stream<F>(
        &self,
        station: &mut dyn BaseStation,
        rate: u32,
        control: &ControlReceiver,
        open_sink: F,
    ) -> Result<StreamReport, BridgeError>
    where
        F: FnOnce(StreamInfo) -> Result<Box<dyn PublishSink>, BridgeError>,
    {
        info!("Starting measurement...");
        station.goto_measurement()?;

        info!("Getting device instances for all MTWs...");
        let sensors = station.sensors()?;
        if sensors.is_empty() {
            return Err(BridgeError::DeviceUnavailable(
                "no MTW connected to the wireless master".to_string(),
            ));
        }

        info!("Attaching callback handlers to MTWs...");
        let signal = DataSignal::new();
        let mut feeds = Vec::with_capacity(sensors.len());
        let mut subscriptions: Vec<Subscription> = Vec::with_capacity(sensors.len());
        for sensor in &sensors {
            let (producer, consumer) = PacketQueue::new(self.config.queue_policy)
                .with_signal(Arc::clone(&signal))
                .split();
            subscriptions.push(sensor.subscribe(Box::new(move |sample| producer.push(sample)))?);
            feeds.push(SensorFeed::new(sensor.id().clone(), consumer));
        }
        let ids: Vec<DeviceId> = feeds.iter().map(|f| f.id.clone()).collect();

        let info = StreamInfo::new(
            self.config.stream_name.as_str(),
            self.config.stream_type.as_str(),
            ids.len() * EulerSample::CHANNELS,
            f64::from(rate),
        );
        info!(
            "Declaring stream '{}' ({}, {} channels @ {rate} Hz)",
            info.name, info.kind, info.channel_count
        );

        let (stats, dropped, fault) = match open_sink(info) {
            Ok(sink) => {
                let mut bridge =
                    BridgeLoop::new(feeds, sink, self.config.loop_config).with_signal(signal);
                let result = bridge.run(control);
                (bridge.stats(), bridge.dropped_samples(), result.err())
            }
            Err(e) => (LoopStats::default(), 0, Some(e)),
        };
        if let Some(e) = &fault {
            error!("Got an exception while streaming: {e}");
        }
        if dropped > 0 {
            warn!(dropped, "samples discarded by queue overflow");
        }

        info!("Releasing sensor subscriptions...");
        drop(subscriptions);

        Ok(StreamReport {
            update_rate: rate,
            sensors: ids,
            stats,
            dropped,
            fault,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shutdown helpers
// ─────────────────────────────────────────────────────────────────────────────

fn stop_measurement(station: &mut dyn BaseStation) -> Result<(), BridgeError> {
    info!("Setting config mode...");
    station.goto_config()?;
    info!("Disabling radio...");
    station.disable_radio()
}

/// Cleanup after an abort.  Failures are logged and otherwise ignored.
fn radio_off_best_effort(station: &mut dyn BaseStation) {
    if let Err(e) = station.goto_config() {
        warn!("cleanup: {e}");
    }
    if station.is_radio_enabled()
        && let Err(e) = station.disable_radio()
    {
        warn!("cleanup: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSender, control_channel};
    use mtwlink_hal::sim::{SimAction, SimDriver, SimFault};
    use mtwlink_middleware::{StreamInlet, StreamOutlet};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            connection_poll: Duration::from_millis(5),
            loop_config: BridgeLoopConfig {
                batch_size: 5,
                ..BridgeLoopConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn discard_sink(info: StreamInfo) -> Result<Box<dyn PublishSink>, BridgeError> {
        Ok(Box::new(StreamOutlet::new(info, 4)))
    }

    /// Send `Start` once `count` sensors are connected.
    fn start_when_connected(
        registry: Arc<ConnectivityRegistry>,
        count: usize,
        tx: ControlSender,
    ) -> thread::JoinHandle<ControlSender> {
        thread::spawn(move || {
            let mut seen = 0;
            let deadline = Instant::now() + Duration::from_secs(5);
            while seen < count && Instant::now() < deadline {
                seen = registry.wait_for_change(seen, Duration::from_millis(50));
            }
            tx.send(ControlCommand::Start).unwrap();
            tx
        })
    }

    #[test]
    fn streams_chunks_until_quit() {
        let driver = SimDriver::builder().with_sensors(2);
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (tx, rx) = control_channel();
        let (inlet_tx, inlet_rx) = mpsc::channel::<StreamInlet>();

        let starter = start_when_connected(Arc::clone(session.registry()), 2, tx);
        let operator = thread::spawn(move || {
            let tx = starter.join().unwrap();
            let mut inlet = inlet_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            let chunk = loop {
                if let Some(chunk) = inlet.try_recv() {
                    break chunk;
                }
                assert!(Instant::now() < deadline, "no chunk published");
                thread::sleep(Duration::from_millis(5));
            };
            tx.send(ControlCommand::Quit).unwrap();
            chunk
        });

        let outcome = session.run(&rx, move |info| {
            let outlet = StreamOutlet::new(info, 64);
            inlet_tx
                .send(outlet.subscribe())
                .map_err(|e| BridgeError::Channel(e.to_string()))?;
            Ok(Box::new(outlet) as Box<dyn PublishSink>)
        });
        let chunk = operator.join().unwrap();

        assert_eq!(chunk.rows.len(), 5);
        assert!(chunk.rows.iter().all(|r| r.channel_count() == 6));

        let SessionOutcome::Streamed(report) = outcome else {
            panic!("expected a streamed outcome, got {outcome:?}");
        };
        assert_eq!(report.update_rate, 75);
        assert_eq!(report.sensors.len(), 2);
        assert!(report.fault.is_none());
        assert!(report.stats.chunks >= 1);

        let actions = log.actions();
        assert!(actions.contains(&SimAction::SetUpdateRate(75)));
        assert!(actions.contains(&SimAction::EnableRadio(19)));
        assert!(actions.contains(&SimAction::GotoMeasurement));
        assert_eq!(
            &actions[actions.len() - 3..],
            &[SimAction::GotoConfig, SimAction::DisableRadio, SimAction::Close]
        );
    }

    #[test]
    fn missing_master_aborts_without_opening() {
        let driver = SimDriver::builder().failing_at(SimFault::NoMaster);
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (_tx, rx) = control_channel();

        let outcome = session.run(&rx, discard_sink);
        assert_eq!(outcome, SessionOutcome::Aborted(BridgeError::DeviceNotFound));
        assert!(!outcome.is_success());
        assert!(log.actions().is_empty());
    }

    #[test]
    fn port_open_failure_aborts() {
        let driver = SimDriver::builder().failing_at(SimFault::PortOpen);
        let mut session = Session::new(driver, fast_config());
        let (_tx, rx) = control_channel();
        assert!(matches!(
            session.run(&rx, discard_sink),
            SessionOutcome::Aborted(BridgeError::PortOpen { .. })
        ));
    }

    #[test]
    fn empty_rate_table_is_unsupported() {
        let driver = SimDriver::builder()
            .with_sensors(1)
            .with_supported_rates(Vec::new());
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (_tx, rx) = control_channel();

        assert!(matches!(
            session.run(&rx, discard_sink),
            SessionOutcome::Aborted(BridgeError::UnsupportedConfig(_))
        ));
        let actions = log.actions();
        assert!(!actions.iter().any(|a| matches!(a, SimAction::SetUpdateRate(_))));
        assert_eq!(actions.last(), Some(&SimAction::Close));
    }

    #[test]
    fn closest_supported_rate_is_applied() {
        let driver = SimDriver::builder()
            .with_sensors(1)
            .with_supported_rates(vec![40, 60, 120]);
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (tx, rx) = control_channel();
        tx.send(ControlCommand::Quit).unwrap();

        assert_eq!(session.run(&rx, discard_sink), SessionOutcome::Cancelled);
        assert!(log.actions().contains(&SimAction::SetUpdateRate(60)));
    }

    #[test]
    fn radio_left_on_is_cycled() {
        let driver = SimDriver::builder().with_sensors(1).with_radio_enabled();
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (tx, rx) = control_channel();
        tx.send(ControlCommand::Quit).unwrap();
        session.run(&rx, discard_sink);

        let actions = log.actions();
        let off = actions.iter().position(|a| *a == SimAction::DisableRadio);
        let on = actions.iter().position(|a| *a == SimAction::EnableRadio(19));
        assert!(off.is_some() && on.is_some());
        assert!(off < on);
    }

    #[test]
    fn quit_before_start_skips_measurement() {
        let driver = SimDriver::builder().with_sensors(2);
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (tx, rx) = control_channel();
        tx.send(ControlCommand::Quit).unwrap();

        assert_eq!(session.run(&rx, discard_sink), SessionOutcome::Cancelled);
        let actions = log.actions();
        assert!(!actions.contains(&SimAction::GotoMeasurement));
        assert!(actions.contains(&SimAction::DisableRadio));
        assert_eq!(actions.last(), Some(&SimAction::Close));
    }

    #[test]
    fn measurement_failure_still_cleans_up() {
        let driver = SimDriver::builder()
            .with_sensors(1)
            .failing_at(SimFault::GotoMeasurement);
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (tx, rx) = control_channel();
        tx.send(ControlCommand::Start).unwrap();

        let outcome = session.run(&rx, discard_sink);
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted(BridgeError::ModeTransition { .. })
        ));
        let actions = log.actions();
        assert!(actions.contains(&SimAction::DisableRadio));
        assert_eq!(actions.last(), Some(&SimAction::Close));
    }

    #[test]
    fn start_without_sensors_aborts() {
        let driver = SimDriver::builder();
        let mut session = Session::new(driver, fast_config());
        let (tx, rx) = control_channel();
        tx.send(ControlCommand::Start).unwrap();

        assert!(matches!(
            session.run(&rx, discard_sink),
            SessionOutcome::Aborted(BridgeError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn sink_failure_ends_streaming_but_not_shutdown() {
        let driver = SimDriver::builder().with_sensors(1);
        let log = driver.action_log();
        let mut session = Session::new(driver, fast_config());
        let (tx, rx) = control_channel();
        let starter = start_when_connected(Arc::clone(session.registry()), 1, tx);

        let outcome = session.run(&rx, |_| Err(BridgeError::Sink("outlet refused".into())));
        let _tx = starter.join().unwrap();

        let SessionOutcome::Streamed(report) = outcome else {
            panic!("expected a streamed outcome, got {outcome:?}");
        };
        assert!(matches!(report.fault, Some(BridgeError::Sink(_))));
        assert_eq!(
            &log.actions()[log.actions().len() - 3..],
            &[SimAction::GotoConfig, SimAction::DisableRadio, SimAction::Close]
        );
    }
}
