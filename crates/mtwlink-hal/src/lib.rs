//! `mtwlink-hal` – Device layer and packet-buffering core.
//!
//! # Modules
//!
//! - [`device`] – the [`Driver`], [`BaseStation`], [`Sensor`] and
//!   [`ConnectivityListener`] contracts a hardware backend implements.
//! - [`registry`] – [`ConnectivityRegistry`]: thread-safe set of connected
//!   peers fed by asynchronous link notifications.
//! - [`packet_queue`] – [`PacketQueue`]: per-sensor FIFO between the delivery
//!   thread and the control loop, split into SPSC handles.
//! - [`sim`] – [`SimDriver`][sim::SimDriver]: in-process simulated network
//!   for tests and hardware-free runs.

pub mod device;
pub mod packet_queue;
pub mod registry;
pub mod sim;

pub use device::{
    BaseStation, ConnectivityListener, Device, Driver, PortInfo, SampleCallback, Sensor,
    Subscription,
};
pub use packet_queue::{DataSignal, PacketQueue, QueuePolicy, SampleConsumer, SampleProducer};
pub use registry::{ConnectedSet, ConnectivityRegistry};
