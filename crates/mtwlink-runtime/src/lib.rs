//! `mtwlink-runtime` – Session orchestration and the streaming loop
//!
//! Drives a wireless network from port scan to shutdown and moves samples
//! from the per-sensor queues to a publish sink.
//!
//! # Modules
//!
//! - [`session`] – [`Session`]: the setup / stream / shutdown sequence over
//!   any [`Driver`][mtwlink_hal::Driver], with one top-level error handler
//!   that always runs cleanup.
//! - [`bridge_loop`] – [`BridgeLoop`]: drains one sample per sensor per
//!   tick, builds fixed-width rows and flushes them in batches.
//! - [`control`] – [`ControlCommand`] channel replacing interactive
//!   keyboard prompts, plus the loop's [`WaitStrategy`].
//! - [`rate`] – [`find_closest_update_rate`][rate::find_closest_update_rate].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP span export.

pub mod bridge_loop;
pub mod control;
pub mod rate;
pub mod session;
pub mod telemetry;

pub use bridge_loop::{BridgeLoop, BridgeLoopConfig, LoopStats, SensorFeed};
pub use control::{ControlCommand, ControlReceiver, ControlSender, WaitStrategy, control_channel};
pub use session::{Session, SessionConfig, SessionOutcome, StreamReport};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
