//! `mtwlink-middleware` – Outbound streaming
//!
//! Carries finished output records from the control loop to downstream
//! consumers without caring about their meaning.
//!
//! # Modules
//!
//! - [`sink`] – the [`PublishSink`] contract and a newline-delimited JSON
//!   sink.
//! - [`outlet`] – [`StreamOutlet`] / [`StreamInlet`]: an in-process
//!   real-time stream bus built on Tokio broadcast channels.

pub mod outlet;
pub mod sink;

pub use outlet::{Chunk, StreamInfo, StreamInlet, StreamOutlet};
pub use sink::{JsonLinesSink, PublishSink};
