//! Real-time media engine surface consumed by the call orchestration core.
//!
//! The engine itself (audio mixing, codecs, transport) lives in a vendor SDK on
//! device. This crate only describes the operations and events the core relies
//! on, plus an in-process [`loopback`] engine used by tests and desktop builds.

pub mod engine;
pub mod error;
pub mod events;
pub mod loopback;

pub use engine::{EngineEventSink, EngineFactory, MediaEngine};
pub use error::{codes, EngineError};
pub use events::{ConnectionChangeReason, ConnectionState, EngineEvent, UserOfflineReason};
