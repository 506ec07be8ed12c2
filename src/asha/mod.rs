//! ASHA (Audio Streaming for Hearing Aids) client implementation.
//!
//! This module contains the per-device session, characteristic resolution,
//! the audio control point protocol and the audio transport state machine.

pub mod central;
pub mod control;
pub mod endpoint;
pub mod properties;
pub mod protocol;
pub mod recognition;
pub mod resolver;
pub mod session;
pub mod transport;
