//! Event handling system for ASHA session updates.
//!
//! This module provides the event infrastructure for notifying about
//! device connections, attribute reads and transport state changes.

use std::sync::Arc;

use crate::asha::{properties::ReadOnlyProperties, session::Session, transport::TransportState};

/// Events that can be emitted by the ASHA service.
#[derive(Debug, Clone)]
pub enum AshaEvent {
   DeviceConnected,
   DeviceDisconnected,
   PropertiesUpdated(ReadOnlyProperties),
   PsmResolved(u16),
   TransportStateChanged(TransportState),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, session: &Session, event: AshaEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
