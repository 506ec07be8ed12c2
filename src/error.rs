//! Error types for the ASHA service.
//!
//! This module defines all error types that can occur during the operation
//! of the ASHA service, including Bluetooth, D-Bus, I/O, attribute protocol
//! and channel establishment errors.

use bluer::Address;
use smol_str::SmolStr;
use thiserror::Error;

use crate::asha::properties::DecodeError;

/// Step of the audio channel establishment that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectStep {
   #[strum(serialize = "socket creation")]
   Create,
   #[strum(serialize = "local bind")]
   Bind,
   #[strum(serialize = "MTU setup")]
   SetMtu,
   #[strum(serialize = "connect")]
   Connect,
}

/// Main error type for the ASHA service.
#[derive(Error, Debug)]
pub enum AshaError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Malformed attribute: {0}")]
   Decode(#[from] DecodeError),

   #[error("Attribute protocol error 0x{code:02x}")]
   Protocol { code: u8 },

   #[error("Characteristic not resolved: {0}")]
   NotResolved(&'static str),

   #[error("Channel {step} failed: {source}")]
   Connect {
      step: ConnectStep,
      #[source]
      source: std::io::Error,
   },

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not ready for streaming")]
   NotReady,

   #[error("Transport busy")]
   Busy,

   #[error("Request cancelled")]
   Cancelled,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Central already registered for adapter {0}")]
   CentralExists(SmolStr),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl AshaError {
   /// Attribute protocol error code carried by this error, if any.
   pub const fn att_code(&self) -> Option<u8> {
      match self {
         Self::Protocol { code } => Some(*code),
         _ => None,
      }
   }
}

/// Convenience type alias for Results with `AshaError`.
pub type Result<T> = std::result::Result<T, AshaError>;
