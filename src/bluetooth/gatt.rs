//! GATT attribute client.
//!
//! The ASHA session only needs a handful of attribute operations, so they
//! are expressed as the [`AttributeClient`] trait. [`BluerClient`] implements
//! it on top of the services BlueZ has already resolved for a device.

use std::fmt;

use bluer::{Device, ErrorKind};
use futures::future::{BoxFuture, FutureExt};
use log::debug;
use uuid::Uuid;

use crate::error::{AshaError, Result};

/// Handle of a primary service on the remote device.
pub type ServiceHandle = u16;

/// Handle of a characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharHandle {
   pub service: ServiceHandle,
   pub characteristic: u16,
}

impl fmt::Display for CharHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:04x}/{:04x}", self.service, self.characteristic)
   }
}

/// A characteristic found while enumerating a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredChar {
   pub uuid: Uuid,
   pub handle: CharHandle,
}

/// Attribute operations on one remote device.
///
/// Implementations are shared by reference with other users of the same
/// device; operations may interleave.
pub trait AttributeClient: Send + Sync {
   /// Lists the primary services with the given UUID.
   fn services(&self, uuid: Uuid) -> BoxFuture<'_, Result<Vec<ServiceHandle>>>;

   /// Lists the characteristics of a service.
   fn characteristics(&self, service: ServiceHandle) -> BoxFuture<'_, Result<Vec<DiscoveredChar>>>;

   /// Reads a characteristic value.
   fn read(&self, handle: CharHandle) -> BoxFuture<'_, Result<Vec<u8>>>;

   /// Writes a characteristic value, waiting for the acknowledgment.
   fn write<'a>(&'a self, handle: CharHandle, value: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

/// [`AttributeClient`] backed by the BlueZ GATT client of a device.
#[derive(Debug, Clone)]
pub struct BluerClient {
   device: Device,
}

impl BluerClient {
   pub const fn new(device: Device) -> Self {
      Self { device }
   }

   async fn characteristic(&self, handle: CharHandle) -> Result<bluer::gatt::remote::Characteristic> {
      let service = self.device.service(handle.service).await?;
      Ok(service.characteristic(handle.characteristic).await?)
   }
}

impl AttributeClient for BluerClient {
   fn services(&self, uuid: Uuid) -> BoxFuture<'_, Result<Vec<ServiceHandle>>> {
      async move {
         let mut found = Vec::new();
         for service in self.device.services().await? {
            if service.uuid().await? == uuid {
               found.push(service.id());
            }
         }
         Ok(found)
      }
      .boxed()
   }

   fn characteristics(&self, service: ServiceHandle) -> BoxFuture<'_, Result<Vec<DiscoveredChar>>> {
      async move {
         let service = self.device.service(service).await?;
         let mut chars = Vec::new();
         for ch in service.characteristics().await? {
            chars.push(DiscoveredChar {
               uuid: ch.uuid().await?,
               handle: CharHandle {
                  service: service.id(),
                  characteristic: ch.id(),
               },
            });
         }
         Ok(chars)
      }
      .boxed()
   }

   fn read(&self, handle: CharHandle) -> BoxFuture<'_, Result<Vec<u8>>> {
      async move {
         let value = self
            .characteristic(handle)
            .await?
            .read()
            .await
            .map_err(att_error)?;
         debug!(
            "{}: read {handle} ← {}",
            self.device.address(),
            hex::encode(&value)
         );
         Ok(value)
      }
      .boxed()
   }

   fn write<'a>(&'a self, handle: CharHandle, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
      async move {
         debug!(
            "{}: write {handle} → {}",
            self.device.address(),
            hex::encode(value)
         );
         self
            .characteristic(handle)
            .await?
            .write(value)
            .await
            .map_err(att_error)?;
         Ok(())
      }
      .boxed()
   }
}

/// Recovers the attribute protocol error code of a failed read or write.
///
/// BlueZ turns a handful of codes into dedicated D-Bus errors and folds every
/// other one into the message as `ATT error: 0xNN`.
fn att_error(err: bluer::Error) -> AshaError {
   let folded = err.message.split_once("ATT error: 0x").and_then(|(_, rest)| {
      let digits = rest
         .char_indices()
         .take_while(|(i, c)| *i < 2 && c.is_ascii_hexdigit())
         .count();
      u8::from_str_radix(&rest[..digits], 16).ok()
   });
   let code = folded.or(match err.kind {
      ErrorKind::NotPermitted if err.message.starts_with("Write") => Some(0x03),
      ErrorKind::NotPermitted => Some(0x02),
      ErrorKind::NotSupported => Some(0x06),
      ErrorKind::InvalidOffset => Some(0x07),
      ErrorKind::NotAuthorized => Some(0x08),
      ErrorKind::InvalidLength => Some(0x0d),
      _ => None,
   });
   match code {
      Some(code) => AshaError::Protocol { code },
      None => AshaError::Bluetooth(err),
   }
}
