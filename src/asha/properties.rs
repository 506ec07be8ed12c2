//! Read-only properties codec.
//!
//! The read-only properties characteristic is a fixed 17 byte record that
//! describes the static capabilities of a hearing aid: which ear it sits in,
//! which stereo set it belongs to, its render delay and the codecs it
//! accepts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Wire size of the read-only properties record.
pub const PROPERTIES_LEN: usize = 17;

const CAP_SIDE: u8 = 1 << 0;
const CAP_BINAURAL: u8 = 1 << 1;
const FEAT_COC_STREAMING: u8 = 1 << 0;

/// Error type for attribute payload decoding.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
   /// Payload does not have the fixed size of the attribute
   #[error("Length mismatch: expected {expected} bytes, got {actual}")]
   LengthMismatch { expected: usize, actual: usize },
}

/// Which ear the device is worn on.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
pub enum DeviceSide {
   #[strum(serialize = "left")]
   Left,
   #[strum(serialize = "right")]
   Right,
}

/// Whether the device is part of a binaural set.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
pub enum DeviceMode {
   #[strum(serialize = "monaural")]
   Monaural,
   #[strum(serialize = "binaural")]
   Binaural,
}

bitflags::bitflags! {
   /// Codecs advertised in the supported codecs field.
   #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
   #[serde(transparent)]
   pub struct Codecs: u16 {
      /// G.722 at 16 kHz.
      const G722_16KHZ = 1 << 1;
   }
}

/// Decoded read-only properties of an ASHA device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlyProperties {
   pub version: u8,
   pub side: DeviceSide,
   pub mode: DeviceMode,
   pub hi_sync_id: u64,
   pub coc_streaming_supported: bool,
   pub render_delay_ms: u16,
   pub reserved: u16,
   pub codecs: Codecs,
}

impl ReadOnlyProperties {
   /// Decodes the properties record.
   ///
   /// Fails unless `data` is exactly [`PROPERTIES_LEN`] bytes long.
   pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
      let data: &[u8; PROPERTIES_LEN] =
         data.try_into().map_err(|_| DecodeError::LengthMismatch {
            expected: PROPERTIES_LEN,
            actual: data.len(),
         })?;

      let caps = data[1];
      let mut hi_sync_id = [0u8; 8];
      hi_sync_id.copy_from_slice(&data[2..10]);

      Ok(Self {
         version: data[0],
         side: if caps & CAP_SIDE != 0 {
            DeviceSide::Right
         } else {
            DeviceSide::Left
         },
         mode: if caps & CAP_BINAURAL != 0 {
            DeviceMode::Binaural
         } else {
            DeviceMode::Monaural
         },
         hi_sync_id: u64::from_le_bytes(hi_sync_id),
         coc_streaming_supported: data[10] & FEAT_COC_STREAMING != 0,
         render_delay_ms: u16::from_le_bytes([data[11], data[12]]),
         reserved: u16::from_le_bytes([data[13], data[14]]),
         codecs: Codecs::from_bits_retain(u16::from_le_bytes([data[15], data[16]])),
      })
   }

   /// Encodes the properties back into their wire form.
   pub fn encode(&self) -> [u8; PROPERTIES_LEN] {
      let mut out = [0u8; PROPERTIES_LEN];
      out[0] = self.version;
      if self.side == DeviceSide::Right {
         out[1] |= CAP_SIDE;
      }
      if self.mode == DeviceMode::Binaural {
         out[1] |= CAP_BINAURAL;
      }
      out[2..10].copy_from_slice(&self.hi_sync_id.to_le_bytes());
      if self.coc_streaming_supported {
         out[10] |= FEAT_COC_STREAMING;
      }
      out[11..13].copy_from_slice(&self.render_delay_ms.to_le_bytes());
      out[13..15].copy_from_slice(&self.reserved.to_le_bytes());
      out[15..17].copy_from_slice(&self.codecs.bits().to_le_bytes());
      out
   }

   pub fn supports_g722(&self) -> bool {
      self.codecs.contains(Codecs::G722_16KHZ)
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "version": self.version,
          "side": self.side.to_string(),
          "mode": self.mode.to_string(),
          "hi_sync_id": format!("{:016x}", self.hi_sync_id),
          "coc_streaming_supported": self.coc_streaming_supported,
          "render_delay_ms": self.render_delay_ms,
          "g722": self.supports_g722(),
      })
   }
}

impl fmt::Display for ReadOnlyProperties {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "v{} {} {} sync={:016x} coc={} delay={}ms codecs=0x{:04x}",
         self.version,
         self.side,
         self.mode,
         self.hi_sync_id,
         self.coc_streaming_supported,
         self.render_delay_ms,
         self.codecs.bits()
      )
   }
}
