//! ASHA protocol definitions.
//!
//! This module contains the GATT UUIDs of the ASHA service, the roles of its
//! characteristics and the audio control point command encoding.

use smallvec::SmallVec;
use uuid::Uuid;

use crate::asha::properties::DecodeError;

/// ASHA primary service (16-bit alias 0xFDF0).
pub const ASHA_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fdf0_0000_1000_8000_00805f9b34fb);
pub const PSM_UUID: Uuid = Uuid::from_u128(0x2d410339_82b6_42aa_b34e_e2e01df8cc1a);
pub const VOLUME_UUID: Uuid = Uuid::from_u128(0x00e4ca9e_ab14_41e4_8823_f9e70c7e91df);
pub const AUDIO_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0xf0d4de7e_4a88_476c_9d9f_1937b0996cc0);
pub const AUDIO_STATUS_UUID: Uuid = Uuid::from_u128(0x38663f1a_e711_4cac_b641_326b56404837);
pub const READ_ONLY_PROPERTIES_UUID: Uuid =
   Uuid::from_u128(0x6333651e_c481_4a3e_9169_7c902aad37bb);

/// Default SDU size of the audio data channel, both directions.
pub const DEFAULT_AUDIO_MTU: u16 = 167;

/// Wire size of the PSM characteristic value.
pub const PSM_LEN: usize = 2;

/// Logical role of a characteristic inside the ASHA service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum CharRole {
   #[strum(serialize = "PSM")]
   Psm,
   #[strum(serialize = "volume")]
   Volume,
   #[strum(serialize = "audio control point")]
   AudioControlPoint,
   #[strum(serialize = "audio status")]
   AudioStatus,
   #[strum(serialize = "read-only properties")]
   ReadOnlyProperties,
}

impl CharRole {
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::Psm => PSM_UUID,
         Self::Volume => VOLUME_UUID,
         Self::AudioControlPoint => AUDIO_CONTROL_POINT_UUID,
         Self::AudioStatus => AUDIO_STATUS_UUID,
         Self::ReadOnlyProperties => READ_ONLY_PROPERTIES_UUID,
      }
   }

   /// Classifies a characteristic UUID, `None` for anything outside ASHA.
   pub fn from_uuid(uuid: Uuid) -> Option<Self> {
      use strum::IntoEnumIterator;
      Self::iter().find(|role| role.uuid() == uuid)
   }
}

/// Decodes the PSM characteristic value (u16, little endian).
pub fn parse_psm(data: &[u8]) -> Result<u16, DecodeError> {
   let data: [u8; PSM_LEN] = data.try_into().map_err(|_| DecodeError::LengthMismatch {
      expected: PSM_LEN,
      actual: data.len(),
   })?;
   Ok(u16::from_le_bytes(data))
}

pub type Command = SmallVec<[u8; 8]>;

/// Audio control point opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Opcode {
   Start = 0x01,
   Stop = 0x02,
   Status = 0x03,
}

/// Codec identifiers used in the start command.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum CodecId {
   #[strum(serialize = "G.722@16kHz")]
   G722 = 0x01,
}

/// Content type announced in the start command.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum AudioType {
   Unknown = 0x00,
   Ringtone = 0x01,
   Phonecall = 0x02,
   Media = 0x03,
}

/// Connection state of the other device of a binaural set.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum OtherState {
   Disconnected = 0x00,
   Connected = 0x01,
}

/// Parameters of a start command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartParams {
   pub codec: CodecId,
   pub audio_type: AudioType,
   pub volume: i8,
   pub other_state: OtherState,
}

impl Default for StartParams {
   fn default() -> Self {
      Self {
         codec: CodecId::G722,
         audio_type: AudioType::Unknown,
         volume: -64,
         other_state: OtherState::Disconnected,
      }
   }
}

/// A command written to the audio control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointCommand {
   Start(StartParams),
   Stop,
   Status(OtherState),
}

impl ControlPointCommand {
   pub const fn opcode(&self) -> Opcode {
      match self {
         Self::Start(_) => Opcode::Start,
         Self::Stop => Opcode::Stop,
         Self::Status(_) => Opcode::Status,
      }
   }

   pub fn build(&self) -> Command {
      let op = self.opcode() as u8;
      match self {
         Self::Start(p) => Command::from_slice(&[
            op,
            p.codec as u8,
            p.audio_type as u8,
            p.volume as u8,
            p.other_state as u8,
         ]),
         Self::Stop => Command::from_slice(&[op]),
         Self::Status(other) => Command::from_slice(&[op, *other as u8]),
      }
   }
}
