//! Recognition of ASHA devices.
//!
//! A device is treated as an ASHA hearing aid when BlueZ lists the ASHA
//! service among its UUIDs. BlueZ learns the UUIDs from advertisements and
//! from the GATT database once services are resolved.

use std::collections::HashSet;

use uuid::Uuid;

use crate::asha::protocol::ASHA_SERVICE_UUID;

/// Capability bit 0 of the service data: the advertiser is the right side.
const ADV_SIDE_RIGHT: u8 = 1 << 0;

/// Advertised side of a device, if its service data carries one.
pub fn advertised_side(service_data: &[u8]) -> Option<&'static str> {
   // [0] version, [1] capability, [2..6] truncated hiSyncId
   let capability = *service_data.get(1)?;
   Some(if capability & ADV_SIDE_RIGHT != 0 {
      "right"
   } else {
      "left"
   })
}

pub fn has_asha_service(uuids: &HashSet<Uuid>) -> bool {
   uuids.contains(&ASHA_SERVICE_UUID)
}

pub async fn is_device_asha(dev: &bluer::Device) -> bool {
   if let Ok(Some(uuids)) = dev.uuids().await
      && has_asha_service(&uuids)
   {
      log::debug!("{}: ASHA service listed", dev.address());
      return true;
   }

   if let Ok(Some(data)) = dev.service_data().await
      && let Some(adv) = data.get(&ASHA_SERVICE_UUID)
   {
      log::debug!(
         "{}: ASHA advertisement ({} side)",
         dev.address(),
         advertised_side(adv).unwrap_or("unknown")
      );
      return true;
   }
   false
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_has_asha_service() {
      let audio_sink = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);
      assert!(!has_asha_service(&HashSet::from([audio_sink])));
      assert!(has_asha_service(&HashSet::from([audio_sink, ASHA_SERVICE_UUID])));
      assert!(!has_asha_service(&HashSet::new()));
   }

   #[test]
   fn test_advertised_side() {
      assert_eq!(advertised_side(&[0x01, 0x01, 0xaa, 0xbb, 0xcc, 0xdd]), Some("right"));
      assert_eq!(advertised_side(&[0x01, 0x00]), Some("left"));
      assert_eq!(advertised_side(&[0x01]), None);
   }
}
