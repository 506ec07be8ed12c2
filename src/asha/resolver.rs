//! Characteristic resolution.
//!
//! Walks the ASHA service of a device, records the handle of every known
//! characteristic and starts the PSM and read-only properties reads. Each
//! read runs on its own; a failed read leaves its field unset.

use log::{debug, error, info, warn};

use crate::{
   asha::{
      properties::ReadOnlyProperties,
      protocol::{ASHA_SERVICE_UUID, CharRole, parse_psm},
      session::{Session, WeakSession},
   },
   bluetooth::gatt::{CharHandle, DiscoveredChar},
   error::{AshaError, Result},
};

/// Roles a session cannot stream without.
const REQUIRED_ROLES: [CharRole; 2] = [CharRole::Psm, CharRole::AudioControlPoint];

/// Discovers the ASHA service of the session's device and its characteristics.
pub async fn resolve(session: &Session) -> Result<()> {
   let addr = session.address();
   let services = session.client().services(ASHA_SERVICE_UUID).await?;
   if services.is_empty() {
      return Err(AshaError::NotResolved("ASHA service"));
   }

   for service in services {
      if !session.attach_service(service) {
         error!("{addr}: more than one ASHA service exists, ignoring {service:04x}");
         continue;
      }
      debug!("{addr}: ASHA service at {service:04x}");
      let chars = session.client().characteristics(service).await?;
      classify(session, &chars);
   }

   for role in REQUIRED_ROLES {
      if session.handle(role).is_none() {
         error!("{addr}: ASHA service has no {role} characteristic");
      }
   }
   Ok(())
}

/// Assigns roles to discovered characteristics and starts the initial reads.
pub fn classify(session: &Session, chars: &[DiscoveredChar]) {
   let addr = session.address();
   for ch in chars {
      let Some(role) = CharRole::from_uuid(ch.uuid) else {
         debug!("{addr}: unsupported ASHA characteristic {}", ch.uuid);
         continue;
      };
      if !session.assign_handle(role, ch.handle) {
         warn!(
            "{addr}: duplicate {role} characteristic at {}, keeping the first",
            ch.handle
         );
         continue;
      }
      debug!("{addr}: {role} at {}", ch.handle);

      match role {
         CharRole::ReadOnlyProperties => {
            session.spawn(read_properties(session.downgrade(), ch.handle));
         },
         CharRole::Psm => {
            session.spawn(read_psm(session.downgrade(), ch.handle));
         },
         CharRole::Volume | CharRole::AudioControlPoint | CharRole::AudioStatus => {},
      }
   }
}

async fn read_value(session: &WeakSession, handle: CharHandle, what: &str) -> Option<Vec<u8>> {
   let (addr, client) = {
      let this = session.upgrade()?;
      (this.address(), this.client().clone())
   };
   debug!("{addr}: reading {what}");
   match client.read(handle).await {
      Ok(value) => Some(value),
      Err(e) => {
         match e.att_code() {
            Some(code) => warn!("{addr}: reading {what} failed with ATT error 0x{code:02x}"),
            None => warn!("{addr}: reading {what} failed: {e}"),
         }
         None
      },
   }
}

async fn read_psm(session: WeakSession, handle: CharHandle) {
   let Some(value) = read_value(&session, handle, "ASHA PSM").await else {
      return;
   };
   let Some(this) = session.upgrade() else {
      return;
   };
   match parse_psm(&value) {
      Ok(psm) => {
         info!("{}: ASHA PSM {psm}", this.address());
         this.store_psm(psm);
         // Properties may still be in flight here.
         this.configure();
      },
      Err(e) => warn!("{}: ASHA PSM discarded: {e}", this.address()),
   }
}

async fn read_properties(session: WeakSession, handle: CharHandle) {
   let Some(value) = read_value(&session, handle, "ASHA read-only properties").await else {
      return;
   };
   let Some(this) = session.upgrade() else {
      return;
   };
   match ReadOnlyProperties::decode(&value) {
      Ok(props) => {
         info!("{}: ASHA properties {props}", this.address());
         this.store_properties(props);
      },
      Err(e) => warn!(
         "{}: ASHA read-only properties discarded ({}): {e}",
         this.address(),
         hex::encode(&value)
      ),
   }
}
