use std::{io, os::fd::OwnedFd, str::FromStr, sync::Arc};

use bluer::Address;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use zbus::{interface, object_server::SignalEmitter, zvariant};

use crate::{
   asha::{
      session::Session,
      transport::{AudioTransport, CallbackId, ChannelInfo, TransportOwner, TransportState},
   },
   bluetooth::{l2cap::AudioChannel, manager::BluetoothManager},
   error::{AshaError, Result},
};

type AcquireReply = Result<(OwnedFd, ChannelInfo)>;

/// Transport owner answering one D-Bus call.
struct DbusOwner {
   fd: Mutex<Option<OwnedFd>>,
   reply: Mutex<Option<oneshot::Sender<AcquireReply>>>,
}

impl DbusOwner {
   fn new() -> (Arc<Self>, oneshot::Receiver<AcquireReply>) {
      let (tx, rx) = oneshot::channel();
      let owner = Arc::new(Self {
         fd: Mutex::new(None),
         reply: Mutex::new(Some(tx)),
      });
      (owner, rx)
   }
}

impl TransportOwner for DbusOwner {
   fn set_channel(&self, channel: &AudioChannel) -> io::Result<()> {
      *self.fd.lock() = Some(channel.try_clone_fd()?);
      Ok(())
   }

   fn reply(&self, id: CallbackId, result: Result<ChannelInfo>) {
      let Some(tx) = self.reply.lock().take() else {
         return;
      };
      debug!("Acquire {id} answered");
      let reply = result.and_then(|info| {
         let fd = self
            .fd
            .lock()
            .take()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
         Ok((fd, info))
      });
      let _ = tx.send(reply);
   }

   fn relinquish(&self) {
      if let Some(tx) = self.reply.lock().take() {
         let _ = tx.send(Err(AshaError::NotReady));
      }
   }
}

/// Resumes the transport of `session` and waits for the channel.
async fn acquire(session: &Session) -> AcquireReply {
   let transport = session.transport().ok_or(AshaError::NotReady)?;
   if transport.state() != TransportState::Idle {
      return Err(AshaError::Busy);
   }
   let (owner, rx) = DbusOwner::new();
   // A rejected resume drops the owner and with it the reply sender.
   let _ = transport.resume(owner);
   rx.await.map_err(|_| AshaError::Busy)?
}

/// Suspends the transport of `session`. Returns whether it was streaming.
fn release(session: &Session) -> Result<bool> {
   let transport = session.transport().ok_or(AshaError::NotReady)?;
   let active = transport.state() == TransportState::Active;
   let (owner, _) = DbusOwner::new();
   transport.suspend(owner);
   Ok(active)
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: AshaError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

pub struct AshaService {
   bluetooth_manager: BluetoothManager,
}

impl AshaService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

#[interface(name = "org.ashad.Manager")]
impl AshaService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let states: Vec<serde_json::Value> = self
         .bluetooth_manager
         .all_devices()
         .await
         .iter()
         .map(Session::to_json)
         .collect();
      Ok(serde_json::Value::Array(states).to_string())
   }

   async fn get_device(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let session = self
         .bluetooth_manager
         .get_device(addr)
         .await
         .map_err(failed)?;
      Ok(session.to_json().to_string())
   }

   #[zbus(out_args("fd", "imtu", "omtu"))]
   async fn acquire(
      &self,
      address: String,
   ) -> zbus::fdo::Result<(zvariant::OwnedFd, u16, u16)> {
      let addr = parse_address(&address)?;
      let session = self
         .bluetooth_manager
         .get_device(addr)
         .await
         .map_err(failed)?;

      let (fd, info) = acquire(&session).await.map_err(failed)?;
      info!(
         "Acquired audio channel of {address} (imtu {}, omtu {})",
         info.imtu, info.omtu
      );
      Ok((fd.into(), info.imtu, info.omtu))
   }

   async fn release(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let session = self
         .bluetooth_manager
         .get_device(addr)
         .await
         .map_err(failed)?;

      let released = release(&session).map_err(failed)?;
      if released {
         info!("Released audio channel of {address}");
      }
      Ok(released)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn properties_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      properties: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transport_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      state: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }
}
