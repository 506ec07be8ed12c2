//! ASHA session state.
//!
//! A [`Session`] is created for every connected device that exposes the ASHA
//! service. It collects the characteristic handles found by the resolver and
//! the values of the asynchronous PSM and read-only properties reads. Both
//! reads may complete in any order, or not at all.

use core::fmt;
use std::{
   collections::HashMap,
   future::Future,
   sync::{Arc, Weak},
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::task::JoinSet;

use crate::{
   asha::{
      central::CentralRegistry, properties::ReadOnlyProperties, protocol::CharRole,
      transport::{AshaTransport, AudioTransport},
   },
   bluetooth::gatt::{AttributeClient, CharHandle, ServiceHandle},
   event::{AshaEvent, EventSender},
};

struct SessionInner {
   address: Address,
   address_str: SmolStr,
   adapter: SmolStr,
   name: parking_lot::Mutex<SmolStr>,
   client: Arc<dyn AttributeClient>,
   centrals: Arc<CentralRegistry>,
   event_tx: EventSender,
   service: AtomicCell<Option<ServiceHandle>>,
   handles: parking_lot::Mutex<HashMap<CharRole, CharHandle>>,
   properties: AtomicCell<Option<ReadOnlyProperties>>,
   psm: AtomicCell<Option<u16>>,
   tasks: parking_lot::Mutex<JoinSet<()>>,
   transport: parking_lot::Mutex<Option<AshaTransport>>,
}

/// One connected ASHA device.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

/// Weak reference to a [`Session`].
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
   pub fn upgrade(&self) -> Option<Session> {
      self.0.upgrade().map(Session)
   }
}

impl fmt::Debug for Session {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Session")
         .field("address", &self.0.address)
         .field("adapter", &self.0.adapter)
         .field("psm", &self.psm())
         .field("properties", &self.properties())
         .finish_non_exhaustive()
   }
}

impl Session {
   pub fn new(
      address: Address,
      adapter: SmolStr,
      name: SmolStr,
      client: Arc<dyn AttributeClient>,
      centrals: Arc<CentralRegistry>,
      event_tx: EventSender,
   ) -> Self {
      Self(Arc::new(SessionInner {
         address,
         address_str: address.to_smolstr(),
         adapter,
         name: parking_lot::Mutex::new(name),
         client,
         centrals,
         event_tx,
         service: AtomicCell::new(None),
         handles: parking_lot::Mutex::new(HashMap::new()),
         properties: AtomicCell::new(None),
         psm: AtomicCell::new(None),
         tasks: parking_lot::Mutex::new(JoinSet::new()),
         transport: parking_lot::Mutex::new(None),
      }))
   }

   pub fn downgrade(&self) -> WeakSession {
      WeakSession(Arc::downgrade(&self.0))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn address_str(&self) -> &SmolStr {
      &self.0.address_str
   }

   pub fn adapter(&self) -> &SmolStr {
      &self.0.adapter
   }

   pub fn name(&self) -> SmolStr {
      self.0.name.lock().clone()
   }

   pub fn set_name(&self, name: SmolStr) {
      *self.0.name.lock() = name;
   }

   pub fn client(&self) -> &Arc<dyn AttributeClient> {
      &self.0.client
   }

   pub fn service(&self) -> Option<ServiceHandle> {
      self.0.service.load()
   }

   /// Binds the ASHA service instance. Only the first one is accepted.
   pub fn attach_service(&self, service: ServiceHandle) -> bool {
      self.0.service.compare_exchange(None, Some(service)).is_ok()
   }

   pub fn handle(&self, role: CharRole) -> Option<CharHandle> {
      self.0.handles.lock().get(&role).copied()
   }

   /// Records the handle of a characteristic role. The first assignment wins.
   pub fn assign_handle(&self, role: CharRole, handle: CharHandle) -> bool {
      let mut handles = self.0.handles.lock();
      if handles.contains_key(&role) {
         return false;
      }
      handles.insert(role, handle);
      true
   }

   /// PSM of the audio channel, once read.
   pub fn psm(&self) -> Option<u16> {
      self.0.psm.load()
   }

   pub fn properties(&self) -> Option<ReadOnlyProperties> {
      self.0.properties.load()
   }

   pub fn hi_sync_id(&self) -> Option<u64> {
      self.properties().map(|p| p.hi_sync_id)
   }

   pub(crate) fn store_psm(&self, psm: u16) {
      self.0.psm.store(Some(psm));
      self.0.event_tx.emit(self, AshaEvent::PsmResolved(psm));
   }

   pub(crate) fn store_properties(&self, properties: ReadOnlyProperties) {
      self.0.properties.store(Some(properties));
      self
         .0
         .event_tx
         .emit(self, AshaEvent::PropertiesUpdated(properties));
   }

   pub(crate) fn emit(&self, event: AshaEvent) {
      self.0.event_tx.emit(self, event);
   }

   /// Runs a task tied to the lifetime of this session.
   pub(crate) fn spawn<F>(&self, task: F)
   where
      F: Future<Output = ()> + Send + 'static,
   {
      let mut tasks = self.0.tasks.lock();
      while tasks.try_join_next().is_some() {}
      tasks.spawn(task);
   }

   /// Hands the session to the central of its adapter, if one is registered.
   pub(crate) fn configure(&self) {
      let Some(central) = self.0.centrals.find(&self.0.adapter) else {
         debug!(
            "{}: no ASHA central registered for {}",
            self.0.address, self.0.adapter
         );
         return;
      };
      if let Err(e) = central.configure(self) {
         warn!("{}: configuration failed: {e}", self.0.address);
      }
   }

   pub fn transport(&self) -> Option<AshaTransport> {
      self.0.transport.lock().clone()
   }

   /// Installs the transport of this session, unless one already exists.
   pub fn set_transport(&self, transport: AshaTransport) -> bool {
      let mut slot = self.0.transport.lock();
      if slot.is_some() {
         return false;
      }
      *slot = Some(transport);
      true
   }

   /// Tears the session down: transport first, then outstanding reads.
   pub fn destroy(&self) {
      let transport = self.0.transport.lock().take();
      if let Some(transport) = transport {
         transport.destroy();
      }
      self.0.tasks.lock().abort_all();
      info!("{}: ASHA session destroyed", self.0.address);
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address_str().as_str(),
          "name": self.name().as_str(),
          "adapter": self.adapter().as_str(),
          "psm": self.psm(),
      });

      if let Some(props) = self.properties() {
         info["properties"] = props.to_json();
      }

      if let Some(transport) = self.transport() {
         info["transport"] = json!(transport.state().to_str());
         if let Some(channel) = transport.channel_info() {
            info["imtu"] = json!(channel.imtu);
            info["omtu"] = json!(channel.omtu);
         }
      }
      info
   }
}
