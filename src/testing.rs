//! In-memory stand-ins for the Bluetooth collaborators, used by unit tests.

use std::{
   collections::{HashMap, HashSet},
   io,
   os::fd::OwnedFd,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, MutexGuard};
use tokio::{sync::Notify, time};
use uuid::Uuid;

use crate::{
   asha::{
      central::{AudioEndpoint, Central, CentralRegistry},
      protocol::{AUDIO_CONTROL_POINT_UUID, PSM_UUID},
      resolver,
      session::Session,
      transport::{CallbackId, ChannelInfo, TransportOwner, TransportState},
   },
   bluetooth::{
      gatt::{AttributeClient, CharHandle, DiscoveredChar, ServiceHandle},
      l2cap::{AudioChannel, ChannelLink, ChannelOpener},
   },
   error::{AshaError, ConnectStep, Result},
   event::{AshaEvent, EventBus},
};

pub const ADDRESS: Address = Address::new([0x00, 0x1b, 0xdc, 0x0a, 0x0b, 0x0c]);

pub const SERVICE: ServiceHandle = 0x0010;

pub const CONTROL_POINT: CharHandle = CharHandle {
   service: SERVICE,
   characteristic: 0x12,
};

pub const PSM: CharHandle = CharHandle {
   service: SERVICE,
   characteristic: 0x15,
};

/// Left side, binaural, hiSyncId 0x1122334455667788, CoC, 40 ms, G.722.
pub const PROPERTIES: [u8; 17] = [
   0x01, 0x02, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x01, 0x28, 0x00, 0x00, 0x00,
   0x02, 0x00,
];

/// Polls `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
   let poll = async {
      while !cond() {
         time::sleep(Duration::from_millis(1)).await;
      }
   };
   time::timeout(Duration::from_secs(5), poll)
      .await
      .expect("condition not reached in time");
}

#[derive(Default)]
struct ClientState {
   services: Vec<(ServiceHandle, Vec<DiscoveredChar>)>,
   values: HashMap<u16, Vec<u8>>,
   read_errors: HashMap<u16, u8>,
   held_reads: HashSet<u16>,
   write_error: Option<u8>,
   hold_writes: bool,
   writes: Vec<(CharHandle, Vec<u8>)>,
}

/// Scripted attribute client.
#[derive(Default)]
pub struct FakeClient {
   state: Mutex<ClientState>,
   reads: AtomicUsize,
}

impl FakeClient {
   pub fn add_service(&self, service: ServiceHandle, chars: Vec<DiscoveredChar>) {
      self.state.lock().services.push((service, chars));
   }

   pub fn set_value(&self, characteristic: u16, value: &[u8]) {
      self.state.lock().values.insert(characteristic, value.to_vec());
   }

   pub fn fail_read(&self, characteristic: u16, code: u8) {
      self.state.lock().read_errors.insert(characteristic, code);
   }

   /// Reads of this characteristic never complete.
   pub fn hold_reads_of(&self, characteristic: u16) {
      self.state.lock().held_reads.insert(characteristic);
   }

   pub fn fail_writes(&self, code: u8) {
      self.state.lock().write_error = Some(code);
   }

   /// Writes are recorded but never acknowledged.
   pub fn hold_writes(&self) {
      self.state.lock().hold_writes = true;
   }

   pub fn reads(&self) -> usize {
      self.reads.load(Ordering::SeqCst)
   }

   pub fn writes(&self) -> Vec<(CharHandle, Vec<u8>)> {
      self.state.lock().writes.clone()
   }
}

impl AttributeClient for FakeClient {
   fn services(&self, uuid: Uuid) -> BoxFuture<'_, Result<Vec<ServiceHandle>>> {
      let services = if uuid == crate::asha::protocol::ASHA_SERVICE_UUID {
         self.state.lock().services.iter().map(|(s, _)| *s).collect()
      } else {
         Vec::new()
      };
      future::ready(Ok(services)).boxed()
   }

   fn characteristics(&self, service: ServiceHandle) -> BoxFuture<'_, Result<Vec<DiscoveredChar>>> {
      let chars = self
         .state
         .lock()
         .services
         .iter()
         .find(|(s, _)| *s == service)
         .map(|(_, chars)| chars.clone())
         .unwrap_or_default();
      future::ready(Ok(chars)).boxed()
   }

   fn read(&self, handle: CharHandle) -> BoxFuture<'_, Result<Vec<u8>>> {
      self.reads.fetch_add(1, Ordering::SeqCst);
      let state = self.state.lock();
      let id = handle.characteristic;
      if state.held_reads.contains(&id) {
         return future::pending().boxed();
      }
      let result = if let Some(code) = state.read_errors.get(&id) {
         Err(AshaError::Protocol { code: *code })
      } else {
         state
            .values
            .get(&id)
            .cloned()
            .ok_or(AshaError::Protocol { code: 0x0a })
      };
      future::ready(result).boxed()
   }

   fn write<'a>(&'a self, handle: CharHandle, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
      let mut state = self.state.lock();
      state.writes.push((handle, value.to_vec()));
      if state.hold_writes {
         return future::pending().boxed();
      }
      let result = match state.write_error {
         Some(code) => Err(AshaError::Protocol { code }),
         None => Ok(()),
      };
      future::ready(result).boxed()
   }
}

/// Channel link counting shutdowns.
#[derive(Debug, Default)]
pub struct FakeLink {
   shutdowns: AtomicUsize,
}

impl FakeLink {
   pub fn shutdowns(&self) -> usize {
      self.shutdowns.load(Ordering::SeqCst)
   }
}

impl ChannelLink for FakeLink {
   fn try_clone_fd(&self) -> io::Result<OwnedFd> {
      Err(io::ErrorKind::Unsupported.into())
   }

   fn shutdown(&self) -> io::Result<()> {
      self.shutdowns.fetch_add(1, Ordering::SeqCst);
      Ok(())
   }
}

/// Channel opener recording its calls.
#[derive(Default)]
pub struct FakeOpener {
   calls: Mutex<Vec<(Address, u16, u16)>>,
   links: Mutex<Vec<Arc<FakeLink>>>,
   fail: Mutex<Option<ConnectStep>>,
   held: AtomicBool,
   gate: Notify,
}

impl FakeOpener {
   pub fn calls(&self) -> Vec<(Address, u16, u16)> {
      self.calls.lock().clone()
   }

   /// Links of the channels opened so far.
   pub fn links(&self) -> Vec<Arc<FakeLink>> {
      self.links.lock().clone()
   }

   pub fn fail_with(&self, step: ConnectStep) {
      *self.fail.lock() = Some(step);
   }

   /// Opens block until [`FakeOpener::release`].
   pub fn hold(&self) {
      self.held.store(true, Ordering::SeqCst);
   }

   pub fn release(&self) {
      self.held.store(false, Ordering::SeqCst);
      self.gate.notify_waiters();
   }
}

impl ChannelOpener for FakeOpener {
   fn open(&self, address: Address, psm: u16, mtu: u16) -> BoxFuture<'_, Result<AudioChannel>> {
      async move {
         self.calls.lock().push((address, psm, mtu));
         let released = self.gate.notified();
         if self.held.load(Ordering::SeqCst) {
            released.await;
         }
         if let Some(step) = *self.fail.lock() {
            return Err(AshaError::Connect {
               step,
               source: io::ErrorKind::ConnectionRefused.into(),
            });
         }
         let link = Arc::new(FakeLink::default());
         self.links.lock().push(link.clone());
         Ok(AudioChannel::new(link, mtu, mtu))
      }
      .boxed()
   }
}

/// Transport owner recording what it is told.
#[derive(Default)]
pub struct FakeOwner {
   refuse_channels: AtomicBool,
   channels: AtomicUsize,
   relinquished: AtomicUsize,
   replies: Mutex<Vec<(CallbackId, Result<ChannelInfo>)>>,
}

impl FakeOwner {
   /// Channels handed over from now on are refused.
   pub fn refuse_channels(&self) {
      self.refuse_channels.store(true, Ordering::SeqCst);
   }

   pub fn channels(&self) -> usize {
      self.channels.load(Ordering::SeqCst)
   }

   pub fn relinquished(&self) -> usize {
      self.relinquished.load(Ordering::SeqCst)
   }

   pub fn replies(&self) -> MutexGuard<'_, Vec<(CallbackId, Result<ChannelInfo>)>> {
      self.replies.lock()
   }
}

impl TransportOwner for FakeOwner {
   fn set_channel(&self, _channel: &AudioChannel) -> io::Result<()> {
      if self.refuse_channels.load(Ordering::SeqCst) {
         return Err(io::ErrorKind::Unsupported.into());
      }
      self.channels.fetch_add(1, Ordering::SeqCst);
      Ok(())
   }

   fn reply(&self, id: CallbackId, result: Result<ChannelInfo>) {
      self.replies.lock().push((id, result));
   }

   fn relinquish(&self) {
      self.relinquished.fetch_add(1, Ordering::SeqCst);
   }
}

/// Event bus keeping every event.
#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<AshaEvent>>,
}

impl RecordingBus {
   pub fn events(&self) -> Vec<AshaEvent> {
      self.events.lock().clone()
   }

   pub fn transport_states(&self) -> Vec<TransportState> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            AshaEvent::TransportStateChanged(state) => Some(*state),
            _ => None,
         })
         .collect()
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, _session: &Session, event: AshaEvent) {
      self.events.lock().push(event);
   }
}

/// Endpoint counting configuration requests.
#[derive(Default)]
pub struct RecordingEndpoint {
   configured: AtomicUsize,
}

impl RecordingEndpoint {
   pub fn configured(&self) -> usize {
      self.configured.load(Ordering::SeqCst)
   }
}

impl AudioEndpoint for RecordingEndpoint {
   fn get_capabilities(&self, _central: &Central) -> Vec<u8> {
      Vec::new()
   }

   fn set_configuration(&self, _session: &Session, _central: &Central) -> Result<()> {
      self.configured.fetch_add(1, Ordering::SeqCst);
      Ok(())
   }
}

pub struct Harness {
   pub session: Session,
   pub client: Arc<FakeClient>,
   pub bus: Arc<RecordingBus>,
   pub centrals: Arc<CentralRegistry>,
}

impl Harness {
   pub fn register_recording_central(&self) -> Arc<RecordingEndpoint> {
      let endpoint = Arc::new(RecordingEndpoint::default());
      self
         .centrals
         .register(self.session.adapter().clone(), endpoint.clone(), None)
         .expect("adapter already has a central");
      endpoint
   }
}

/// A session over `client`, nothing resolved yet.
pub fn harness(client: FakeClient) -> Harness {
   harness_at(ADDRESS, client)
}

pub fn harness_at(address: Address, client: FakeClient) -> Harness {
   let client = Arc::new(client);
   let bus = Arc::new(RecordingBus::default());
   let centrals = Arc::new(CentralRegistry::new());
   let session = Session::new(
      address,
      "hci0".into(),
      "Hearing Aid".into(),
      client.clone(),
      centrals.clone(),
      bus.clone(),
   );
   Harness {
      session,
      client,
      bus,
      centrals,
   }
}

/// A session with a control point and a PSM characteristic holding 75.
///
/// The PSM read is started here and completes asynchronously.
pub fn streaming_harness() -> Harness {
   let chars = vec![
      DiscoveredChar {
         uuid: AUDIO_CONTROL_POINT_UUID,
         handle: CONTROL_POINT,
      },
      DiscoveredChar {
         uuid: PSM_UUID,
         handle: PSM,
      },
   ];
   let client = FakeClient::default();
   client.add_service(SERVICE, chars.clone());
   client.set_value(PSM.characteristic, &[0x4b, 0x00]);

   let h = harness(client);
   assert!(h.session.attach_service(SERVICE));
   resolver::classify(&h.session, &chars);
   h
}
