//! ASHA audio transport state machine.
//!
//! A transport drives one session through `Idle → Requesting → Active →
//! Suspending → Idle`. Resuming opens the audio channel on the session's PSM,
//! hands it to the requesting owner and then asks the device to start
//! rendering. Suspending closes the channel first and tells the device to
//! stop afterwards, best effort.

use std::{
   collections::HashMap,
   fmt, io,
   num::NonZeroU32,
   sync::{
      Arc,
      atomic::{AtomicU32, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::AbortHandle;

use crate::{
   asha::{
      control,
      protocol::{DEFAULT_AUDIO_MTU, StartParams},
      session::{Session, WeakSession},
   },
   bluetooth::l2cap::{AudioChannel, ChannelOpener},
   error::{AshaError, Result},
   event::AshaEvent,
};

/// State of an audio transport.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr,
)]
pub enum TransportState {
   /// Not acquired and not streaming.
   #[strum(serialize = "idle")]
   Idle,
   /// Content queued but not acquired. Not driven by ASHA.
   #[strum(serialize = "pending")]
   Pending,
   /// Acquire in progress.
   #[strum(serialize = "requesting")]
   Requesting,
   /// Channel open and streaming.
   #[strum(serialize = "active")]
   Active,
   /// Release in progress.
   #[strum(serialize = "suspending")]
   Suspending,
}

impl TransportState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Correlation token of an in-flight transport request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CallbackId(NonZeroU32);

impl CallbackId {
   pub const fn get(self) -> u32 {
      self.0.get()
   }
}

impl fmt::Display for CallbackId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// Source of callback ids, shared by every transport it is handed to.
#[derive(Debug)]
pub struct CallbackIds(AtomicU32);

impl Default for CallbackIds {
   fn default() -> Self {
      Self::new()
   }
}

impl CallbackIds {
   pub const fn new() -> Self {
      Self(AtomicU32::new(1))
   }

   pub fn next(&self) -> CallbackId {
      loop {
         if let Some(id) = NonZeroU32::new(self.0.fetch_add(1, Ordering::Relaxed)) {
            return CallbackId(id);
         }
      }
   }
}

/// Negotiated parameters reported to the owner on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
   pub imtu: u16,
   pub omtu: u16,
}

/// The party that acquired a transport.
pub trait TransportOwner: Send + Sync {
   /// Receives the freshly opened channel. An error aborts the resume.
   fn set_channel(&self, channel: &AudioChannel) -> io::Result<()>;

   /// Completes the request identified by `id`.
   fn reply(&self, id: CallbackId, result: Result<ChannelInfo>);

   /// The transport could not be started; give up exclusive use of it.
   fn relinquish(&self);
}

/// Generic audio transport contract.
pub trait AudioTransport: Send + Sync {
   /// Starts streaming. Returns `None` if nothing was scheduled.
   fn resume(&self, owner: Arc<dyn TransportOwner>) -> Option<CallbackId>;

   /// Stops streaming. Completes synchronously.
   fn suspend(&self, owner: Arc<dyn TransportOwner>) -> Option<CallbackId>;

   /// Aborts the in-flight request identified by `id`.
   fn cancel(&self, id: CallbackId);

   /// Releases everything held by the transport.
   fn destroy(&self);

   fn state(&self) -> TransportState;
}

/// Tunables of an ASHA transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
   pub mtu: u16,
   pub control_point_timeout: Duration,
   pub start: StartParams,
}

impl Default for TransportSettings {
   fn default() -> Self {
      Self {
         mtu: DEFAULT_AUDIO_MTU,
         control_point_timeout: Duration::from_secs(5),
         start: StartParams::default(),
      }
   }
}

/// One resume attempt.
struct StreamContext {
   psm: u16,
   channel: Option<Arc<AudioChannel>>,
}

struct InFlight {
   owner: Arc<dyn TransportOwner>,
   abort: Option<AbortHandle>,
   replied: bool,
}

struct TransportCore {
   state: TransportState,
   stream: Option<StreamContext>,
   in_flight: HashMap<CallbackId, InFlight>,
}

struct TransportInner {
   session: WeakSession,
   address: Address,
   opener: Arc<dyn ChannelOpener>,
   ids: Arc<CallbackIds>,
   settings: TransportSettings,
   core: parking_lot::Mutex<TransportCore>,
}

impl TransportInner {
   fn set_state(&self, core: &mut TransportCore, state: TransportState) {
      if core.state == state {
         return;
      }
      debug!("{}: transport {} → {state}", self.address, core.state);
      core.state = state;
      if let Some(session) = self.session.upgrade() {
         session.emit(AshaEvent::TransportStateChanged(state));
      }
   }
}

/// [`AudioTransport`] of an ASHA session.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct AshaTransport(Arc<TransportInner>);

impl fmt::Debug for AshaTransport {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AshaTransport")
         .field("address", &self.0.address)
         .field("state", &self.state())
         .finish_non_exhaustive()
   }
}

impl AshaTransport {
   pub fn new(
      session: &Session,
      opener: Arc<dyn ChannelOpener>,
      ids: Arc<CallbackIds>,
      settings: TransportSettings,
   ) -> Self {
      Self(Arc::new(TransportInner {
         session: session.downgrade(),
         address: session.address(),
         opener,
         ids,
         settings,
         core: parking_lot::Mutex::new(TransportCore {
            state: TransportState::Idle,
            stream: None,
            in_flight: HashMap::new(),
         }),
      }))
   }

   /// Negotiated MTUs of the open channel, if any.
   pub fn channel_info(&self) -> Option<ChannelInfo> {
      let core = self.0.core.lock();
      let channel = core.stream.as_ref()?.channel.as_ref()?;
      if channel.is_closed() {
         return None;
      }
      Some(ChannelInfo {
         imtu: channel.imtu(),
         omtu: channel.omtu(),
      })
   }

   async fn run_resume(self, id: CallbackId, psm: u16) {
      let inner = &self.0;
      let addr = inner.address;

      let channel = match inner.opener.open(addr, psm, inner.settings.mtu).await {
         Ok(channel) => Arc::new(channel),
         Err(e) => {
            warn!("{addr}: resume {id} failed to open the audio channel: {e}");
            self.fail(id, e);
            return;
         },
      };

      let Some(owner) = self.owner_of(id) else {
         debug!("{addr}: resume {id} cancelled while connecting");
         channel.close();
         return;
      };
      if let Err(e) = owner.set_channel(&channel) {
         warn!("{addr}: resume {id} could not hand over the audio channel: {e}");
         channel.close();
         self.fail(id, e.into());
         return;
      }

      {
         let mut core = inner.core.lock();
         let Some(flight) = core.in_flight.get_mut(&id) else {
            debug!("{addr}: resume {id} cancelled during handover");
            channel.close();
            return;
         };
         flight.replied = true;
         if let Some(stream) = core.stream.as_mut() {
            stream.channel = Some(channel.clone());
         }
      }

      owner.reply(
         id,
         Ok(ChannelInfo {
            imtu: channel.imtu(),
            omtu: channel.omtu(),
         }),
      );

      let result = match inner.session.upgrade() {
         Some(session) => {
            control::send_start(
               &session,
               inner.settings.start,
               inner.settings.control_point_timeout,
            )
            .await
         },
         None => Err(AshaError::NotReady),
      };

      let mut core = inner.core.lock();
      if core.in_flight.remove(&id).is_none() {
         return;
      }
      match result {
         Ok(()) => {
            inner.set_state(&mut core, TransportState::Active);
            info!("{addr}: streaming on psm {psm}");
         },
         Err(e) => {
            warn!("{addr}: device did not start streaming: {e}");
            if let Some(channel) = core.stream.take().and_then(|s| s.channel) {
               channel.close();
            }
            inner.set_state(&mut core, TransportState::Idle);
            drop(core);
            owner.relinquish();
         },
      }
   }

   fn owner_of(&self, id: CallbackId) -> Option<Arc<dyn TransportOwner>> {
      let core = self.0.core.lock();
      core.in_flight.get(&id).map(|flight| flight.owner.clone())
   }

   fn fail(&self, id: CallbackId, err: AshaError) {
      let flight = {
         let mut core = self.0.core.lock();
         let Some(flight) = core.in_flight.remove(&id) else {
            return;
         };
         core.stream = None;
         self.0.set_state(&mut core, TransportState::Idle);
         flight
      };
      flight.owner.reply(id, Err(err));
      flight.owner.relinquish();
   }
}

impl AudioTransport for AshaTransport {
   fn resume(&self, owner: Arc<dyn TransportOwner>) -> Option<CallbackId> {
      let inner = &self.0;
      let addr = inner.address;

      let psm = inner.session.upgrade().and_then(|s| s.psm());
      let (Some(psm), false) = (psm, addr == Address::any()) else {
         warn!("{addr}: cannot resume, PSM or address unknown");
         owner.relinquish();
         return None;
      };

      let mut core = inner.core.lock();
      if core.state != TransportState::Idle {
         warn!("{addr}: resume rejected, transport is {}", core.state);
         return None;
      }

      let id = inner.ids.next();
      core.stream = Some(StreamContext { psm, channel: None });
      core.in_flight.insert(
         id,
         InFlight {
            owner,
            abort: None,
            replied: false,
         },
      );
      inner.set_state(&mut core, TransportState::Requesting);

      let task = tokio::spawn(self.clone().run_resume(id, psm));
      if let Some(flight) = core.in_flight.get_mut(&id) {
         flight.abort = Some(task.abort_handle());
      }
      debug!("{addr}: resume {id} scheduled");
      Some(id)
   }

   fn suspend(&self, _owner: Arc<dyn TransportOwner>) -> Option<CallbackId> {
      let inner = &self.0;
      let addr = inner.address;
      {
         let mut core = inner.core.lock();
         if core.state != TransportState::Active {
            debug!("{addr}: suspend ignored, transport is {}", core.state);
            return None;
         }
         inner.set_state(&mut core, TransportState::Suspending);
         if let Some(stream) = core.stream.take() {
            debug!("{addr}: closing audio channel on psm {}", stream.psm);
            if let Some(channel) = stream.channel {
               channel.close();
            }
         }
         inner.set_state(&mut core, TransportState::Idle);
      }

      let session = inner.session.upgrade()?;
      let weak = session.downgrade();
      let timeout = inner.settings.control_point_timeout;
      session.spawn(async move {
         if let Some(session) = weak.upgrade() {
            // The channel is already gone; the device's answer changes nothing.
            let _ = control::send_stop(&session, timeout).await;
         }
      });
      None
   }

   fn cancel(&self, id: CallbackId) {
      let inner = &self.0;
      let flight = {
         let mut core = inner.core.lock();
         let Some(flight) = core.in_flight.remove(&id) else {
            debug!("{}: cancel of unknown request {id}", inner.address);
            return;
         };
         if let Some(abort) = &flight.abort {
            abort.abort();
         }
         if let Some(channel) = core.stream.take().and_then(|s| s.channel) {
            channel.close();
         }
         inner.set_state(&mut core, TransportState::Idle);
         flight
      };
      info!("{}: request {id} cancelled", inner.address);
      if !flight.replied {
         flight.owner.reply(id, Err(AshaError::Cancelled));
      }
   }

   fn destroy(&self) {
      let inner = &self.0;
      let flights: Vec<_> = {
         let mut core = inner.core.lock();
         let flights = core.in_flight.drain().collect();
         if let Some(channel) = core.stream.take().and_then(|s| s.channel) {
            channel.close();
         }
         inner.set_state(&mut core, TransportState::Idle);
         flights
      };
      for (id, flight) in flights {
         if let Some(abort) = &flight.abort {
            abort.abort();
         }
         if !flight.replied {
            flight.owner.reply(id, Err(AshaError::Cancelled));
         }
      }
      debug!("{}: transport destroyed", inner.address);
   }

   fn state(&self) -> TransportState {
      self.0.core.lock().state
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      error::ConnectStep,
      testing::{self, FakeOpener, FakeOwner, Harness, wait_until},
   };

   async fn ready() -> (Harness, Arc<FakeOpener>, AshaTransport) {
      let h = testing::streaming_harness();
      wait_until(|| h.session.psm().is_some()).await;
      let opener = Arc::new(FakeOpener::default());
      let transport = AshaTransport::new(
         &h.session,
         opener.clone(),
         Arc::new(CallbackIds::new()),
         TransportSettings::default(),
      );
      (h, opener, transport)
   }

   async fn active() -> (Harness, Arc<FakeOpener>, AshaTransport, Arc<FakeOwner>) {
      let (h, opener, transport) = ready().await;
      let owner = Arc::new(FakeOwner::default());
      transport.resume(owner.clone()).unwrap();
      wait_until(|| transport.state() == TransportState::Active).await;
      (h, opener, transport, owner)
   }

   #[test]
   fn test_callback_ids_skip_zero() {
      let ids = CallbackIds::new();
      assert_eq!(ids.next().get(), 1);
      assert_eq!(ids.next().get(), 2);

      let ids = CallbackIds(AtomicU32::new(u32::MAX));
      assert_eq!(ids.next().get(), u32::MAX);
      assert_eq!(ids.next().get(), 1);
   }

   #[tokio::test]
   async fn test_resume_without_psm() {
      let h = testing::harness(testing::FakeClient::default());
      let opener = Arc::new(FakeOpener::default());
      let transport = AshaTransport::new(
         &h.session,
         opener.clone(),
         Arc::new(CallbackIds::new()),
         TransportSettings::default(),
      );
      let owner = Arc::new(FakeOwner::default());

      assert_eq!(transport.resume(owner.clone()), None);
      tokio::task::yield_now().await;

      assert_eq!(transport.state(), TransportState::Idle);
      assert!(opener.calls().is_empty());
      assert_eq!(owner.relinquished(), 1);
      assert!(owner.replies().is_empty());
   }

   #[tokio::test]
   async fn test_resume_without_address() {
      let h = testing::harness_at(Address::any(), testing::FakeClient::default());
      h.session.store_psm(75);
      let opener = Arc::new(FakeOpener::default());
      let transport = AshaTransport::new(
         &h.session,
         opener.clone(),
         Arc::new(CallbackIds::new()),
         TransportSettings::default(),
      );
      let owner = Arc::new(FakeOwner::default());

      assert_eq!(transport.resume(owner.clone()), None);
      tokio::task::yield_now().await;

      assert_eq!(transport.state(), TransportState::Idle);
      assert!(opener.calls().is_empty());
      assert_eq!(owner.relinquished(), 1);
      assert!(owner.replies().is_empty());
      assert!(h.bus.transport_states().is_empty());
   }

   #[tokio::test]
   async fn test_suspend_idle_is_noop() {
      let (h, opener, transport) = ready().await;
      let owner = Arc::new(FakeOwner::default());

      assert_eq!(transport.suspend(owner), None);
      tokio::task::yield_now().await;

      assert_eq!(transport.state(), TransportState::Idle);
      assert!(opener.links().is_empty());
      assert!(h.client.writes().is_empty());
   }

   #[tokio::test]
   async fn test_resume_opens_and_starts() {
      let (h, opener, transport) = ready().await;
      assert_eq!(h.session.psm(), Some(75));
      let owner = Arc::new(FakeOwner::default());

      let id = transport.resume(owner.clone()).unwrap();
      assert_eq!(transport.state(), TransportState::Requesting);
      wait_until(|| transport.state() == TransportState::Active).await;

      assert_eq!(opener.calls(), vec![(h.session.address(), 75, DEFAULT_AUDIO_MTU)]);
      let writes = h.client.writes();
      assert_eq!(writes.len(), 1);
      assert_eq!(writes[0].0, testing::CONTROL_POINT);
      assert_eq!(writes[0].1[0], 0x01);

      assert_eq!(owner.channels(), 1);
      let replies = owner.replies();
      assert_eq!(replies.len(), 1);
      assert_eq!(replies[0].0, id);
      assert!(replies[0].1.is_ok());
      assert_eq!(owner.relinquished(), 0);
      assert!(transport.channel_info().is_some());

      assert!(matches!(
         h.bus.transport_states()[..],
         [TransportState::Requesting, TransportState::Active]
      ));
   }

   #[tokio::test]
   async fn test_suspend_closes_then_stops() {
      let (h, opener, transport, owner) = active().await;
      h.client.fail_writes(0x0e);

      assert_eq!(transport.suspend(owner), None);
      assert_eq!(transport.state(), TransportState::Idle);
      assert_eq!(opener.links()[0].shutdowns(), 1);

      wait_until(|| h.client.writes().len() == 2).await;
      assert_eq!(h.client.writes()[1].1, vec![0x02]);
      assert_eq!(opener.links()[0].shutdowns(), 1);
      assert_eq!(transport.state(), TransportState::Idle);
      assert!(transport.channel_info().is_none());
   }

   #[tokio::test]
   async fn test_second_resume_rejected() {
      let (h, opener, transport) = ready().await;
      opener.hold();
      let first = Arc::new(FakeOwner::default());
      let second = Arc::new(FakeOwner::default());

      assert!(transport.resume(first.clone()).is_some());
      assert_eq!(transport.resume(second.clone()), None);
      assert_eq!(transport.state(), TransportState::Requesting);

      opener.release();
      wait_until(|| transport.state() == TransportState::Active).await;
      assert_eq!(transport.resume(second.clone()), None);

      assert_eq!(opener.calls().len(), 1);
      assert_eq!(h.client.writes().len(), 1);
      assert!(second.replies().is_empty());
      assert_eq!(second.relinquished(), 0);
   }

   #[tokio::test]
   async fn test_connect_failure_replies() {
      let (h, opener, transport) = ready().await;
      opener.fail_with(ConnectStep::Connect);
      let owner = Arc::new(FakeOwner::default());

      let id = transport.resume(owner.clone()).unwrap();
      wait_until(|| owner.relinquished() == 1).await;

      let replies = owner.replies();
      assert_eq!(replies.len(), 1);
      assert_eq!(replies[0].0, id);
      assert!(matches!(
         replies[0].1,
         Err(AshaError::Connect {
            step: ConnectStep::Connect,
            ..
         })
      ));
      assert_eq!(transport.state(), TransportState::Idle);
      assert!(h.client.writes().is_empty());
   }

   #[tokio::test]
   async fn test_cancel_while_connecting() {
      let (h, opener, transport) = ready().await;
      opener.hold();
      let owner = Arc::new(FakeOwner::default());

      let id = transport.resume(owner.clone()).unwrap();
      wait_until(|| opener.calls().len() == 1).await;
      transport.cancel(id);

      assert_eq!(transport.state(), TransportState::Idle);
      {
         let replies = owner.replies();
         assert_eq!(replies.len(), 1);
         assert!(matches!(replies[0].1, Err(AshaError::Cancelled)));
      }

      opener.release();
      tokio::task::yield_now().await;
      assert!(h.client.writes().is_empty());
      assert!(opener.links().is_empty());
      assert_eq!(owner.channels(), 0);

      // A cancelled request can be cancelled again without effect.
      transport.cancel(id);
      assert_eq!(owner.replies().len(), 1);
   }

   #[tokio::test]
   async fn test_cancel_while_starting() {
      let (h, opener, transport) = ready().await;
      h.client.hold_writes();
      let owner = Arc::new(FakeOwner::default());

      let id = transport.resume(owner.clone()).unwrap();
      wait_until(|| h.client.writes().len() == 1).await;
      assert_eq!(owner.replies().len(), 1);
      assert_eq!(transport.state(), TransportState::Requesting);

      transport.cancel(id);
      assert_eq!(transport.state(), TransportState::Idle);
      assert_eq!(opener.links()[0].shutdowns(), 1);
      assert!(transport.channel_info().is_none());

      tokio::task::yield_now().await;
      assert_eq!(owner.replies().len(), 1);
      assert!(owner.replies()[0].1.is_ok());
      assert_eq!(owner.relinquished(), 0);
      assert_eq!(opener.links()[0].shutdowns(), 1);
      assert!(matches!(
         h.bus.transport_states()[..],
         [TransportState::Requesting, TransportState::Idle]
      ));
   }

   #[tokio::test]
   async fn test_refused_channel_aborts_resume() {
      let (h, opener, transport) = ready().await;
      let owner = Arc::new(FakeOwner::default());
      owner.refuse_channels();

      let id = transport.resume(owner.clone()).unwrap();
      wait_until(|| owner.relinquished() == 1).await;

      assert_eq!(transport.state(), TransportState::Idle);
      assert_eq!(opener.links()[0].shutdowns(), 1);
      assert!(h.client.writes().is_empty());
      assert_eq!(owner.channels(), 0);
      let replies = owner.replies();
      assert_eq!(replies.len(), 1);
      assert_eq!(replies[0].0, id);
      assert!(matches!(replies[0].1, Err(AshaError::Io(_))));
   }

   #[tokio::test]
   async fn test_start_rejected_releases_channel() {
      let (h, opener, transport) = ready().await;
      h.client.fail_writes(0x81);
      let owner = Arc::new(FakeOwner::default());

      transport.resume(owner.clone()).unwrap();
      wait_until(|| owner.relinquished() == 1).await;

      assert_eq!(transport.state(), TransportState::Idle);
      assert_eq!(opener.links()[0].shutdowns(), 1);
      assert!(owner.replies()[0].1.is_ok());
      assert_eq!(h.client.writes().len(), 1);
   }

   #[tokio::test]
   async fn test_destroy_closes_channel() {
      let (_h, opener, transport, owner) = active().await;
      transport.destroy();
      assert_eq!(transport.state(), TransportState::Idle);
      assert_eq!(opener.links()[0].shutdowns(), 1);
      assert_eq!(owner.replies().len(), 1);

      transport.destroy();
      assert_eq!(opener.links()[0].shutdowns(), 1);
   }

   #[tokio::test]
   async fn test_session_destroy_tears_down_transport() {
      let (h, opener, transport, _owner) = active().await;
      assert!(h.session.set_transport(transport.clone()));
      assert!(!h.session.set_transport(transport.clone()));
      let info = h.session.to_json();
      assert_eq!(info["transport"], "active");
      assert_eq!(info["imtu"], DEFAULT_AUDIO_MTU);

      h.session.destroy();
      assert!(h.session.transport().is_none());
      assert_eq!(transport.state(), TransportState::Idle);
      assert_eq!(opener.links()[0].shutdowns(), 1);
   }
}
