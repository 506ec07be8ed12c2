//! Bluetooth device manager for ASHA devices.
//!
//! This module handles Bluetooth adapter management, device discovery,
//! and the session lifecycle of connected hearing aids.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, Address};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   asha::{
      central::{AudioEndpoint, CentralRegistry},
      control,
      endpoint::TransportEndpoint,
      protocol::OtherState,
      recognition, resolver,
      session::Session,
      transport::{AudioTransport, CallbackIds, TransportState},
   },
   bluetooth::{
      gatt::BluerClient,
      l2cap::{ChannelOpener, L2capOpener},
   },
   config::Config,
   error::{AshaError, Result},
   event::{AshaEvent, EventSender},
};
use rand::Rng;

/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying adapter operations after failure
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum adapter recovery delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Maximum time BlueZ may take to resolve the GATT database
const SERVICES_RESOLVED_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll period while waiting for resolved services
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(500);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   retry_count: u32,
   name: SmolStr,
}

// === Device Management ===

struct ManagedDevice {
   session: Session,
   adapter_name: SmolStr,
   resolve_handle: Option<JoinHandle<()>>,
}

/// Connected devices whose GATT database had no usable ASHA service.
///
/// Rediscovery skips them until they are seen disconnected or removed.
#[derive(Debug, Default)]
struct Unresolvable(HashSet<Address>);

impl Unresolvable {
   fn insert(&mut self, addr: Address) {
      self.0.insert(addr);
   }

   fn forget(&mut self, addr: Address) {
      if self.0.remove(&addr) {
         debug!("{addr} may be resolved again");
      }
   }

   fn contains(&self, addr: Address) -> bool {
      self.0.contains(&addr)
   }

   /// Whether a device seen during a scan should be picked up.
   fn admit(&mut self, addr: Address, connected: bool) -> bool {
      if !connected {
         self.forget(addr);
         return false;
      }
      !self.contains(addr)
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String), // adapter_name, error

   // Device events
   DeviceDiscovered(Address, SmolStr), // address, adapter_name
   DeviceDisconnected(Address),
   DeviceLost(Address),
   ResolveFailed(Address, String),

   // User commands
   GetDevice(Address, oneshot::Sender<Option<Session>>),
   GetAllDevices(oneshot::Sender<Vec<Session>>),
}

// === Main Manager ===

/// Main Bluetooth manager that tracks ASHA devices.
///
/// This type provides a high-level interface to the sessions of hearing aids
/// connected on any available Bluetooth adapter.
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub async fn new(event_tx: EventSender, config: Config) -> Result<Self> {
      let session = bluer::Session::new().await?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(session, config, event_tx, command_rx).run());
      Ok(Self { inbox: command_tx })
   }

   pub async fn get_device(&self, address: Address) -> Result<Session> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetDevice(address, tx))
         .await
         .map_err(|_| AshaError::ManagerShutdown)?;

      rx.await
         .map_err(|_| AshaError::ManagerShutdown)?
         .ok_or(AshaError::DeviceNotFound(address))
   }

   pub async fn all_devices(&self) -> Vec<Session> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetAllDevices(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   session: bluer::Session,
   centrals: Arc<CentralRegistry>,
   endpoint: Arc<dyn AudioEndpoint>,

   // State
   adapters: HashMap<SmolStr, AdapterInfo>,
   devices: HashMap<Address, ManagedDevice>,
   unresolvable: Unresolvable,
}

impl ManagerActor {
   fn new(
      session: bluer::Session,
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let endpoint = Arc::new(TransportEndpoint::new(
         Arc::new(L2capOpener::new(config.connect_timeout())),
         Arc::new(CallbackIds::new()),
         config.transport_settings(),
      ));

      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         config,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         session,
         centrals: Arc::new(CentralRegistry::new()),
         endpoint,
         adapters: HashMap::new(),
         devices: HashMap::new(),
         unresolvable: Unresolvable::default(),
      }
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      self.initialize_adapters().await;

      let mut health_check_interval = time::interval(self.config.health_check_interval());
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = health_check_interval.tick() => {
                 self.check_connection_health().await;
                 self.scan_for_connected_devices().await;
             }
             _ = adapter_check_interval.tick() => {
                 self.discover_new_adapters().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      match self.session.adapter(&name) {
         Ok(adapter) => {
            info!("Initializing adapter: {name}");

            if let Ok(powered) = adapter.is_powered().await
               && !powered
            {
               if let Err(e) = adapter.set_powered(true).await {
                  warn!("Failed to power on adapter {name}: {e}");
                  let loopback = self.loopback_tx.clone();
                  let name_clone = name.clone();
                  let adapter_clone = adapter.clone();
                  tokio::spawn(async move {
                     time::sleep(ADAPTER_RECOVERY_DELAY).await;
                     let _ = loopback
                        .send(ManagerCommand::AdapterAvailable(name_clone, adapter_clone))
                        .await;
                  });
                  return;
               }
               info!("Powered on adapter: {name}");
            }

            self.register_central(&name, &adapter).await;
            self.adapters.insert(
               name.clone(),
               AdapterInfo {
                  state: AdapterState::Active,
                  monitor_handle: Some(Self::start_adapter_monitor(
                     self.loopback_tx.clone(),
                     name.clone(),
                     adapter.clone(),
                  )),
                  adapter,
                  retry_count: 0,
                  name: name.clone(),
               },
            );
            self.check_connected_devices(&name).await;
         },
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
         },
      }
   }

   async fn register_central(&self, name: &SmolStr, adapter: &Adapter) {
      if self.centrals.find(name).is_some() {
         return;
      }
      let local = adapter.address().await.unwrap_or_else(|e| {
         warn!("Failed to read address of {name}: {e}");
         Address::any()
      });
      let opener: Arc<dyn ChannelOpener> =
         Arc::new(L2capOpener::new(self.config.connect_timeout()).bound_to(local));
      if let Err(e) = self
         .centrals
         .register(name.clone(), self.endpoint.clone(), Some(Arc::new(opener)))
      {
         warn!("Failed to register central for {name}: {e}");
      }
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            if let Err(e) = loopback
               .send(ManagerCommand::AdapterError(
                  name.clone(),
                  "Failed to get adapter events".to_string(),
               ))
               .await
            {
               warn!("Channel overflow sending adapter error: {e}");
            }
            return;
         };

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(addr) => {
                  debug!("Device added on {name}: {addr}");
                  let _ = loopback
                     .send(ManagerCommand::DeviceDiscovered(addr, name.clone()))
                     .await;
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed on {name}: {addr}");
                  let _ = loopback.send(ManagerCommand::DeviceLost(addr)).await;
               },
               // Connection changes are picked up by the health check
               _ => {},
            }
         }

         if let Err(e) = loopback.send(ManagerCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   async fn check_connected_devices(&self, adapter_name: &SmolStr) {
      let Some(adapter_info) = self.adapters.get(adapter_name) else {
         return;
      };

      let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
         return;
      };

      for addr in addresses {
         if !self.devices.contains_key(&addr)
            && let Ok(device) = adapter_info.adapter.device(addr)
            && device.is_connected().await == Ok(true)
            && self.is_asha_device(&device).await
         {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDiscovered(addr, adapter_name.clone()))
               .await;
         }
      }
   }

   async fn is_asha_device(&self, device: &bluer::Device) -> bool {
      if self.config.is_ignored(&device.address().to_string()) {
         return false;
      }
      recognition::is_device_asha(device).await
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         ManagerCommand::AdapterError(name, error) => {
            self.handle_adapter_error(&name, error);
         },
         ManagerCommand::DeviceDiscovered(addr, adapter_name) => {
            self.handle_device_discovered(addr, adapter_name).await;
         },
         ManagerCommand::DeviceDisconnected(addr) => {
            info!("ASHA device {addr} disconnected");
            self.remove_device(addr);
         },
         ManagerCommand::DeviceLost(addr) => {
            self.unresolvable.forget(addr);
            self.remove_device(addr);
         },
         ManagerCommand::ResolveFailed(addr, error) => {
            warn!("Dropping {addr} until it reconnects: ASHA resolution failed: {error}");
            self.unresolvable.insert(addr);
            self.remove_device(addr);
         },
         ManagerCommand::GetDevice(addr, reply) => {
            let session = self.devices.get(&addr).map(|d| d.session.clone());
            let _ = reply.send(session);
         },
         ManagerCommand::GetAllDevices(reply) => {
            let sessions = self.devices.values().map(|d| d.session.clone()).collect();
            let _ = reply.send(sessions);
         },
      }
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.adapter = adapter.clone();
         info.state = AdapterState::Active;
         info.retry_count = 0;

         if info.monitor_handle.is_none() {
            info.monitor_handle = Some(Self::start_adapter_monitor(
               self.loopback_tx.clone(),
               name.clone(),
               adapter.clone(),
            ));
         }
         self.register_central(&name, &adapter).await;

         self.check_connected_devices(&name).await;
      } else {
         self.initialize_adapter(name).await;
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      info.state = AdapterState::Lost;
      info.retry_count += 1;

      if let Some(handle) = info.monitor_handle.take() {
         handle.abort();
      }

      // Schedule adapter recovery with exponential backoff
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      let delay = calc_retry_delay(info.retry_count);

      self.centrals.unregister(&name);
      let lost: Vec<Address> = self
         .devices
         .iter()
         .filter(|(_, d)| d.adapter_name == name)
         .map(|(addr, _)| *addr)
         .collect();
      for addr in lost {
         self.remove_device(addr);
      }

      tokio::spawn(async move {
         time::sleep(delay).await;

         match session.adapter(&name) {
            Ok(adapter) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterAvailable(name, adapter))
                  .await;
            },
            Err(e) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterError(
                     name,
                     format!("Recovery failed: {e}"),
                  ))
                  .await;
            },
         }
      });
   }

   fn handle_adapter_error(&mut self, name: &SmolStr, error: String) {
      error!("Adapter error on {name}: {error}");

      if let Some(info) = self.adapters.get_mut(name) {
         info.state = AdapterState::Failed(error);
      }
   }

   async fn handle_device_discovered(&mut self, addr: Address, adapter_name: SmolStr) {
      if self.devices.contains_key(&addr) || self.unresolvable.contains(addr) {
         return;
      }

      let Some(adapter_info) = self.adapters.get(&adapter_name) else {
         return;
      };

      let Ok(device) = adapter_info.adapter.device(addr) else {
         return;
      };

      if !self.is_asha_device(&device).await {
         return;
      }

      // Only proceed if already connected by bluetoothd
      if !device.is_connected().await.unwrap_or(false) {
         debug!("Discovered ASHA device at {addr} but not connected by system");
         return;
      }

      let name = device
         .alias()
         .await
         .ok()
         .or(device.name().await.ok().flatten())
         .unwrap_or_else(|| addr.to_string());
      info!("Found connected ASHA device: {name} ({addr})");

      let session = Session::new(
         addr,
         adapter_name.clone(),
         name.into(),
         Arc::new(BluerClient::new(device.clone())),
         self.centrals.clone(),
         self.event_tx.clone(),
      );
      session.emit(AshaEvent::DeviceConnected);

      let resolve_handle = tokio::spawn(resolve_when_ready(
         device,
         session.clone(),
         self.loopback_tx.clone(),
      ));

      self.devices.insert(
         addr,
         ManagedDevice {
            session,
            adapter_name,
            resolve_handle: Some(resolve_handle),
         },
      );
   }

   fn remove_device(&mut self, addr: Address) {
      let Some(mut device) = self.devices.remove(&addr) else {
         return;
      };
      if let Some(handle) = device.resolve_handle.take() {
         handle.abort();
      }
      device.session.destroy();
      device.session.emit(AshaEvent::DeviceDisconnected);
      self.notify_peers(&device.session, OtherState::Disconnected);
   }

   /// Tells streaming members of the same binaural set about `session`.
   fn notify_peers(&self, session: &Session, other: OtherState) {
      let Some(sync_id) = session.hi_sync_id() else {
         return;
      };
      let timeout = self.config.transport_settings().control_point_timeout;
      for peer in self.devices.values().map(|d| &d.session) {
         let streaming = peer
            .transport()
            .is_some_and(|t| t.state() == TransportState::Active);
         if !streaming
            || peer.address() == session.address()
            || peer.hi_sync_id() != Some(sync_id)
         {
            continue;
         }
         debug!("{}: other side is now {other:?}", peer.address());
         let weak = peer.downgrade();
         peer.spawn(async move {
            if let Some(peer) = weak.upgrade() {
               let _ = control::send_status(&peer, other, timeout).await;
            }
         });
      }
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up Bluetooth manager");

      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
      }

      let addrs: Vec<Address> = self.devices.keys().copied().collect();
      for addr in addrs {
         self.remove_device(addr);
      }
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Lost | AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   async fn scan_for_connected_devices(&mut self) {
      for adapter_info in self.adapters.values() {
         if adapter_info.state != AdapterState::Active {
            continue;
         }

         let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
            continue;
         };
         for addr in addresses {
            if self.devices.contains_key(&addr) {
               continue;
            }
            let Ok(device) = adapter_info.adapter.device(addr) else {
               continue;
            };
            let connected = device.is_connected().await.unwrap_or(false);
            if self.unresolvable.admit(addr, connected) && self.is_asha_device(&device).await {
               let _ = self
                  .loopback_tx
                  .send(ManagerCommand::DeviceDiscovered(
                     addr,
                     adapter_info.name.clone(),
                  ))
                  .await;
            }
         }
      }
   }

   async fn check_connection_health(&self) {
      for (addr, device) in &self.devices {
         let bluez_device = self
            .adapters
            .get(&device.adapter_name)
            .and_then(|info| info.adapter.device(*addr).ok());
         let connected = match &bluez_device {
            Some(dev) => dev.is_connected().await.unwrap_or(false),
            None => false,
         };
         if !connected {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDisconnected(*addr))
               .await;
            continue;
         }

         // Users may rename a device while it stays connected.
         if let Some(dev) = bluez_device
            && let Ok(alias) = dev.alias().await
            && device.session.name() != alias
         {
            debug!("{addr}: alias changed to {alias}");
            device.session.set_name(alias.into());
         }
      }
   }
}

/// Waits for BlueZ to finish GATT discovery, then resolves the ASHA service.
async fn resolve_when_ready(
   device: bluer::Device,
   session: Session,
   loopback: mpsc::Sender<ManagerCommand>,
) {
   let addr = session.address();
   let resolved = time::timeout(SERVICES_RESOLVED_TIMEOUT, async {
      while !device.is_services_resolved().await.unwrap_or(false) {
         time::sleep(SERVICES_RESOLVED_POLL).await;
      }
   })
   .await;

   let result = match resolved {
      Ok(()) => resolver::resolve(&session).await,
      Err(_) => Err(AshaError::RequestTimeout),
   };
   if let Err(e) = result {
      let _ = loopback
         .send(ManagerCommand::ResolveFailed(addr, e.to_string()))
         .await;
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
