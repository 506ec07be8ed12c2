//! ASHA D-Bus Service
//!
//! This service drives ASHA (Audio Streaming for Hearing Aids) devices
//! connected through BlueZ and exposes their audio channel to local audio
//! servers over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::BluetoothManager;
use dbus::AshaService;
use event::{AshaEvent, EventBus};

mod asha;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
#[cfg(test)]
mod testing;

use crate::{asha::session::Session, dbus::AshaServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/ashad/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting ASHA D-Bus service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration: audio MTU {}, {} ignored devices",
      config.audio_mtu,
      config.ignored_devices.len()
   );

   let event_bus = EventProcessor::new();

   let bluetooth_manager = BluetoothManager::new(event_bus.clone(), config).await?;

   let service = AshaService::new(bluetooth_manager);

   let connection = connection::Builder::session()?
      .name("org.ashad")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("ASHA D-Bus service started at org.ashad");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down ASHA service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Session, AshaEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Session, AshaEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<AshaService>,
      (session, event): (Session, AshaEvent),
   ) -> Result<()> {
      let addr_str = session.address_str();
      match event {
         AshaEvent::DeviceConnected => {
            iface.device_connected(addr_str).await?;
         },
         AshaEvent::DeviceDisconnected => {
            iface.device_disconnected(addr_str).await?;
         },
         AshaEvent::PropertiesUpdated(properties) => {
            iface
               .properties_updated(addr_str, &properties.to_json().to_string())
               .await?;
         },
         AshaEvent::PsmResolved(psm) => {
            debug!("{addr_str}: PSM {psm} ready");
         },
         AshaEvent::TransportStateChanged(state) => {
            iface
               .transport_state_changed(addr_str, state.to_str())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, AshaService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, session: &Session, event: AshaEvent) {
      self.queue.push((session.clone(), event));
      self.notifier.notify_waiters();
   }
}
