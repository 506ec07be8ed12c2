//! Central registry.
//!
//! A central is the per-adapter endpoint that negotiates capabilities and
//! configuration with ASHA devices. Each adapter has at most one.

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use log::{debug, info};
use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::{
   asha::session::Session,
   error::{AshaError, Result},
};

/// Capability and configuration callbacks of a central.
pub trait AudioEndpoint: Send + Sync {
   /// Returns the capability blob the host offers to devices on this adapter.
   fn get_capabilities(&self, central: &Central) -> Vec<u8>;

   /// Called once a session knows its PSM and can be configured for streaming.
   fn set_configuration(&self, session: &Session, central: &Central) -> Result<()>;
}

type Context = Arc<dyn Any + Send + Sync>;

/// An endpoint bound to one adapter.
pub struct Central {
   adapter: SmolStr,
   endpoint: Arc<dyn AudioEndpoint>,
   context: Option<Context>,
}

impl fmt::Debug for Central {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Central")
         .field("adapter", &self.adapter)
         .finish_non_exhaustive()
   }
}

impl Central {
   pub fn adapter(&self) -> &SmolStr {
      &self.adapter
   }

   /// Returns the owner supplied context if it is a `T`.
   pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
      self.context.clone()?.downcast().ok()
   }

   pub fn capabilities(&self) -> Vec<u8> {
      self.endpoint.get_capabilities(self)
   }

   pub fn configure(&self, session: &Session) -> Result<()> {
      debug!("{}: configuring {}", self.adapter, session.address());
      self.endpoint.set_configuration(session, self)
   }
}

/// Adapter name to central mapping.
#[derive(Default)]
pub struct CentralRegistry {
   centrals: RwLock<HashMap<SmolStr, Arc<Central>>>,
}

impl CentralRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registers the central of an adapter. Fails if one already exists.
   pub fn register(
      &self,
      adapter: impl Into<SmolStr>,
      endpoint: Arc<dyn AudioEndpoint>,
      context: Option<Context>,
   ) -> Result<Arc<Central>> {
      let adapter = adapter.into();
      let mut centrals = self.centrals.write();
      if centrals.contains_key(&adapter) {
         return Err(AshaError::CentralExists(adapter));
      }
      let central = Arc::new(Central {
         adapter: adapter.clone(),
         endpoint,
         context,
      });
      centrals.insert(adapter.clone(), central.clone());
      info!("Registered ASHA central for {adapter}");
      Ok(central)
   }

   pub fn find(&self, adapter: &str) -> Option<Arc<Central>> {
      self.centrals.read().get(adapter).cloned()
   }

   pub fn unregister(&self, adapter: &str) -> Option<Arc<Central>> {
      let central = self.centrals.write().remove(adapter);
      if central.is_some() {
         info!("Unregistered ASHA central for {adapter}");
      }
      central
   }

   pub fn len(&self) -> usize {
      self.centrals.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}
