//! Audio endpoint that gives every configured session an ASHA transport.

use std::sync::Arc;

use log::debug;

use crate::{
   asha::{
      central::{AudioEndpoint, Central},
      properties::Codecs,
      session::Session,
      transport::{AshaTransport, CallbackIds, TransportSettings},
   },
   bluetooth::l2cap::ChannelOpener,
   error::Result,
};

pub struct TransportEndpoint {
   opener: Arc<dyn ChannelOpener>,
   ids: Arc<CallbackIds>,
   settings: TransportSettings,
}

impl TransportEndpoint {
   pub fn new(
      opener: Arc<dyn ChannelOpener>,
      ids: Arc<CallbackIds>,
      settings: TransportSettings,
   ) -> Self {
      Self {
         opener,
         ids,
         settings,
      }
   }
}

impl AudioEndpoint for TransportEndpoint {
   fn get_capabilities(&self, _central: &Central) -> Vec<u8> {
      Codecs::G722_16KHZ.bits().to_le_bytes().to_vec()
   }

   fn set_configuration(&self, session: &Session, central: &Central) -> Result<()> {
      // Adapters may carry an opener bound to their own address.
      let opener = central
         .context::<Arc<dyn ChannelOpener>>()
         .map_or_else(|| self.opener.clone(), |opener| opener.as_ref().clone());
      let transport = AshaTransport::new(
         session,
         opener,
         self.ids.clone(),
         self.settings,
      );
      if session.set_transport(transport) {
         debug!("{}: transport created on {}", session.address(), central.adapter());
      } else {
         debug!("{}: transport already exists", session.address());
      }
      Ok(())
   }
}
