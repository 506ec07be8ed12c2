//! L2CAP audio channel establishment.
//!
//! The audio data of an ASHA stream flows over an LE connection-oriented
//! channel whose PSM is published by the device. This module opens that
//! channel and wraps the resulting socket in an [`AudioChannel`].

use std::{
   fmt, io,
   net::Shutdown,
   os::fd::{AsRawFd, BorrowedFd, OwnedFd},
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::time;

use crate::error::{AshaError, ConnectStep, Result};

/// Underlying transport of an open audio channel.
pub trait ChannelLink: Send + Sync + fmt::Debug {
   /// Duplicates the channel descriptor so it can be handed to another owner.
   fn try_clone_fd(&self) -> io::Result<OwnedFd>;

   /// Shuts the channel down in both directions.
   fn shutdown(&self) -> io::Result<()>;
}

/// An open audio data channel and its negotiated MTUs.
#[derive(Debug)]
pub struct AudioChannel {
   link: Arc<dyn ChannelLink>,
   imtu: u16,
   omtu: u16,
   closed: AtomicBool,
}

impl AudioChannel {
   pub fn new(link: Arc<dyn ChannelLink>, imtu: u16, omtu: u16) -> Self {
      Self {
         link,
         imtu,
         omtu,
         closed: AtomicBool::new(false),
      }
   }

   pub const fn imtu(&self) -> u16 {
      self.imtu
   }

   pub const fn omtu(&self) -> u16 {
      self.omtu
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
      self.link.try_clone_fd()
   }

   /// Closes the channel. Only the first call reaches the link.
   pub fn close(&self) {
      if self.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      if let Err(e) = self.link.shutdown() {
         warn!("Failed to shut down audio channel: {e}");
      }
   }
}

impl Drop for AudioChannel {
   fn drop(&mut self) {
      self.close();
   }
}

/// Opens audio data channels.
pub trait ChannelOpener: Send + Sync {
   fn open(&self, address: Address, psm: u16, mtu: u16) -> BoxFuture<'_, Result<AudioChannel>>;
}

#[derive(Debug)]
struct SeqPacketLink(SeqPacket);

impl ChannelLink for SeqPacketLink {
   fn try_clone_fd(&self) -> io::Result<OwnedFd> {
      // SAFETY: the descriptor belongs to the socket, which outlives this borrow.
      let fd = unsafe { BorrowedFd::borrow_raw(self.0.as_raw_fd()) };
      fd.try_clone_to_owned()
   }

   fn shutdown(&self) -> io::Result<()> {
      self.0.shutdown(Shutdown::Both)
   }
}

/// [`ChannelOpener`] using a kernel LE CoC socket.
#[derive(Debug, Clone)]
pub struct L2capOpener {
   local: Address,
   connect_timeout: Duration,
}

impl L2capOpener {
   pub const fn new(connect_timeout: Duration) -> Self {
      Self {
         local: Address::any(),
         connect_timeout,
      }
   }

   /// Binds channels to the adapter with the given address.
   pub const fn bound_to(self, local: Address) -> Self {
      Self { local, ..self }
   }

   async fn connect(&self, address: Address, psm: u16, mtu: u16) -> Result<AudioChannel> {
      let step = |step: ConnectStep| move |source: io::Error| AshaError::Connect { step, source };

      debug!("Creating L2CAP socket for {address}");
      let socket = Socket::<SeqPacket>::new_seq_packet().map_err(step(ConnectStep::Create))?;

      // The kernel only picks the LE public address type for the link when the
      // local side is bound explicitly before connecting.
      socket
         .bind(SocketAddr::new(self.local, AddressType::LePublic, 0))
         .map_err(step(ConnectStep::Bind))?;
      socket
         .set_recv_mtu(mtu)
         .map_err(step(ConnectStep::SetMtu))?;

      let addr = SocketAddr::new(address, AddressType::LePublic, psm);
      debug!("Connecting to {address}:{psm}");
      let conn = time::timeout(self.connect_timeout, socket.connect(addr))
         .await
         .map_err(|_| AshaError::RequestTimeout)?
         .map_err(step(ConnectStep::Connect))?;

      let imtu = conn.recv_mtu().ok().and_then(|m| u16::try_from(m).ok()).unwrap_or(mtu);
      let omtu = conn.send_mtu().ok().and_then(|m| u16::try_from(m).ok()).unwrap_or(mtu);
      info!("Audio channel to {address}:{psm} open (imtu={imtu}, omtu={omtu})");
      Ok(AudioChannel::new(Arc::new(SeqPacketLink(conn)), imtu, omtu))
   }
}

impl ChannelOpener for L2capOpener {
   fn open(&self, address: Address, psm: u16, mtu: u16) -> BoxFuture<'_, Result<AudioChannel>> {
      self.connect(address, psm, mtu).boxed()
   }
}
