//! Audio control point protocol.
//!
//! Start and stop commands are written to the audio control point with a
//! write request; the device acknowledges the write once it accepted the
//! command. Writes are not retried.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time;

use crate::{
   asha::{
      protocol::{CharRole, ControlPointCommand, OtherState, StartParams},
      session::Session,
   },
   error::{AshaError, Result},
};

/// Asks the device to start rendering audio from the data channel.
pub async fn send_start(session: &Session, params: StartParams, timeout: Duration) -> Result<()> {
   if let Some(props) = session.properties()
      && !props.supports_g722()
   {
      warn!(
         "{}: device does not advertise G.722, starting anyway",
         session.address()
      );
   }
   send(session, ControlPointCommand::Start(params), timeout).await
}

/// Asks the device to stop rendering audio.
pub async fn send_stop(session: &Session, timeout: Duration) -> Result<()> {
   send(session, ControlPointCommand::Stop, timeout).await
}

/// Informs a streaming device that the other side of its set (dis)connected.
pub async fn send_status(session: &Session, other: OtherState, timeout: Duration) -> Result<()> {
   send(session, ControlPointCommand::Status(other), timeout).await
}

async fn send(session: &Session, cmd: ControlPointCommand, timeout: Duration) -> Result<()> {
   let addr = session.address();
   let handle = session
      .handle(CharRole::AudioControlPoint)
      .ok_or(AshaError::NotResolved("audio control point"))?;

   let packet = cmd.build();
   debug!("{addr}: control point {} → {}", cmd.opcode(), hex::encode(&packet));

   match time::timeout(timeout, session.client().write(handle, &packet)).await {
      Ok(Ok(())) => {
         info!("{addr}: control point {} acknowledged", cmd.opcode());
         Ok(())
      },
      Ok(Err(e)) => {
         match e.att_code() {
            Some(code) => warn!(
               "{addr}: control point {} rejected with ATT error 0x{code:02x}",
               cmd.opcode()
            ),
            None => warn!("{addr}: control point {} failed: {e}", cmd.opcode()),
         }
         Err(e)
      },
      Err(_) => {
         warn!("{addr}: control point {} timed out", cmd.opcode());
         Err(AshaError::RequestTimeout)
      },
   }
}
