//! A stand-in modem for exercising a shared-memory link end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use modemlink_transport::{
    Command, LinkTransport, Notifier, Role, SharedMemory, ShmemTransport, TransportError,
    Work,
};
use tracing::{debug, trace};

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};

/// CP side of a shared-memory region that answers the bring-up handshake
/// and echoes every inbound message back on the channel it came in on.
pub struct EchoPeer {
    transport: ShmemTransport,
    notifier: Notifier,
    work: Receiver<Work>,
    echoed: AtomicU64,
}

impl EchoPeer {
    pub fn new(mem: Arc<dyn SharedMemory>, config: &LinkConfig) -> Result<Self> {
        let transport = ShmemTransport::new(
            mem,
            Role::Cp,
            config.shmem.clone(),
            config.frame.clone(),
        )?
        .with_kind(config.transport);
        let (notifier, work) = Notifier::channel(config.work_queue_depth);
        transport.attach(notifier.clone());
        Ok(Self {
            transport,
            notifier,
            work,
            echoed: AtomicU64::new(0),
        })
    }

    pub fn transport(&self) -> &ShmemTransport {
        &self.transport
    }

    /// Handle whatever the AP has raised since the last call.
    ///
    /// Returns the number of messages echoed.
    pub fn pump(&self) -> Result<usize> {
        self.transport.poll_mailbox()?;
        let mut echoed = 0;
        while let Ok(work) = self.work.try_recv() {
            match work {
                Work::Command(Command::InitStart) => {
                    self.transport.activate();
                    self.transport.send_command(Command::InitEnd)?;
                    debug!("echo peer answered handshake");
                }
                Work::Command(command) => trace!(%command, "echo peer ignoring command"),
                Work::Drain(queue) => {
                    self.notifier.begin_drain(queue);
                    let mut inbound = Vec::new();
                    match self.transport.drain(queue, &mut |frame| inbound.push(frame)) {
                        Ok(_) => {}
                        Err(TransportError::LinkInactive) => {
                            trace!(queue, "echo peer not joined yet");
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    }
                    for frame in inbound {
                        self.transport
                            .send_wait(frame.channel, &frame.payload)
                            .map_err(|err| LinkError::from_transport(frame.channel, err))?;
                        echoed += 1;
                    }
                }
                Work::Shutdown => break,
            }
        }
        self.echoed.fetch_add(echoed as u64, Ordering::Relaxed);
        Ok(echoed)
    }

    /// Report a modem crash to the AP.
    pub fn crash(&self) -> Result<()> {
        self.transport.send_command(Command::CrashExit)?;
        Ok(())
    }

    /// Announce a modem restart.
    pub fn restart(&self) -> Result<()> {
        self.transport.send_command(Command::PhoneStart)?;
        Ok(())
    }

    /// Messages echoed since creation.
    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EchoPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoPeer")
            .field("active", &self.transport.is_active())
            .field("echoed", &self.echoed())
            .finish()
    }
}
