use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};

use modemlink_frame::Frame;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::mailbox::Command;
use crate::stats::StatsSnapshot;

/// Which physical transport backs a link device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// SIPC5 shared memory.
    #[default]
    Shmem,
    /// Legacy dual-port RAM; same protocol, smaller queues.
    Dpram,
    /// MIPI-HSI serial link.
    Hsi,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Shmem => "shmem",
            TransportKind::Dpram => "dpram",
            TransportKind::Hsi => "hsi",
        })
    }
}

/// Deferred work produced by the interrupt path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Copy out and dispatch everything queued on a transport queue.
    Drain(usize),
    /// A command arrived from the peer.
    Command(Command),
    /// Stop the worker.
    Shutdown,
}

/// Upper bound on queue indices a transport may schedule.
pub const MAX_QUEUES: usize = 8;

/// Interrupt-side handle onto the work queue.
///
/// Drain requests are coalesced per queue: while one is pending, further
/// requests for the same queue are absorbed. A crash command that meets a
/// full queue is latched until the worker takes it.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: SyncSender<Work>,
    scheduled: Arc<[AtomicBool; MAX_QUEUES]>,
    latched_crash: Arc<Mutex<Option<Command>>>,
}

impl Notifier {
    /// Create a notifier and the receiving end of a bounded work queue.
    pub fn channel(depth: usize) -> (Self, Receiver<Work>) {
        let (tx, rx) = mpsc::sync_channel(depth.max(MAX_QUEUES + 1));
        let notifier = Self {
            tx,
            scheduled: Arc::new(std::array::from_fn(|_| AtomicBool::new(false))),
            latched_crash: Arc::new(Mutex::new(None)),
        };
        (notifier, rx)
    }

    /// Ask the worker to drain `queue`.
    pub fn schedule_drain(&self, queue: usize) {
        let Some(flag) = self.scheduled.get(queue) else {
            warn!(queue, "drain requested for unknown queue");
            return;
        };
        if flag.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.tx.try_send(Work::Drain(queue)) {
            flag.store(false, Ordering::Release);
            warn!(queue, error = %err, "work queue rejected drain");
        }
    }

    /// Forward a peer command to the worker.
    pub fn command(&self, command: Command) {
        match self.tx.try_send(Work::Command(command)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) if command.is_crash() => {
                warn!(%command, "work queue full, crash latched");
                *self
                    .latched_crash
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(command);
            }
            Err(TrySendError::Full(_)) => warn!(%command, "work queue full, command dropped"),
            Err(TrySendError::Disconnected(_)) => debug!(%command, "worker gone"),
        }
    }

    /// Crash command that could not be queued, if any.
    pub fn take_crash(&self) -> Option<Command> {
        self.latched_crash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Called by the worker right before it drains `queue`.
    pub fn begin_drain(&self, queue: usize) {
        if let Some(flag) = self.scheduled.get(queue) {
            flag.store(false, Ordering::Release);
        }
    }

    /// Ask the worker to stop.
    pub fn shutdown(&self) -> bool {
        self.tx.send(Work::Shutdown).is_ok()
    }
}

/// Capability set every physical link provides to the link device.
pub trait LinkTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Route interrupt-side work to `notifier`.
    fn attach(&self, notifier: Notifier);

    /// Bring the link to a clean, usable state.
    fn reset(&self) -> Result<()>;

    /// Take the link down and release every blocked waiter.
    fn terminate(&self);

    fn is_active(&self) -> bool;

    /// Whether bring-up needs the INIT_START / INIT_END command exchange.
    fn needs_handshake(&self) -> bool;

    /// Frame and send one message, waiting a bounded time for room.
    fn transmit(&self, channel: u8, payload: &[u8]) -> Result<usize>;

    fn send_command(&self, command: Command) -> Result<()>;

    /// Deliver everything queued on `queue` to `sink`. Returns the number
    /// of messages delivered; zero is not an error.
    fn drain(&self, queue: usize, sink: &mut dyn FnMut(Frame)) -> Result<usize>;

    /// Queues with data waiting to be drained.
    fn pending_queues(&self) -> Vec<usize>;

    /// Check for an interrupt in polled deployments. Returns whether one
    /// was handled.
    fn poll(&self) -> Result<bool> {
        Ok(false)
    }

    fn stats(&self) -> StatsSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_are_coalesced_until_begun() {
        let (notifier, rx) = Notifier::channel(4);
        notifier.schedule_drain(1);
        notifier.schedule_drain(1);
        notifier.schedule_drain(0);
        assert_eq!(rx.try_recv().unwrap(), Work::Drain(1));
        assert_eq!(rx.try_recv().unwrap(), Work::Drain(0));
        assert!(rx.try_recv().is_err());

        notifier.begin_drain(1);
        notifier.schedule_drain(1);
        assert_eq!(rx.try_recv().unwrap(), Work::Drain(1));
    }

    #[test]
    fn unknown_queue_ignored() {
        let (notifier, rx) = Notifier::channel(4);
        notifier.schedule_drain(MAX_QUEUES);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn commands_and_shutdown_delivered_in_order() {
        let (notifier, rx) = Notifier::channel(4);
        notifier.command(Command::InitEnd);
        assert!(notifier.shutdown());
        assert_eq!(rx.recv().unwrap(), Work::Command(Command::InitEnd));
        assert_eq!(rx.recv().unwrap(), Work::Shutdown);
    }

    #[test]
    fn crash_on_full_queue_is_latched() {
        let (notifier, rx) = Notifier::channel(1);
        for _ in 0..=MAX_QUEUES {
            notifier.command(Command::ReqActive);
        }
        notifier.command(Command::InitEnd);
        assert_eq!(notifier.take_crash(), None);

        notifier.command(Command::CrashReset);
        assert_eq!(rx.try_iter().count(), MAX_QUEUES + 1);
        assert_eq!(notifier.take_crash(), Some(Command::CrashReset));
        assert_eq!(notifier.take_crash(), None);
    }

    #[test]
    fn transport_kind_serializes_lowercase() {
        let json = serde_json::to_string(&TransportKind::Hsi).unwrap();
        assert_eq!(json, "\"hsi\"");
        let kind: TransportKind = serde_json::from_str("\"dpram\"").unwrap();
        assert_eq!(kind, TransportKind::Dpram);
    }
}
