//! The link device: one active transport, a channel registry and the
//! communication state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use modemlink_frame::{channel_name, Frame};
use modemlink_transport::{
    Command, HsiLink, HsiPort, LinkTransport, Notifier, Role, SharedMemory, ShmemTransport,
    StatsSnapshot, TransportError, TransportKind, Work,
};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::state::CommState;

type ChannelHandler = Box<dyn FnMut(&[u8]) + Send>;
type StateListener = Box<dyn FnMut(CommState) + Send>;
type CommandListener = Box<dyn FnMut(Command) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters for a link device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub state: CommState,
    pub transport: TransportKind,
    #[serde(flatten)]
    pub link: StatsSnapshot,
    /// Inbound messages with no registered handler, or refused by state.
    pub undelivered: u64,
}

struct Inner {
    transport: Arc<dyn LinkTransport>,
    config: LinkConfig,
    state: Mutex<CommState>,
    handlers: Mutex<HashMap<u8, ChannelHandler>>,
    state_listeners: Mutex<Vec<StateListener>>,
    command_listeners: Mutex<Vec<CommandListener>>,
    notifier: Notifier,
    work: Mutex<Receiver<Work>>,
    undelivered: AtomicU64,
}

/// Consumer-facing handle onto the modem link.
///
/// Cheap to clone; every clone drives the same device.
#[derive(Clone)]
pub struct LinkDevice {
    inner: Arc<Inner>,
}

impl LinkDevice {
    /// Wrap an already constructed transport.
    pub fn new(transport: Arc<dyn LinkTransport>, config: LinkConfig) -> Self {
        let (notifier, work) = Notifier::channel(config.work_queue_depth);
        transport.attach(notifier.clone());
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state: Mutex::new(CommState::None),
                handlers: Mutex::new(HashMap::new()),
                state_listeners: Mutex::new(Vec::new()),
                command_listeners: Mutex::new(Vec::new()),
                notifier,
                work: Mutex::new(work),
                undelivered: AtomicU64::new(0),
            }),
        }
    }

    /// AP side of a shared-memory (or DPRAM) window.
    pub fn shmem(mem: Arc<dyn SharedMemory>, config: LinkConfig) -> Result<Self> {
        if config.transport == TransportKind::Hsi {
            return Err(LinkError::Transport(TransportError::Unsupported(
                "hsi config for a shared-memory device",
            )));
        }
        let transport = ShmemTransport::new(
            mem,
            Role::Ap,
            config.shmem.clone(),
            config.frame.clone(),
        )?
        .with_kind(config.transport);
        Ok(Self::new(Arc::new(transport), config))
    }

    /// Link over a MIPI-HSI controller.
    ///
    /// Returns the protocol handle too; the controller's interrupt glue
    /// feeds it with [`HsiLink::on_command`] and [`HsiLink::on_data`].
    pub fn hsi(port: Arc<dyn HsiPort>, config: LinkConfig) -> (Self, Arc<HsiLink>) {
        let link = Arc::new(HsiLink::new(port, config.hsi.clone(), config.frame.clone()));
        let config = LinkConfig {
            transport: TransportKind::Hsi,
            ..config
        };
        (Self::new(link.clone(), config), link)
    }

    pub fn transport(&self) -> &Arc<dyn LinkTransport> {
        &self.inner.transport
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> CommState {
        *lock(&self.inner.state)
    }

    /// Route inbound messages on `channel` to `handler`, replacing any
    /// previous handler.
    ///
    /// Handlers run on the thread processing work and must not register
    /// or unregister channels themselves.
    pub fn register_channel(&self, channel: u8, handler: impl FnMut(&[u8]) + Send + 'static) {
        debug!(channel, name = channel_name(channel), "registered channel");
        lock(&self.inner.handlers).insert(channel, Box::new(handler));
    }

    pub fn unregister_channel(&self, channel: u8) -> bool {
        lock(&self.inner.handlers).remove(&channel).is_some()
    }

    /// Observe every state change.
    pub fn on_state_changed(&self, listener: impl FnMut(CommState) + Send + 'static) {
        lock(&self.inner.state_listeners).push(Box::new(listener));
    }

    /// Observe every mailbox command from the modem.
    pub fn on_command(&self, listener: impl FnMut(Command) + Send + 'static) {
        lock(&self.inner.command_listeners).push(Box::new(listener));
    }

    /// Apply a transition and notify listeners.
    ///
    /// Listeners run under the listener lock, in the order transitions
    /// were applied, and must not change the state themselves.
    fn set_state(&self, next: CommState) -> bool {
        let mut listeners = lock(&self.inner.state_listeners);
        let previous = {
            let mut state = lock(&self.inner.state);
            let previous = *state;
            if previous == next {
                return false;
            }
            if !previous.can_transition(next) {
                warn!(from = %previous, to = %next, "ignoring invalid state transition");
                return false;
            }
            *state = next;
            previous
        };

        if next == CommState::Crash {
            error!(from = %previous, "link crashed");
        } else {
            info!(from = %previous, to = %next, "link state changed");
        }
        for listener in listeners.iter_mut() {
            listener(next);
        }
        true
    }

    /// Reset the transport and start the modem handshake.
    ///
    /// Transports without a mailbox handshake go straight to `Online`.
    pub fn init_comm(&self) -> Result<()> {
        let transport = &self.inner.transport;
        info!(transport = %transport.kind(), "initializing link");
        if let Err(err) = transport.reset() {
            error!(error = %err, "link reset failed");
            return Err(err.into());
        }
        self.set_state(CommState::Handshake);
        if transport.needs_handshake() {
            transport.send_command(Command::InitStart)?;
        } else {
            self.set_state(CommState::Online);
        }
        Ok(())
    }

    /// Hand the link to the firmware download protocol.
    pub fn enter_boot(&self) -> Result<()> {
        let state = self.state();
        if state != CommState::Handshake {
            return Err(LinkError::NotReady { state });
        }
        self.set_state(CommState::Boot);
        Ok(())
    }

    /// Tear the link down; every waiter is released.
    pub fn terminate_comm(&self) {
        self.inner.transport.terminate();
        self.set_state(CommState::None);
    }

    /// Declare the modem crashed on the consumer's behalf.
    pub fn force_crash(&self) {
        warn!("forcing modem crash");
        let transport = &self.inner.transport;
        if transport.needs_handshake() {
            if let Err(err) = transport.send_command(Command::CrashExit) {
                debug!(error = %err, "could not notify modem of forced crash");
            }
        }
        self.set_state(CommState::Crash);
    }

    /// Recover from `Crash` (or any state) by re-running bring-up.
    pub fn reset(&self) -> Result<()> {
        info!(state = %self.state(), "resetting link");
        self.init_comm()
    }

    fn enter_crash(&self, reason: &LinkError) {
        error!(error = %reason, "link unusable, forcing crash state");
        self.inner.transport.terminate();
        self.set_state(CommState::Crash);
    }

    /// Send one message on `channel`.
    pub fn send(&self, channel: u8, payload: &[u8]) -> Result<usize> {
        self.state().admits(channel)?;
        match self.inner.transport.transmit(channel, payload) {
            Ok(sent) => {
                trace!(channel, len = sent, "sent");
                Ok(sent)
            }
            Err(err) => {
                let err = LinkError::from_transport(channel, err);
                if matches!(err, LinkError::CorruptQueue(_)) {
                    self.enter_crash(&err);
                }
                Err(err)
            }
        }
    }

    /// Poll the transport and process all pending work without blocking.
    ///
    /// Returns the number of messages dispatched to handlers.
    pub fn recv(&self) -> Result<usize> {
        self.poll_transport()?;
        let pending: Vec<Work> = lock(&self.inner.work).try_iter().collect();
        let mut dispatched = 0;
        for work in pending {
            dispatched += self.process(work)?;
        }
        Ok(dispatched)
    }

    /// Like [`recv`](Self::recv), but waits up to `timeout` for work.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<usize> {
        let dispatched = self.recv()?;
        if dispatched > 0 {
            return Ok(dispatched);
        }
        let next = lock(&self.inner.work).recv_timeout(timeout);
        match next {
            Ok(first) => Ok(self.process(first)? + self.recv()?),
            Err(RecvTimeoutError::Timeout) => self.recv(),
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    fn poll_transport(&self) -> Result<()> {
        let polled = match self.inner.transport.poll() {
            Ok(_) => Ok(()),
            Err(err) => self.fail_inbound(err),
        };
        self.take_latched_crash()?;
        polled
    }

    /// Apply a crash the notifier could not queue.
    fn take_latched_crash(&self) -> Result<()> {
        match self.inner.notifier.take_crash() {
            Some(command) => self.handle_command(command),
            None => Ok(()),
        }
    }

    fn fail_inbound(&self, err: TransportError) -> Result<()> {
        let err = LinkError::from(err);
        match err {
            LinkError::CorruptQueue(_) => {
                self.enter_crash(&err);
                Err(err)
            }
            LinkError::LinkInactive => {
                debug!("inbound work while link inactive");
                Ok(())
            }
            err => Err(err),
        }
    }

    fn process(&self, work: Work) -> Result<usize> {
        match work {
            Work::Drain(queue) => {
                self.inner.notifier.begin_drain(queue);
                let mut inbound = Vec::new();
                if let Err(err) = self
                    .inner
                    .transport
                    .drain(queue, &mut |frame| inbound.push(frame))
                {
                    self.fail_inbound(err)?;
                }
                Ok(inbound
                    .into_iter()
                    .map(|frame| usize::from(self.dispatch(frame)))
                    .sum())
            }
            Work::Command(command) => {
                self.handle_command(command)?;
                Ok(0)
            }
            Work::Shutdown => Ok(0),
        }
    }

    fn dispatch(&self, frame: Frame) -> bool {
        let state = self.state();
        if state.admits(frame.channel).is_err() {
            self.inner.undelivered.fetch_add(1, Ordering::Relaxed);
            debug!(channel = frame.channel, %state, "dropping inbound message");
            return false;
        }
        let mut handlers = lock(&self.inner.handlers);
        match handlers.get_mut(&frame.channel) {
            Some(handler) => {
                handler(&frame.payload);
                true
            }
            None => {
                self.inner.undelivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = frame.channel,
                    name = channel_name(frame.channel),
                    "no handler registered"
                );
                false
            }
        }
    }

    fn handle_command(&self, command: Command) -> Result<()> {
        match command {
            Command::InitEnd => {
                if self.state() == CommState::Handshake {
                    self.set_state(CommState::Online);
                } else {
                    debug!(state = %self.state(), "ignoring INIT_END");
                }
            }
            Command::PhoneStart => {
                info!("modem (re)started, restarting handshake");
                self.init_comm()?;
            }
            Command::ReqActive => {
                self.inner.transport.send_command(Command::ResActive)?;
            }
            Command::CrashReset | Command::CrashExit => {
                error!(%command, "modem reported crash");
                self.set_state(CommState::Crash);
            }
            Command::NormalPowerOff => {
                info!("modem powered off");
                self.terminate_comm();
            }
            other => debug!(command = %other, "forwarding mailbox command"),
        }
        for listener in lock(&self.inner.command_listeners).iter_mut() {
            listener(command);
        }
        Ok(())
    }

    /// Run the work loop on a dedicated thread until [`shutdown`].
    ///
    /// While a worker runs, other callers should not use `recv`.
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn spawn_worker(&self) -> std::io::Result<JoinHandle<()>> {
        let device = self.clone();
        std::thread::Builder::new()
            .name("modemlink-worker".to_string())
            .spawn(move || device.run_worker())
    }

    fn run_worker(&self) {
        let interval = self.inner.config.poll_interval();
        debug!("link worker started");
        loop {
            let next = lock(&self.inner.work).recv_timeout(interval);
            let result = match next {
                Ok(Work::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(work) => self
                    .process(work)
                    .and_then(|_| self.take_latched_crash()),
                Err(RecvTimeoutError::Timeout) => self.poll_transport(),
            };
            if let Err(err) = result {
                warn!(error = %err, "link worker error");
            }
        }
        debug!("link worker stopped");
    }

    /// Ask a running worker to exit.
    pub fn shutdown(&self) {
        if !self.inner.notifier.shutdown() {
            debug!("no worker to stop");
        }
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            state: self.state(),
            transport: self.inner.transport.kind(),
            link: self.inner.transport.stats(),
            undelivered: self.inner.undelivered.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for LinkDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkDevice")
            .field("transport", &self.inner.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}
