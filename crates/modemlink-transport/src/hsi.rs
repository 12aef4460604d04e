//! MIPI-HSI command protocol.
//!
//! Logical channels share one physical link. A transfer is negotiated on
//! the command channel: the sender issues `OPEN_CONN_OCTET(len)`, the
//! receiver answers `ACK` (or `NAK` when it cannot take data), the payload
//! crosses the data channel, and the receiver confirms with `CONN_CLOSED`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use modemlink_frame::{ChannelClass, Deframer, Fragmenter, Frame, FrameConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::mailbox::Command;
use crate::stats::{LinkStats, StatsSnapshot};
use crate::traits::{LinkTransport, Notifier, TransportKind};

pub const CMD_BREAK: u8 = 0x0;
pub const CMD_ECHO: u8 = 0x1;
pub const CMD_OPEN_CONN: u8 = 0x7;
pub const CMD_CONN_READY: u8 = 0x8;
pub const CMD_CONN_CLOSED: u8 = 0x9;
pub const CMD_CANCEL_CONN: u8 = 0xA;
pub const CMD_ACK: u8 = 0xB;
pub const CMD_NAK: u8 = 0xC;
pub const CMD_OPEN_CONN_OCTET: u8 = 0xE;

pub const CH_CONTROL: u8 = 0;
pub const CH_FMT: u8 = 1;
pub const CH_RAW: u8 = 2;
pub const CH_RFS: u8 = 3;
pub const CH_CMD: u8 = 4;
pub const CHANNEL_COUNT: usize = 5;

const PARAM_MASK: u32 = 0x00FF_FFFF;

/// Build a 32-bit command word: `cmd<<28 | channel<<24 | param`.
pub fn command_word(cmd: u8, channel: u8, param: u32) -> u32 {
    (u32::from(cmd & 0xF) << 28) | (u32::from(channel & 0xF) << 24) | (param & PARAM_MASK)
}

/// Split a command word into `(cmd, channel, param)`.
pub fn parse_command(word: u32) -> (u8, u8, u32) {
    (
        (word >> 28) as u8,
        ((word >> 24) & 0xF) as u8,
        word & PARAM_MASK,
    )
}

/// HSI data channel carrying a SIPC5 channel id.
pub fn hsi_channel_for(channel: u8) -> u8 {
    match ChannelClass::of(channel) {
        ChannelClass::Fmt => CH_FMT,
        ChannelClass::Raw => CH_RAW,
        ChannelClass::Rfs => CH_RFS,
        ChannelClass::Boot | ChannelClass::Dump => CH_CMD,
    }
}

/// The physical side of an HSI controller.
///
/// Calls must not re-enter the link while holding locks of their own;
/// a port may deliver the peer's responses synchronously.
pub trait HsiPort: Send + Sync {
    /// Put a command word on the control channel.
    fn write_command(&self, word: u32) -> std::io::Result<()>;

    /// Put payload bytes on a data channel.
    fn write_data(&self, channel: u8, data: &[u8]) -> std::io::Result<()>;

    /// Arm a read of `len` bytes on `channel`; completion is reported via
    /// [`HsiLink::on_data`].
    fn start_read(&self, channel: u8, len: usize) -> std::io::Result<()>;

    /// Drive the physical wake line.
    fn set_wake(&self, asserted: bool);
}

/// Timeouts and limits for the HSI protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsiConfig {
    /// Wait for `ACK`/`NAK` after each open attempt.
    pub ack_timeout_ms: u64,
    /// Wait for `CONN_CLOSED` after the data phase.
    pub close_timeout_ms: u64,
    /// Extra open attempts after a `NAK`.
    pub open_retry_limit: u32,
    /// Largest transfer one open may announce (24-bit length field).
    pub max_packet_size: usize,
}

impl Default for HsiConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 200,
            close_timeout_ms: 1_000,
            open_retry_limit: 5,
            max_packet_size: 64 * 1024,
        }
    }
}

/// Sender-side state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStep {
    Closed,
    Idle,
    SendOpenConn,
    WaitForAck,
    Tx,
    WaitForConnClosed,
}

/// Receiver-side state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStep {
    Closed,
    /// Local consumer cannot take data; opens are refused with `NAK`.
    NotReady,
    Idle,
    ToAck,
    Rx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenReply {
    Ack,
    Nak,
}

struct ChannelState {
    send_step: SendStep,
    recv_step: RecvStep,
    reply: Option<OpenReply>,
    conn_closed: bool,
    epoch: u64,
    rx_expected: usize,
    rx_buffer: BytesMut,
    rx_wake: Option<WakeGuard>,
}

struct HsiChannel {
    id: u8,
    state: Mutex<ChannelState>,
    cond: Condvar,
    fragmenter: Mutex<Fragmenter>,
    deframer: Mutex<Deframer>,
    inbox: Mutex<VecDeque<Bytes>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference-counted owner of the physical wake line.
///
/// The line is asserted by the first holder and released by the last.
pub struct WakeLine {
    port: Arc<dyn HsiPort>,
    holders: Mutex<usize>,
}

impl WakeLine {
    pub fn new(port: Arc<dyn HsiPort>) -> Arc<Self> {
        Arc::new(Self {
            port,
            holders: Mutex::new(0),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> WakeGuard {
        let mut holders = lock(&self.holders);
        if *holders == 0 {
            trace!("asserting wake line");
            self.port.set_wake(true);
        }
        *holders += 1;
        WakeGuard { line: self.clone() }
    }

    pub fn holders(&self) -> usize {
        *lock(&self.holders)
    }
}

/// Keeps the wake line asserted while alive.
pub struct WakeGuard {
    line: Arc<WakeLine>,
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        let mut holders = lock(&self.line.holders);
        *holders = holders.saturating_sub(1);
        if *holders == 0 {
            trace!("releasing wake line");
            self.line.port.set_wake(false);
        }
    }
}

/// An HSI link multiplexing [`CHANNEL_COUNT`] logical channels.
pub struct HsiLink {
    port: Arc<dyn HsiPort>,
    wake: Arc<WakeLine>,
    channels: Vec<HsiChannel>,
    config: HsiConfig,
    frame_config: FrameConfig,
    active: AtomicBool,
    notifier: Mutex<Option<Notifier>>,
    stats: LinkStats,
}

impl HsiLink {
    /// Create a link over `port`. Every channel starts `Closed`.
    pub fn new(port: Arc<dyn HsiPort>, config: HsiConfig, frame_config: FrameConfig) -> Self {
        let channels = (0..CHANNEL_COUNT as u8)
            .map(|id| HsiChannel {
                id,
                state: Mutex::new(ChannelState {
                    send_step: SendStep::Closed,
                    recv_step: RecvStep::Closed,
                    reply: None,
                    conn_closed: false,
                    epoch: 0,
                    rx_expected: 0,
                    rx_buffer: BytesMut::new(),
                    rx_wake: None,
                }),
                cond: Condvar::new(),
                fragmenter: Mutex::new(Fragmenter::new()),
                deframer: Mutex::new(Deframer::new(&frame_config)),
                inbox: Mutex::new(VecDeque::new()),
            })
            .collect();
        Self {
            wake: WakeLine::new(port.clone()),
            port,
            channels,
            config,
            frame_config,
            active: AtomicBool::new(false),
            notifier: Mutex::new(None),
            stats: LinkStats::default(),
        }
    }

    fn channel(&self, id: u8) -> Result<&HsiChannel> {
        self.channels
            .get(id as usize)
            .ok_or(TransportError::UnknownChannel(id))
    }

    pub fn send_step(&self, channel: u8) -> Result<SendStep> {
        Ok(lock(&self.channel(channel)?.state).send_step)
    }

    pub fn recv_step(&self, channel: u8) -> Result<RecvStep> {
        Ok(lock(&self.channel(channel)?.state).recv_step)
    }

    pub fn wake_holders(&self) -> usize {
        self.wake.holders()
    }

    /// Mark a channel's consumer as (un)able to take data.
    ///
    /// While not ready, incoming opens are answered with `NAK`.
    pub fn set_rx_ready(&self, channel: u8, ready: bool) -> Result<()> {
        let chan = self.channel(channel)?;
        let mut state = lock(&chan.state);
        match (state.recv_step, ready) {
            (RecvStep::Idle, false) => state.recv_step = RecvStep::NotReady,
            (RecvStep::NotReady, true) => state.recv_step = RecvStep::Idle,
            _ => {}
        }
        Ok(())
    }

    /// Every command goes out with the wake line asserted.
    fn write_command(&self, cmd: u8, channel: u8, param: u32) -> Result<()> {
        let _wake = self.wake.acquire();
        trace!(cmd, channel, param, "hsi command out");
        self.port
            .write_command(command_word(cmd, channel, param))
            .map_err(TransportError::Io)
    }

    /// Move one packet across `channel`, blocking (bounded) for the peer's
    /// `ACK` and `CONN_CLOSED`.
    pub fn protocol_send(&self, channel: u8, payload: &[u8]) -> Result<usize> {
        if !self.active.load(Ordering::Acquire) {
            return Err(TransportError::LinkInactive);
        }
        let chan = self.channel(channel)?;
        if payload.len() > self.config.max_packet_size || payload.len() > PARAM_MASK as usize {
            return Err(TransportError::Frame(
                modemlink_frame::FrameError::FrameTooLarge {
                    size: payload.len(),
                    max: self.config.max_packet_size,
                },
            ));
        }

        let epoch = {
            let mut state = lock(&chan.state);
            if state.send_step != SendStep::Idle {
                return Err(TransportError::Busy { channel });
            }
            state.send_step = SendStep::SendOpenConn;
            state.conn_closed = false;
            state.epoch
        };

        let _wake = self.wake.acquire();
        let result = self.run_send(chan, epoch, payload);
        if !matches!(result, Err(TransportError::Reset)) {
            let mut state = lock(&chan.state);
            if state.epoch == epoch {
                state.send_step = SendStep::Idle;
            }
        }
        result
    }

    fn run_send(&self, chan: &HsiChannel, epoch: u64, payload: &[u8]) -> Result<usize> {
        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let len = payload.len() as u32;
        let mut attempt = 0u32;

        loop {
            {
                let mut state = lock(&chan.state);
                state.reply = None;
                state.send_step = SendStep::WaitForAck;
            }
            self.write_command(CMD_OPEN_CONN_OCTET, chan.id, len)?;

            let state = lock(&chan.state);
            let (mut state, _) = chan
                .cond
                .wait_timeout_while(state, ack_timeout, |s| {
                    s.reply.is_none() && s.epoch == epoch
                })
                .unwrap_or_else(PoisonError::into_inner);
            if state.epoch != epoch {
                return Err(TransportError::Reset);
            }
            match state.reply.take() {
                Some(OpenReply::Ack) => {
                    state.send_step = SendStep::Tx;
                    break;
                }
                Some(OpenReply::Nak) if attempt < self.config.open_retry_limit => {
                    attempt += 1;
                    state.send_step = SendStep::SendOpenConn;
                    debug!(channel = chan.id, attempt, "open refused, retrying");
                }
                Some(OpenReply::Nak) => {
                    warn!(channel = chan.id, attempts = attempt + 1, "peer kept refusing open");
                    return Err(TransportError::Timeout {
                        op: "hsi open",
                        waited: ack_timeout * (attempt + 1),
                    });
                }
                None => {
                    warn!(channel = chan.id, "no reply to open");
                    return Err(TransportError::Timeout {
                        op: "hsi open",
                        waited: ack_timeout,
                    });
                }
            }
        }

        self.port.write_data(chan.id, payload)?;

        let close_timeout = Duration::from_millis(self.config.close_timeout_ms);
        let mut state = lock(&chan.state);
        if state.epoch != epoch {
            return Err(TransportError::Reset);
        }
        state.send_step = SendStep::WaitForConnClosed;
        let (state, _) = chan
            .cond
            .wait_timeout_while(state, close_timeout, |s| {
                !s.conn_closed && s.epoch == epoch
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.epoch != epoch {
            return Err(TransportError::Reset);
        }
        if !state.conn_closed {
            warn!(channel = chan.id, "peer never closed connection");
            return Err(TransportError::Timeout {
                op: "hsi close",
                waited: close_timeout,
            });
        }
        trace!(channel = chan.id, len = payload.len(), "hsi packet sent");
        Ok(payload.len())
    }

    /// Handle a command word from the peer.
    pub fn on_command(&self, word: u32) {
        let (cmd, channel, param) = parse_command(word);
        trace!(cmd, channel, param, "hsi command in");
        let Ok(chan) = self.channel(channel) else {
            warn!(cmd, channel, "command for unknown channel");
            return;
        };

        match cmd {
            CMD_OPEN_CONN_OCTET => self.accept_open(chan, param as usize),
            CMD_ACK | CMD_NAK => {
                let mut state = lock(&chan.state);
                if state.send_step == SendStep::WaitForAck {
                    state.reply = Some(if cmd == CMD_ACK {
                        OpenReply::Ack
                    } else {
                        OpenReply::Nak
                    });
                    chan.cond.notify_all();
                } else {
                    warn!(channel, step = ?state.send_step, cmd, "unexpected open reply");
                }
            }
            CMD_CONN_CLOSED => {
                let mut state = lock(&chan.state);
                if matches!(
                    state.send_step,
                    SendStep::Tx | SendStep::WaitForConnClosed
                ) {
                    state.conn_closed = true;
                    chan.cond.notify_all();
                } else {
                    warn!(channel, step = ?state.send_step, "unexpected conn closed");
                }
            }
            CMD_CANCEL_CONN => {
                let mut state = lock(&chan.state);
                if matches!(state.recv_step, RecvStep::ToAck | RecvStep::Rx) {
                    debug!(channel, "peer cancelled transfer");
                    state.recv_step = RecvStep::Idle;
                    state.rx_buffer.clear();
                    state.rx_wake = None;
                }
            }
            CMD_ECHO => {
                if let Err(err) = self.write_command(CMD_ECHO, channel, param) {
                    warn!(error = %err, "failed to answer echo");
                }
            }
            CMD_BREAK => debug!(channel, "break received"),
            CMD_OPEN_CONN | CMD_CONN_READY => debug!(cmd, channel, "ignoring legacy command"),
            _ => warn!(cmd, channel, "unknown hsi command"),
        }
    }

    fn accept_open(&self, chan: &HsiChannel, len: usize) {
        let reply = {
            let mut state = lock(&chan.state);
            match state.recv_step {
                RecvStep::Idle if len <= self.config.max_packet_size => {
                    state.recv_step = RecvStep::ToAck;
                    state.rx_expected = len;
                    state.rx_buffer.clear();
                    state.rx_buffer.reserve(len);
                    state.rx_wake = Some(self.wake.acquire());
                    state.recv_step = RecvStep::Rx;
                    CMD_ACK
                }
                step => {
                    debug!(channel = chan.id, ?step, len, "refusing open");
                    CMD_NAK
                }
            }
        };

        if reply == CMD_ACK {
            if let Err(err) = self.port.start_read(chan.id, len) {
                warn!(channel = chan.id, error = %err, "failed to arm read");
                let mut state = lock(&chan.state);
                state.recv_step = RecvStep::Idle;
                state.rx_wake = None;
                drop(state);
                self.reply(CMD_NAK, chan.id, len);
                return;
            }
        }
        self.reply(reply, chan.id, len);
    }

    fn reply(&self, cmd: u8, channel: u8, len: usize) {
        if let Err(err) = self.write_command(cmd, channel, len as u32) {
            warn!(channel, cmd, error = %err, "failed to answer open");
        }
    }

    /// Hand received bytes for `channel` to the link. May be called with
    /// partial chunks; the packet completes once the announced length is in.
    pub fn on_data(&self, channel: u8, data: &[u8]) {
        let Ok(chan) = self.channel(channel) else {
            warn!(channel, "data for unknown channel");
            return;
        };

        let (packet, rx_wake) = {
            let mut state = lock(&chan.state);
            if state.recv_step != RecvStep::Rx {
                warn!(channel, step = ?state.recv_step, len = data.len(), "unexpected data");
                return;
            }
            let want = state.rx_expected - state.rx_buffer.len();
            state
                .rx_buffer
                .extend_from_slice(&data[..data.len().min(want)]);
            if state.rx_buffer.len() < state.rx_expected {
                return;
            }
            state.recv_step = RecvStep::Idle;
            (state.rx_buffer.split().freeze(), state.rx_wake.take())
        };

        trace!(channel, len = packet.len(), "hsi packet received");
        lock(&chan.inbox).push_back(packet);
        if let Err(err) = self.write_command(CMD_CONN_CLOSED, channel, 0) {
            warn!(channel, error = %err, "failed to close connection");
        }
        drop(rx_wake);
        if let Some(notifier) = lock(&self.notifier).as_ref() {
            notifier.schedule_drain(channel as usize);
        }
    }

    /// Deframe every received packet on `channel`.
    pub fn drain_channel(&self, channel: u8, sink: &mut dyn FnMut(Frame)) -> Result<usize> {
        let chan = self.channel(channel)?;
        let packets: Vec<Bytes> = lock(&chan.inbox).drain(..).collect();
        if packets.is_empty() {
            return Ok(0);
        }

        let mut messages = Vec::new();
        {
            let mut deframer = lock(&chan.deframer);
            let dropped = deframer.dropped_bytes();
            for packet in &packets {
                deframer.feed(packet, |frame| messages.push(frame));
                self.stats.record_rx(0, packet.len());
            }
            self.stats
                .record_resyncs(deframer.dropped_bytes().saturating_sub(dropped));
        }
        self.stats.record_rx(messages.len(), 0);

        let delivered = messages.len();
        for message in messages {
            sink(message);
        }
        Ok(delivered)
    }
}

impl LinkTransport for HsiLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Hsi
    }

    fn attach(&self, notifier: Notifier) {
        *lock(&self.notifier) = Some(notifier);
    }

    fn reset(&self) -> Result<()> {
        info!("opening hsi channels");
        for chan in &self.channels {
            let mut state = lock(&chan.state);
            state.epoch += 1;
            state.send_step = SendStep::Idle;
            state.recv_step = RecvStep::Idle;
            state.reply = None;
            state.conn_closed = false;
            state.rx_buffer.clear();
            state.rx_wake = None;
            drop(state);
            chan.cond.notify_all();
            lock(&chan.deframer).reset();
            lock(&chan.inbox).clear();
        }
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn terminate(&self) {
        info!("closing hsi channels");
        self.active.store(false, Ordering::Release);
        for chan in &self.channels {
            let mut state = lock(&chan.state);
            state.epoch += 1;
            state.send_step = SendStep::Closed;
            state.recv_step = RecvStep::Closed;
            state.rx_wake = None;
            drop(state);
            chan.cond.notify_all();
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn needs_handshake(&self) -> bool {
        false
    }

    fn transmit(&self, channel: u8, payload: &[u8]) -> Result<usize> {
        let hsi_channel = hsi_channel_for(channel);
        let chan = self.channel(hsi_channel)?;
        let mut packet = BytesMut::new();
        let frames = lock(&chan.fragmenter).encode(
            channel,
            payload,
            &self.frame_config,
            &mut packet,
        )?;
        self.protocol_send(hsi_channel, &packet)?;
        self.stats.record_tx(frames, payload.len());
        Ok(payload.len())
    }

    fn send_command(&self, _command: Command) -> Result<()> {
        Err(TransportError::Unsupported("mailbox commands over hsi"))
    }

    fn drain(&self, queue: usize, sink: &mut dyn FnMut(Frame)) -> Result<usize> {
        let channel = u8::try_from(queue).map_err(|_| TransportError::Unsupported("queue index"))?;
        self.drain_channel(channel, sink)
    }

    fn pending_queues(&self) -> Vec<usize> {
        self.channels
            .iter()
            .filter(|chan| !lock(&chan.inbox).is_empty())
            .map(|chan| chan.id as usize)
            .collect()
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for HsiLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsiLink")
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("wake_holders", &self.wake.holders())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Records everything the link puts on the wire.
    #[derive(Default)]
    struct RecordingPort {
        commands: Mutex<Vec<u32>>,
        data: Mutex<Vec<(u8, Vec<u8>)>>,
        reads: Mutex<Vec<(u8, usize)>>,
        wake: Mutex<Vec<bool>>,
        /// Wake line level seen by each command write.
        awake_at_command: Mutex<Vec<(u8, bool)>>,
    }

    impl HsiPort for RecordingPort {
        fn write_command(&self, word: u32) -> std::io::Result<()> {
            let awake = self.wake.lock().unwrap().last() == Some(&true);
            self.awake_at_command
                .lock()
                .unwrap()
                .push((parse_command(word).0, awake));
            self.commands.lock().unwrap().push(word);
            Ok(())
        }

        fn write_data(&self, channel: u8, data: &[u8]) -> std::io::Result<()> {
            self.data.lock().unwrap().push((channel, data.to_vec()));
            Ok(())
        }

        fn start_read(&self, channel: u8, len: usize) -> std::io::Result<()> {
            self.reads.lock().unwrap().push((channel, len));
            Ok(())
        }

        fn set_wake(&self, asserted: bool) {
            self.wake.lock().unwrap().push(asserted);
        }
    }

    fn link(config: HsiConfig) -> (Arc<RecordingPort>, Arc<HsiLink>) {
        let port = Arc::new(RecordingPort::default());
        let link = Arc::new(HsiLink::new(port.clone(), config, FrameConfig::default()));
        link.reset().unwrap();
        (port, link)
    }

    fn fast() -> HsiConfig {
        HsiConfig {
            ack_timeout_ms: 2_000,
            close_timeout_ms: 2_000,
            open_retry_limit: 2,
            ..HsiConfig::default()
        }
    }

    fn wait_for_step(link: &HsiLink, channel: u8, step: SendStep) {
        for _ in 0..500 {
            if link.send_step(channel).unwrap() == step {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("channel {channel} never reached {step:?}");
    }

    #[test]
    fn command_word_layout() {
        let word = command_word(CMD_OPEN_CONN_OCTET, CH_RAW, 1500);
        assert_eq!(word, 0xE200_05DC);
        assert_eq!(parse_command(word), (CMD_OPEN_CONN_OCTET, CH_RAW, 1500));
        assert_eq!(parse_command(command_word(CMD_ACK, CH_FMT, 0x1FF_FFFF)).2, 0xFF_FFFF);
    }

    #[test]
    fn channel_mapping() {
        assert_eq!(hsi_channel_for(modemlink_frame::FMT_0), CH_FMT);
        assert_eq!(hsi_channel_for(10), CH_RAW);
        assert_eq!(hsi_channel_for(modemlink_frame::RFS_1), CH_RFS);
        assert_eq!(hsi_channel_for(modemlink_frame::BOOT_0), CH_CMD);
    }

    #[test]
    fn channels_start_closed() {
        let port = Arc::new(RecordingPort::default());
        let link = HsiLink::new(port, HsiConfig::default(), FrameConfig::default());
        assert_eq!(link.send_step(CH_FMT).unwrap(), SendStep::Closed);
        assert!(matches!(
            link.protocol_send(CH_FMT, b"x"),
            Err(TransportError::LinkInactive)
        ));
    }

    #[test]
    fn full_send_sequence() {
        let (port, link) = link(fast());
        let sender = {
            let link = link.clone();
            std::thread::spawn(move || link.protocol_send(CH_FMT, b"payload"))
        };

        wait_for_step(&link, CH_FMT, SendStep::WaitForAck);
        link.on_command(command_word(CMD_ACK, CH_FMT, 7));
        wait_for_step(&link, CH_FMT, SendStep::WaitForConnClosed);
        link.on_command(command_word(CMD_CONN_CLOSED, CH_FMT, 0));

        assert_eq!(sender.join().unwrap().unwrap(), 7);
        assert_eq!(link.send_step(CH_FMT).unwrap(), SendStep::Idle);
        assert_eq!(
            port.commands.lock().unwrap()[0],
            command_word(CMD_OPEN_CONN_OCTET, CH_FMT, 7)
        );
        assert_eq!(port.data.lock().unwrap()[0], (CH_FMT, b"payload".to_vec()));
        assert_eq!(*port.wake.lock().unwrap(), vec![true, false]);
        assert_eq!(link.wake_holders(), 0);
    }

    #[test]
    fn busy_channel_rejects_without_mutation() {
        let (_port, link) = link(fast());
        let sender = {
            let link = link.clone();
            std::thread::spawn(move || link.protocol_send(CH_RAW, b"first"))
        };
        wait_for_step(&link, CH_RAW, SendStep::WaitForAck);

        let err = link.protocol_send(CH_RAW, b"second").unwrap_err();
        assert!(matches!(err, TransportError::Busy { channel: CH_RAW }));
        assert_eq!(link.send_step(CH_RAW).unwrap(), SendStep::WaitForAck);

        link.on_command(command_word(CMD_ACK, CH_RAW, 5));
        wait_for_step(&link, CH_RAW, SendStep::WaitForConnClosed);
        link.on_command(command_word(CMD_CONN_CLOSED, CH_RAW, 0));
        assert!(sender.join().unwrap().is_ok());
    }

    #[test]
    fn nak_then_ack_reaches_tx() {
        let (port, link) = link(fast());
        let sender = {
            let link = link.clone();
            std::thread::spawn(move || link.protocol_send(CH_RFS, b"retry"))
        };

        wait_for_step(&link, CH_RFS, SendStep::WaitForAck);
        link.on_command(command_word(CMD_NAK, CH_RFS, 5));
        for _ in 0..500 {
            if port.commands.lock().unwrap().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        wait_for_step(&link, CH_RFS, SendStep::WaitForAck);
        link.on_command(command_word(CMD_ACK, CH_RFS, 5));
        wait_for_step(&link, CH_RFS, SendStep::WaitForConnClosed);
        link.on_command(command_word(CMD_CONN_CLOSED, CH_RFS, 0));

        assert_eq!(sender.join().unwrap().unwrap(), 5);
        assert_eq!(port.commands.lock().unwrap().len(), 2);
    }

    #[test]
    fn naks_beyond_bound_time_out() {
        let (port, link) = link(HsiConfig {
            open_retry_limit: 1,
            ..fast()
        });
        let sender = {
            let link = link.clone();
            std::thread::spawn(move || link.protocol_send(CH_FMT, b"nope"))
        };

        for expected in 1..=2 {
            for _ in 0..500 {
                if port.commands.lock().unwrap().len() == expected
                    && link.send_step(CH_FMT).unwrap() == SendStep::WaitForAck
                {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            link.on_command(command_word(CMD_NAK, CH_FMT, 4));
        }

        let err = sender.join().unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(link.send_step(CH_FMT).unwrap(), SendStep::Idle);
    }

    #[test]
    fn missing_ack_times_out_and_returns_idle() {
        let (_port, link) = link(HsiConfig {
            ack_timeout_ms: 20,
            ..fast()
        });
        let err = link.protocol_send(CH_FMT, b"lost").unwrap_err();
        assert!(matches!(err, TransportError::Timeout { op: "hsi open", .. }));
        assert_eq!(link.send_step(CH_FMT).unwrap(), SendStep::Idle);
        assert_eq!(link.wake_holders(), 0);
    }

    #[test]
    fn receive_path_acks_reads_and_closes() {
        let (port, link) = link(fast());
        let (tx, rx) = mpsc::channel();
        link.attach(Notifier::channel(8).0);

        let mut wire = BytesMut::new();
        Fragmenter::new()
            .encode(modemlink_frame::FMT_0, b"inbound", &FrameConfig::default(), &mut wire)
            .unwrap();

        link.on_command(command_word(CMD_OPEN_CONN_OCTET, CH_FMT, wire.len() as u32));
        assert_eq!(link.recv_step(CH_FMT).unwrap(), RecvStep::Rx);
        assert_eq!(*port.reads.lock().unwrap(), vec![(CH_FMT, wire.len())]);
        assert_eq!(link.wake_holders(), 1);

        let (first, rest) = wire.split_at(3);
        link.on_data(CH_FMT, first);
        assert_eq!(link.recv_step(CH_FMT).unwrap(), RecvStep::Rx);
        link.on_data(CH_FMT, rest);
        assert_eq!(link.recv_step(CH_FMT).unwrap(), RecvStep::Idle);
        assert_eq!(link.wake_holders(), 0);

        let commands = port.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                command_word(CMD_ACK, CH_FMT, wire.len() as u32),
                command_word(CMD_CONN_CLOSED, CH_FMT, 0)
            ]
        );

        assert_eq!(link.pending_queues(), vec![CH_FMT as usize]);
        link.drain(CH_FMT as usize, &mut |f| tx.send(f).unwrap())
            .unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.payload.as_ref(), b"inbound");
    }

    #[test]
    fn not_ready_answers_nak() {
        let (port, link) = link(fast());
        link.set_rx_ready(CH_RAW, false).unwrap();
        link.on_command(command_word(CMD_OPEN_CONN_OCTET, CH_RAW, 64));
        assert_eq!(
            port.commands.lock().unwrap().last().copied(),
            Some(command_word(CMD_NAK, CH_RAW, 64))
        );
        assert_eq!(link.recv_step(CH_RAW).unwrap(), RecvStep::NotReady);
        assert!(port.reads.lock().unwrap().is_empty());
    }

    #[test]
    fn terminate_releases_waiting_sender() {
        let (_port, link) = link(fast());
        let sender = {
            let link = link.clone();
            std::thread::spawn(move || link.protocol_send(CH_FMT, b"stuck"))
        };
        wait_for_step(&link, CH_FMT, SendStep::WaitForAck);
        link.terminate();

        let err = sender.join().unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Reset));
        assert_eq!(link.send_step(CH_FMT).unwrap(), SendStep::Closed);
        assert_eq!(link.wake_holders(), 0);
    }

    #[test]
    fn wake_line_is_refcounted() {
        let port = Arc::new(RecordingPort::default());
        let line = WakeLine::new(port.clone());
        let a = line.acquire();
        let b = line.acquire();
        drop(a);
        assert_eq!(*port.wake.lock().unwrap(), vec![true]);
        drop(b);
        assert_eq!(*port.wake.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn receiver_replies_with_wake_asserted() {
        let (port, link) = link(fast());
        link.attach(Notifier::channel(8).0);

        link.on_command(command_word(CMD_OPEN_CONN_OCTET, CH_RAW, 4));
        link.on_data(CH_RAW, &[0x90, 0x0a, 0x04, 0x00]);
        link.set_rx_ready(CH_RAW, false).unwrap();
        link.on_command(command_word(CMD_OPEN_CONN_OCTET, CH_RAW, 4));
        link.on_command(command_word(CMD_ECHO, CH_RAW, 0x42));

        assert_eq!(
            *port.awake_at_command.lock().unwrap(),
            vec![
                (CMD_ACK, true),
                (CMD_CONN_CLOSED, true),
                (CMD_NAK, true),
                (CMD_ECHO, true)
            ]
        );
        assert_eq!(port.wake.lock().unwrap().last(), Some(&false));
        assert_eq!(link.wake_holders(), 0);
    }
}
