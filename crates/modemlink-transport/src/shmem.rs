//! SIPC5 shared-memory transport.
//!
//! Each logical device (FMT, RAW) owns a TX and an RX ring in the shared
//! window. The producer advances `head`, the consumer advances `tail`, and
//! the two sides poke each other through 16-bit mailbox registers.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use modemlink_frame::{Deframer, Fragmenter, Frame, FrameConfig, FrameError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::layout::{
    Queue, QueueDesc, QueueSizes, RegionLayout, DPRAM_FMT, DPRAM_RAW, QUEUE_COUNT, SHMEM_FMT,
    SHMEM_RAW,
};
use crate::mailbox::{self, Command, IntWord};
use crate::region::SharedMemory;
use crate::ring::RingBuffer;
use crate::stats::{LinkStats, StatsSnapshot};
use crate::traits::{LinkTransport, Notifier, TransportKind};

/// Value of the magic word once the region has been initialized.
pub const IPC_MAGIC: u32 = 0x0000_00AA;
/// Value of the access word while the region may be used.
pub const ACCESS_ENABLE: u32 = 1;

/// Queue geometry and flow-control budget for a shared-memory link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub fmt: QueueSizes,
    pub raw: QueueSizes,
    /// How many REQ_ACK rounds a full-queue send waits through.
    pub tx_retry_limit: u32,
    /// How long each round waits for RES_ACK.
    pub ack_wait_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        Self {
            fmt: SHMEM_FMT,
            raw: SHMEM_RAW,
            tx_retry_limit: 5,
            ack_wait_ms: 100,
        }
    }
}

impl ShmemConfig {
    /// Legacy DPRAM queue sizes.
    pub fn dpram() -> Self {
        Self {
            fmt: DPRAM_FMT,
            raw: DPRAM_RAW,
            ..Self::default()
        }
    }

    pub fn layout(&self) -> RegionLayout {
        RegionLayout::new(self.fmt, self.raw)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}

/// Which end of the window this instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Application processor: writes the TX rings, reads the RX rings.
    Ap,
    /// Modem side: the mirror image, used for simulation and loopback.
    Cp,
}

#[derive(Debug, Default)]
struct TxState {
    fragmenter: Fragmenter,
    scratch: BytesMut,
}

#[derive(Debug)]
struct RxState {
    deframer: Deframer,
    scratch: Vec<u8>,
}

#[derive(Debug, Default)]
struct AckState {
    epoch: u64,
    res_ack: [u64; QUEUE_COUNT],
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One side of a shared-memory link.
pub struct ShmemTransport {
    mem: Arc<dyn SharedMemory>,
    layout: RegionLayout,
    role: Role,
    kind: TransportKind,
    config: ShmemConfig,
    frame_config: FrameConfig,
    online: AtomicBool,
    tx: [Mutex<TxState>; QUEUE_COUNT],
    rx: [Mutex<RxState>; QUEUE_COUNT],
    ack_requested: [AtomicBool; QUEUE_COUNT],
    acks: Mutex<AckState>,
    ack_cond: Condvar,
    notifier: Mutex<Option<Notifier>>,
    stats: LinkStats,
}

impl ShmemTransport {
    /// Bind to a region laid out per `config`.
    pub fn new(
        mem: Arc<dyn SharedMemory>,
        role: Role,
        config: ShmemConfig,
        frame_config: FrameConfig,
    ) -> Result<Self> {
        let layout = config.layout();
        if mem.len() < layout.size() {
            return Err(TransportError::RegionTooSmall {
                need: layout.size(),
                have: mem.len(),
            });
        }
        if [config.fmt, config.raw]
            .iter()
            .any(|sizes| sizes.tx < 2 || sizes.rx < 2)
        {
            return Err(TransportError::Unsupported("queue smaller than two bytes"));
        }

        debug!(?role, size = layout.size(), "bound shared memory layout");
        Ok(Self {
            mem,
            layout,
            role,
            kind: TransportKind::Shmem,
            config,
            rx: std::array::from_fn(|_| {
                Mutex::new(RxState {
                    deframer: Deframer::new(&frame_config),
                    scratch: Vec::new(),
                })
            }),
            frame_config,
            online: AtomicBool::new(false),
            tx: std::array::from_fn(|_| Mutex::new(TxState::default())),
            ack_requested: std::array::from_fn(|_| AtomicBool::new(false)),
            acks: Mutex::new(AckState::default()),
            ack_cond: Condvar::new(),
            notifier: Mutex::new(None),
            stats: LinkStats::default(),
        })
    }

    /// Report `kind` instead of [`TransportKind::Shmem`] (e.g. for DPRAM).
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn config(&self) -> &ShmemConfig {
        &self.config
    }

    fn tx_desc(&self, queue: Queue) -> QueueDesc {
        let pair = self.layout.pair(queue);
        match self.role {
            Role::Ap => pair.tx,
            Role::Cp => pair.rx,
        }
    }

    fn rx_desc(&self, queue: Queue) -> QueueDesc {
        let pair = self.layout.pair(queue);
        match self.role {
            Role::Ap => pair.rx,
            Role::Cp => pair.tx,
        }
    }

    fn tx_ring(&self, queue: Queue) -> RingBuffer<'_> {
        RingBuffer::new(&*self.mem, self.tx_desc(queue), queue.name())
    }

    fn rx_ring(&self, queue: Queue) -> RingBuffer<'_> {
        RingBuffer::new(&*self.mem, self.rx_desc(queue), queue.name())
    }

    fn outbound_mailbox(&self) -> usize {
        match self.role {
            Role::Ap => self.layout.mbx_ap2cp,
            Role::Cp => self.layout.mbx_cp2ap,
        }
    }

    fn inbound_mailbox(&self) -> usize {
        match self.role {
            Role::Ap => self.layout.mbx_cp2ap,
            Role::Cp => self.layout.mbx_ap2cp,
        }
    }

    /// Current `(head, tail)` of the ring this side writes.
    pub fn tx_pointers(&self, queue: Queue) -> Result<(u32, u32)> {
        self.tx_ring(queue).pointers()
    }

    /// Current `(head, tail)` of the ring this side reads.
    pub fn rx_pointers(&self, queue: Queue) -> Result<(u32, u32)> {
        self.rx_ring(queue).pointers()
    }

    /// The word waiting in the peer-bound mailbox, without consuming it.
    pub fn pending_interrupt(&self) -> Result<u16> {
        self.mem.read_u16(self.outbound_mailbox())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TransportError::LinkInactive)
        }
    }

    /// Join a region the other side has already reset.
    ///
    /// Leaves shared state untouched; the link is usable once the peer's
    /// magic and access words are in place.
    pub fn activate(&self) {
        for rx in &self.rx {
            lock(rx).deframer.reset();
        }
        self.online.store(true, Ordering::Release);
        info!(role = ?self.role, active = self.is_active(), "joined shared memory link");
    }

    /// Frame `payload` and append it to the channel's TX ring.
    ///
    /// Fails with `Backpressure` (head untouched) when the framed message
    /// does not fit.
    pub fn send(&self, channel: u8, payload: &[u8]) -> Result<usize> {
        self.ensure_active()?;
        let queue = Queue::for_channel(channel);
        let mut tx = lock(&self.tx[queue.index()]);
        let TxState {
            fragmenter,
            scratch,
        } = &mut *tx;
        scratch.clear();
        let frames = fragmenter.encode(channel, payload, &self.frame_config, scratch)?;
        self.push_locked(queue, scratch)?;
        self.stats.record_tx(frames, payload.len());
        trace!(
            channel,
            queue = queue.name(),
            len = payload.len(),
            frames,
            "queued message"
        );
        Ok(payload.len())
    }

    /// Append already-framed bytes to a TX ring.
    pub fn enqueue(&self, queue: Queue, bytes: &[u8]) -> Result<usize> {
        self.ensure_active()?;
        let _tx = lock(&self.tx[queue.index()]);
        self.push_locked(queue, bytes)?;
        Ok(bytes.len())
    }

    fn push_locked(&self, queue: Queue, bytes: &[u8]) -> Result<()> {
        let tx_ring = self.tx_ring(queue);
        let max = tx_ring.capacity().saturating_sub(1) as usize;
        if bytes.len() > max {
            warn!(
                queue = queue.name(),
                size = bytes.len(),
                max,
                "message can never fit tx queue"
            );
            return Err(FrameError::FrameTooLarge {
                size: bytes.len(),
                max,
            }
            .into());
        }

        // Read the peer-facing RX state before publishing anything.
        let index = queue.index();
        let answer_ack = self.ack_requested[index].load(Ordering::Acquire)
            && self.rx_ring(queue).usage()? == 0;

        match tx_ring.push(bytes) {
            Ok(_) => {}
            Err(err @ TransportError::Backpressure { .. }) => {
                self.stats.record_backpressure();
                debug!(queue = queue.name(), error = %err, "tx queue full");
                return Err(err);
            }
            Err(err @ TransportError::CorruptQueue { .. }) => {
                error!(queue = queue.name(), error = %err, "tx queue corrupt");
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let masks = queue.masks();
        let mut bits = masks.send;
        if answer_ack && self.ack_requested[index].swap(false, Ordering::AcqRel) {
            bits |= masks.res_ack;
        }
        self.raise(bits)
    }

    /// `send`, retrying through REQ_ACK / RES_ACK rounds while the ring is
    /// full. Gives up with `Timeout` after `tx_retry_limit` rounds; a message
    /// larger than the whole ring fails at once with `FrameTooLarge`.
    pub fn send_wait(&self, channel: u8, payload: &[u8]) -> Result<usize> {
        let queue = Queue::for_channel(channel);
        let wait = self.config.ack_wait();
        let mut attempt = 0;
        loop {
            let seen = self.ack_marker(queue);
            match self.send(channel, payload) {
                Err(TransportError::Backpressure { needed, free, .. })
                    if attempt < self.config.tx_retry_limit =>
                {
                    attempt += 1;
                    debug!(
                        channel,
                        queue = queue.name(),
                        needed,
                        free,
                        attempt,
                        "queue full, requesting ack"
                    );
                    self.raise(queue.masks().req_ack)?;
                    self.wait_res_ack(queue, seen, wait)?;
                }
                Err(TransportError::Backpressure { .. }) => {
                    warn!(channel, queue = queue.name(), "peer never drained queue");
                    return Err(TransportError::Timeout {
                        op: "shmem send",
                        waited: wait * self.config.tx_retry_limit,
                    });
                }
                other => return other,
            }
        }
    }

    fn ack_marker(&self, queue: Queue) -> (u64, u64) {
        let acks = lock(&self.acks);
        (acks.epoch, acks.res_ack[queue.index()])
    }

    fn wait_res_ack(&self, queue: Queue, seen: (u64, u64), wait: Duration) -> Result<()> {
        let (epoch, count) = seen;
        let acks = lock(&self.acks);
        let (acks, _) = self
            .ack_cond
            .wait_timeout_while(acks, wait, |s| {
                s.epoch == epoch && s.res_ack[queue.index()] == count
            })
            .unwrap_or_else(PoisonError::into_inner);
        if acks.epoch != epoch {
            return Err(TransportError::Reset);
        }
        Ok(())
    }

    /// Merge data bits into the peer-bound mailbox.
    fn raise(&self, bits: u16) -> Result<()> {
        let previous = self
            .mem
            .update_u16(self.outbound_mailbox(), &mut |pending| {
                mailbox::merge(pending, bits)
            })?;
        trace!(bits, previous, "raised interrupt");
        Ok(())
    }

    /// Handle one inbound mailbox word.
    pub fn on_interrupt(&self, word: u16) {
        match mailbox::decode(word) {
            IntWord::Invalid => trace!(word, "ignoring invalid mailbox word"),
            IntWord::UnknownCommand(code) => warn!(code, "unknown mailbox command"),
            IntWord::Command(command) => {
                info!(%command, role = ?self.role, "mailbox command");
                let pending = self.pending_queues();
                self.with_notifier(|n| {
                    n.command(command);
                    for queue in pending {
                        n.schedule_drain(queue);
                    }
                });
            }
            IntWord::Data(bits) => {
                for queue in Queue::ALL {
                    let masks = queue.masks();
                    if bits & masks.res_ack != 0 {
                        lock(&self.acks).res_ack[queue.index()] += 1;
                        self.ack_cond.notify_all();
                        trace!(queue = queue.name(), "res_ack received");
                    }
                    if bits & masks.req_ack != 0 {
                        self.ack_requested[queue.index()].store(true, Ordering::Release);
                        debug!(queue = queue.name(), "peer requested ack");
                    }
                    if bits & (masks.send | masks.req_ack) != 0 {
                        self.with_notifier(|n| n.schedule_drain(queue.index()));
                    }
                }
            }
        }
    }

    fn with_notifier(&self, f: impl FnOnce(&Notifier)) {
        match lock(&self.notifier).as_ref() {
            Some(notifier) => f(notifier),
            None => debug!("interrupt with no work queue attached"),
        }
    }

    /// Read and clear the inbound mailbox, handling any valid word.
    pub fn poll_mailbox(&self) -> Result<Option<u16>> {
        let word = self.mem.update_u16(self.inbound_mailbox(), &mut |_| 0)?;
        if word & mailbox::INT_VALID == 0 {
            return Ok(None);
        }
        self.on_interrupt(word);
        Ok(Some(word))
    }

    /// Copy out everything queued on `queue`'s RX ring and hand each
    /// complete message to `sink`. A no-op when the ring is empty.
    pub fn drain_rx(&self, queue: Queue, sink: &mut dyn FnMut(Frame)) -> Result<usize> {
        self.ensure_active()?;
        let mut messages = Vec::new();
        {
            let mut rx = lock(&self.rx[queue.index()]);
            let RxState { deframer, scratch } = &mut *rx;
            scratch.clear();
            let len = match self.rx_ring(queue).pop_all(scratch) {
                Ok(len) => len,
                Err(err) => {
                    error!(queue = queue.name(), error = %err, "rx drain failed");
                    return Err(err);
                }
            };
            if len > 0 {
                let dropped = deframer.dropped_bytes();
                deframer.feed(scratch, |frame| messages.push(frame));
                self.stats
                    .record_resyncs(deframer.dropped_bytes().saturating_sub(dropped));
                self.stats.record_rx(messages.len(), len);
                trace!(queue = queue.name(), len, messages = messages.len(), "drained rx");
            }
        }

        if self.ack_requested[queue.index()].swap(false, Ordering::AcqRel) {
            self.raise(queue.masks().res_ack)?;
            debug!(queue = queue.name(), "acknowledged drain");
        }

        let delivered = messages.len();
        for message in messages {
            sink(message);
        }
        Ok(delivered)
    }

    fn bump_epoch(&self) {
        let mut acks = lock(&self.acks);
        acks.epoch += 1;
        acks.res_ack = [0; QUEUE_COUNT];
        drop(acks);
        self.ack_cond.notify_all();
    }
}

impl LinkTransport for ShmemTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn attach(&self, notifier: Notifier) {
        *lock(&self.notifier) = Some(notifier);
    }

    fn reset(&self) -> Result<()> {
        info!(role = ?self.role, kind = %self.kind, "resetting shared memory link");
        self.online.store(false, Ordering::Release);
        self.mem.write_u32(self.layout.access, 0)?;

        for queue in Queue::ALL {
            self.tx_ring(queue).clear()?;
            self.rx_ring(queue).clear()?;
            self.ack_requested[queue.index()].store(false, Ordering::Release);
            lock(&self.rx[queue.index()]).deframer.reset();
        }
        self.mem.write_u16(self.layout.mbx_ap2cp, 0)?;
        self.mem.write_u16(self.layout.mbx_cp2ap, 0)?;
        self.bump_epoch();

        self.mem.write_u32(self.layout.magic, IPC_MAGIC)?;
        fence(Ordering::Release);
        self.mem.write_u32(self.layout.access, ACCESS_ENABLE)?;
        self.online.store(true, Ordering::Release);
        Ok(())
    }

    fn terminate(&self) {
        info!(role = ?self.role, "terminating shared memory link");
        self.online.store(false, Ordering::Release);
        if let Err(err) = self.mem.write_u32(self.layout.access, 0) {
            warn!(error = %err, "failed to clear access word");
        }
        self.bump_epoch();
    }

    fn is_active(&self) -> bool {
        if !self.online.load(Ordering::Acquire) {
            return false;
        }
        matches!(
            (
                self.mem.read_u32(self.layout.magic),
                self.mem.read_u32(self.layout.access),
            ),
            (Ok(IPC_MAGIC), Ok(ACCESS_ENABLE))
        )
    }

    fn needs_handshake(&self) -> bool {
        true
    }

    fn transmit(&self, channel: u8, payload: &[u8]) -> Result<usize> {
        self.send_wait(channel, payload)
    }

    fn send_command(&self, command: Command) -> Result<()> {
        let word = command.to_word();
        let previous = self
            .mem
            .update_u16(self.outbound_mailbox(), &mut |_| word)?;
        if let IntWord::Data(bits) = mailbox::decode(previous) {
            debug!(%command, bits, "command replaced pending data bits");
        }
        debug!(%command, role = ?self.role, "sent mailbox command");
        Ok(())
    }

    fn drain(&self, queue: usize, sink: &mut dyn FnMut(Frame)) -> Result<usize> {
        let queue = Queue::from_index(queue).ok_or(TransportError::Unsupported("queue index"))?;
        self.drain_rx(queue, sink)
    }

    fn pending_queues(&self) -> Vec<usize> {
        Queue::ALL
            .into_iter()
            .filter(|queue| !matches!(self.rx_ring(*queue).usage(), Ok(0)))
            .map(Queue::index)
            .collect()
    }

    fn poll(&self) -> Result<bool> {
        Ok(self.poll_mailbox()?.is_some())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for ShmemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemTransport")
            .field("role", &self.role)
            .field("kind", &self.kind)
            .field("size", &self.layout.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{
        INT_MASK_REQ_ACK_F, INT_MASK_REQ_ACK_R, INT_MASK_RES_ACK_F, INT_MASK_SEND_F, INT_MASK_SEND_R,
    };
    use crate::region::HeapRegion;
    use crate::traits::Work;
    use modemlink_frame::{FMT_0, PDP_0};

    fn small_config() -> ShmemConfig {
        ShmemConfig {
            fmt: QueueSizes::new(64, 64),
            raw: QueueSizes::new(128, 128),
            tx_retry_limit: 2,
            ack_wait_ms: 10,
        }
    }

    fn pair() -> (Arc<HeapRegion>, ShmemTransport, ShmemTransport) {
        pair_with(small_config())
    }

    fn pair_with(config: ShmemConfig) -> (Arc<HeapRegion>, ShmemTransport, ShmemTransport) {
        let region = Arc::new(HeapRegion::new(config.layout().size()));
        let ap = ShmemTransport::new(
            region.clone(),
            Role::Ap,
            config.clone(),
            FrameConfig::default(),
        )
        .unwrap();
        let cp = ShmemTransport::new(region.clone(), Role::Cp, config, FrameConfig::default())
            .unwrap();
        ap.reset().unwrap();
        cp.activate();
        (region, ap, cp)
    }

    #[test]
    fn region_must_fit_layout() {
        let region = Arc::new(HeapRegion::new(32));
        let err = ShmemTransport::new(region, Role::Ap, small_config(), FrameConfig::default())
            .unwrap_err();
        assert!(matches!(err, TransportError::RegionTooSmall { have: 32, .. }));
    }

    #[test]
    fn inactive_until_reset() {
        let config = small_config();
        let region = Arc::new(HeapRegion::new(config.layout().size()));
        let ap = ShmemTransport::new(region, Role::Ap, config, FrameConfig::default()).unwrap();
        assert!(!ap.is_active());
        assert!(matches!(
            ap.send(PDP_0, b"x"),
            Err(TransportError::LinkInactive)
        ));
        ap.reset().unwrap();
        assert!(ap.is_active());
        ap.terminate();
        assert!(!ap.is_active());
    }

    #[test]
    fn send_raises_send_bit_and_peer_drains() {
        let (_region, ap, cp) = pair();
        ap.send(FMT_0, b"hello").unwrap();
        ap.send(PDP_0, b"data").unwrap();
        assert_eq!(
            mailbox::decode(ap.pending_interrupt().unwrap()),
            IntWord::Data(INT_MASK_SEND_F | INT_MASK_SEND_R)
        );

        let mut got = Vec::new();
        cp.drain_rx(Queue::Fmt, &mut |f| got.push(f)).unwrap();
        cp.drain_rx(Queue::Raw, &mut |f| got.push(f)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].channel, FMT_0);
        assert_eq!(got[0].payload.as_ref(), b"hello");
        assert_eq!(got[1].payload.as_ref(), b"data");

        assert_eq!(cp.drain_rx(Queue::Fmt, &mut |_| panic!()).unwrap(), 0);
        assert_eq!(ap.stats().tx_frames, 2);
        assert_eq!(cp.stats().rx_frames, 2);
    }

    #[test]
    fn interrupt_schedules_drain_and_forwards_commands() {
        let (_region, ap, cp) = pair();
        let (notifier, rx) = Notifier::channel(8);
        cp.attach(notifier);

        ap.send(FMT_0, b"ping").unwrap();
        assert!(cp.poll().unwrap());
        assert_eq!(rx.try_recv().unwrap(), Work::Drain(Queue::Fmt.index()));
        assert_eq!(ap.pending_interrupt().unwrap(), 0);

        ap.send_command(Command::InitStart).unwrap();
        assert_eq!(cp.poll_mailbox().unwrap(), Some(Command::InitStart.to_word()));
        assert_eq!(rx.try_recv().unwrap(), Work::Command(Command::InitStart));
        assert!(!cp.poll().unwrap());
    }

    #[test]
    fn command_catches_up_on_replaced_data_bits() {
        let (_region, ap, cp) = pair();
        let (notifier, rx) = Notifier::channel(8);
        cp.attach(notifier);

        ap.send(PDP_0, b"stranded").unwrap();
        ap.send_command(Command::ReqActive).unwrap();
        cp.poll().unwrap();

        let work: Vec<Work> = rx.try_iter().collect();
        assert_eq!(
            work,
            vec![
                Work::Command(Command::ReqActive),
                Work::Drain(Queue::Raw.index())
            ]
        );
    }

    #[test]
    fn req_ack_answered_after_drain() {
        let (_region, ap, cp) = pair();
        ap.send(FMT_0, b"fill").unwrap();
        cp.on_interrupt(mailbox::data_word(INT_MASK_REQ_ACK_F));

        cp.drain_rx(Queue::Fmt, &mut |_| {}).unwrap();
        let word = cp.pending_interrupt().unwrap();
        assert_eq!(mailbox::decode(word), IntWord::Data(INT_MASK_RES_ACK_F));
    }

    #[test]
    fn send_wait_times_out_when_peer_stalls() {
        let (_region, ap, _cp) = pair();
        let big = vec![0u8; 50];
        ap.send(FMT_0, &big).unwrap();

        let err = ap.send_wait(FMT_0, &big).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        let word = ap.pending_interrupt().unwrap();
        assert_ne!(word & INT_MASK_REQ_ACK_F, 0);
    }

    #[test]
    fn send_wait_resumes_after_peer_drains() {
        let (_region, ap, cp) = pair_with(ShmemConfig {
            tx_retry_limit: 5,
            ack_wait_ms: 200,
            ..small_config()
        });
        let ap = Arc::new(ap);
        let big = vec![7u8; 40];
        ap.send(FMT_0, &big).unwrap();

        let sender = {
            let ap = ap.clone();
            let big = big.clone();
            std::thread::spawn(move || ap.send_wait(FMT_0, &big))
        };

        let (notifier, _rx) = Notifier::channel(8);
        cp.attach(notifier);
        let mut got = 0;
        for _ in 0..200 {
            cp.poll_mailbox().unwrap();
            got += cp.drain_rx(Queue::Fmt, &mut |_| {}).unwrap();
            ap.poll_mailbox().unwrap();
            if sender.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(sender.join().unwrap().unwrap(), 40);
        assert!(got >= 1);
    }

    #[test]
    fn terminate_releases_blocked_sender() {
        let config = ShmemConfig {
            tx_retry_limit: 3,
            ack_wait_ms: 5_000,
            ..small_config()
        };
        let region = Arc::new(HeapRegion::new(config.layout().size()));
        let ap = Arc::new(
            ShmemTransport::new(region, Role::Ap, config, FrameConfig::default()).unwrap(),
        );
        ap.reset().unwrap();
        ap.send(FMT_0, &[0u8; 50]).unwrap();

        let sender = {
            let ap = ap.clone();
            std::thread::spawn(move || ap.send_wait(FMT_0, &[0u8; 50]))
        };
        std::thread::sleep(Duration::from_millis(50));
        ap.terminate();

        let err = sender.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Reset | TransportError::LinkInactive
        ));
    }

    #[test]
    fn corrupt_rx_pointer_surfaces() {
        let (region, ap, _cp) = pair();
        let desc = ap.layout().pair(Queue::Raw).rx;
        region.write_u32(desc.head, 9999).unwrap();
        let err = ap.drain_rx(Queue::Raw, &mut |_| {}).unwrap_err();
        assert!(matches!(err, TransportError::CorruptQueue { head: 9999, .. }));
    }

    #[test]
    fn oversized_message_fails_without_ack_rounds() {
        let (_region, ap, _cp) = pair_with(ShmemConfig {
            ack_wait_ms: 5_000,
            ..small_config()
        });
        let started = std::time::Instant::now();
        let err = ap.send_wait(PDP_0, &[0u8; 200]).unwrap_err();

        assert!(matches!(
            err,
            TransportError::Frame(FrameError::FrameTooLarge { max: 127, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ap.tx_pointers(Queue::Raw).unwrap(), (0, 0));
        assert_eq!(ap.pending_interrupt().unwrap(), 0);
        assert_eq!(ap.stats().backpressure, 0);
    }

    #[test]
    fn corrupt_rx_pointer_leaves_tx_untouched() {
        let (region, ap, _cp) = pair();
        ap.on_interrupt(mailbox::data_word(INT_MASK_REQ_ACK_R));
        let desc = ap.layout().pair(Queue::Raw).rx;
        region.write_u32(desc.head, 9999).unwrap();

        let err = ap.send(PDP_0, b"abcd").unwrap_err();
        assert!(matches!(err, TransportError::CorruptQueue { head: 9999, .. }));
        assert_eq!(ap.tx_pointers(Queue::Raw).unwrap(), (0, 0));
        assert_eq!(ap.pending_interrupt().unwrap(), 0);
        assert_eq!(ap.stats().tx_frames, 0);
    }
}
