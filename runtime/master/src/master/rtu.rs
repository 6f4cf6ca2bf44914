//! RTU master engine.
//!
//! One frame-timed state machine over a [`ByteStream`]. A tick either
//! transmits the next ready ADU (after the inter-frame silence has elapsed),
//! accumulates response bytes against the byte/frame/response budgets, or
//! waits out stale traffic until the line is quiet again.

use tracing::{debug, trace, warn};

use crate::config::{RtuConfig, PDU_SIZE_MAX};
use crate::error::ModbusError;
use crate::protocol::{crc, Pdu};
use crate::transport::{ByteStream, Clock, MonotonicClock};
use crate::types::{slave, FunctionCode};

use super::adu::{AduPool, PendingQueue};
use super::{resolve_rotation, Callback, Channel, Disposition, MasterMetrics, Response, Target};

/// Station byte + largest PDU + CRC.
const FRAME_MAX: usize = 1 + PDU_SIZE_MAX + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    /// Line quiet, free to transmit
    Idle,
    /// A response is being accumulated
    Receive,
    /// Discarding until a frame timeout of silence restores the boundary
    BufferClear,
}

/// Asynchronous serial master.
pub struct RtuMaster<C, S: ByteStream> {
    stream: S,
    clock: Box<dyn Clock>,
    context: C,
    pool: AduPool<C>,
    queue: PendingQueue,
    state: RxState,
    current: Option<usize>,
    rx: Vec<u8>,
    expected_total: usize,
    head_checked: bool,
    sent_at_us: u64,
    last_byte_us: u64,
    last_activity_us: Option<u64>,
    byte_timeout_us: u64,
    frame_timeout_us: u64,
    response_timeout_us: u64,
    metrics: MasterMetrics,
}

impl<C, S: ByteStream> RtuMaster<C, S> {
    /// Creates a master over `stream` with the system clock.
    pub fn new(config: RtuConfig, stream: S, context: C) -> crate::Result<Self> {
        Self::with_clock(config, stream, context, Box::new(MonotonicClock::new()))
    }

    /// Creates a master with an explicit clock.
    pub fn with_clock(
        config: RtuConfig,
        stream: S,
        context: C,
        clock: Box<dyn Clock>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let timeouts = config.timeouts();
        Ok(Self {
            pool: AduPool::new(config.adu_pool_size, config.pdu_size),
            queue: PendingQueue::new(config.queue_size),
            state: RxState::Idle,
            current: None,
            rx: Vec::with_capacity(FRAME_MAX),
            expected_total: 0,
            head_checked: false,
            sent_at_us: 0,
            last_byte_us: 0,
            last_activity_us: None,
            byte_timeout_us: timeouts.byte_us,
            frame_timeout_us: timeouts.frame_us,
            response_timeout_us: timeouts.response_us,
            metrics: MasterMetrics::default(),
            stream,
            clock,
            context,
        })
    }

    /// The user context callbacks are dispatched with.
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// The underlying byte stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Number of requests awaiting transmission.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of pooled ADUs currently dispensed.
    pub fn adus_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Tears the engine down.
    ///
    /// Flushes the queue, releases every ADU and returns to the idle line
    /// state without invoking any callback. Afterwards the engine is
    /// indistinguishable from a freshly constructed one.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.pool.release_all();
        self.state = RxState::Idle;
        self.current = None;
        self.rx.clear();
        self.expected_total = 0;
        self.head_checked = false;
        self.last_activity_us = None;
        self.metrics = MasterMetrics::default();
    }

    fn silence_elapsed(&self, now: u64) -> bool {
        match self.last_activity_us {
            None => true,
            Some(at) => now.saturating_sub(at) >= self.frame_timeout_us,
        }
    }

    fn tick_idle(&mut self, now: u64) {
        if self.stream.available() > 0 {
            debug!("stale bytes outside a transaction");
            self.drain(now);
            self.state = RxState::BufferClear;
            return;
        }
        if !self.silence_elapsed(now) {
            return;
        }
        if let Some(index) = self.queue.pop_ready(&self.pool, now) {
            self.transmit(index, now);
        }
    }

    fn transmit(&mut self, index: usize, now: u64) {
        let mut frame = [0u8; FRAME_MAX];
        let (station, body) = {
            let adu = self.pool.get(index);
            let tx = adu.pdu.tx_pdu();
            frame[0] = adu.slave;
            frame[1..1 + tx.len()].copy_from_slice(tx);
            (adu.slave, 1 + tx.len())
        };
        let checksum = crc::crc16(&frame[..body]);
        frame[body..body + 2].copy_from_slice(&checksum.to_le_bytes());
        let total = body + 2;

        self.stream.begin_transmit();
        self.stream.write_all(&frame[..total]);
        self.stream.flush();
        self.stream.end_transmit();
        trace!(station, frame = %hex::encode(&frame[..total]), "tx");
        self.last_activity_us = Some(now);
        self.current = Some(index);

        if station == slave::BROADCAST {
            // No response on the air. The callback fires now; the
            // frame-silence gate holds the line through the turnaround
            // before the next transmission.
            self.finish(Ok(()), now);
            return;
        }

        self.state = RxState::Receive;
        self.rx.clear();
        self.head_checked = false;
        self.expected_total = 1 + self.pool.get(index).pdu.expected_len() + 2;
        self.sent_at_us = now;
        self.last_byte_us = now;
    }

    fn tick_receive(&mut self, now: u64) {
        self.pull_bytes(now);

        if self.rx.is_empty() {
            if now.saturating_sub(self.sent_at_us) >= self.response_timeout_us {
                self.metrics.timeouts += 1;
                warn!("response timeout");
                self.finish(Err(ModbusError::ResponseTimeout), now);
                self.state = RxState::Idle;
            }
            return;
        }

        // First stage: station and function bytes.
        if !self.head_checked && self.rx.len() >= 2 {
            let Some(index) = self.current else { return };
            let adu = self.pool.get(index);
            if self.rx[0] != adu.slave {
                warn!(expected = adu.slave, actual = self.rx[0], "response from unexpected station");
                self.drain(now);
                self.finish(Err(ModbusError::InvalidSlave), now);
                self.state = RxState::BufferClear;
                return;
            }
            if self.rx[1] == adu.pdu.function() | 0x80 {
                // Exception frame: station, function, code, CRC.
                self.expected_total = 5;
            }
            self.head_checked = true;
        }

        // Second stage, same tick: full frame, checksum, validation.
        if self.head_checked && self.rx.len() >= self.expected_total {
            self.complete_frame(now);
            return;
        }

        // A silent gap inside the frame means it ended short.
        if now.saturating_sub(self.last_byte_us) >= self.byte_timeout_us {
            debug!(
                received = self.rx.len(),
                expected = self.expected_total,
                "frame ended short"
            );
            self.drain(now);
            self.finish(Err(ModbusError::TooFewData), now);
            self.state = RxState::BufferClear;
        }
    }

    fn pull_bytes(&mut self, now: u64) {
        while self.rx.len() < self.expected_total && self.stream.available() > 0 {
            let mut chunk = [0u8; FRAME_MAX];
            let want = (self.expected_total - self.rx.len()).min(chunk.len());
            let n = self.stream.read(&mut chunk[..want]);
            if n == 0 {
                break;
            }
            self.rx.extend_from_slice(&chunk[..n]);
            self.last_byte_us = now;
            self.last_activity_us = Some(now);
        }
    }

    fn complete_frame(&mut self, now: u64) {
        let total = self.expected_total;
        trace!(frame = %hex::encode(&self.rx[..total]), "rx");
        let computed = crc::crc16(&self.rx[..total - 2]);
        let received = u16::from_le_bytes([self.rx[total - 2], self.rx[total - 1]]);
        if computed != received {
            warn!(computed, received, "crc mismatch");
            self.drain(now);
            self.finish(Err(ModbusError::Crc { computed, received }), now);
            self.state = RxState::BufferClear;
            return;
        }
        let Some(index) = self.current else { return };
        let result = {
            let adu = self.pool.get_mut(index);
            adu.pdu.set_rx(&self.rx[1..total - 2]);
            adu.pdu.validate_response()
        };
        self.finish(result, now);
        self.state = RxState::Idle;
        self.last_activity_us = Some(now);
    }

    fn drain(&mut self, now: u64) {
        let mut sink = [0u8; FRAME_MAX];
        while self.stream.available() > 0 {
            if self.stream.read(&mut sink) == 0 {
                break;
            }
            self.last_activity_us = Some(now);
        }
    }

    /// Delivers the callback, advances the rotation and recycles the slot.
    fn finish(&mut self, result: crate::Result<()>, now: u64) {
        let Some(index) = self.current.take() else {
            return;
        };
        match &result {
            Ok(()) => self.metrics.responses_success += 1,
            Err(_) => self.metrics.responses_failed += 1,
        }
        {
            let adu = self.pool.get_mut(index);
            let response = Response::new(adu.slave, adu.pdu.function(), result, Some(&adu.pdu));
            if let Some(callback) = adu.callback {
                callback(&mut self.context, response);
            }
        }
        match resolve_rotation(self.pool.get_mut(index)) {
            Disposition::Release => self.pool.release(index),
            Disposition::Requeue {
                slave: next,
                delay_us,
            } => {
                {
                    let adu = self.pool.get_mut(index);
                    adu.slave = next;
                    adu.queued_at_us = now;
                    adu.delay_us = delay_us;
                    adu.pdu.clear_rx();
                }
                if self.queue.push(index).is_err() {
                    self.fail_unsent(index, ModbusError::QueueFull);
                }
            }
        }
    }

    fn complete_unqueued(
        &mut self,
        station: u8,
        function: FunctionCode,
        callback: Callback<C>,
        error: ModbusError,
    ) {
        self.metrics.responses_failed += 1;
        callback(
            &mut self.context,
            Response::new(station, function.code(), Err(error), None),
        );
    }

    fn fail_unsent(&mut self, index: usize, error: ModbusError) {
        self.metrics.responses_failed += 1;
        {
            let adu = self.pool.get_mut(index);
            let response = Response::new(adu.slave, adu.pdu.function(), Err(error), Some(&adu.pdu));
            if let Some(callback) = adu.callback {
                callback(&mut self.context, response);
            }
        }
        self.pool.release(index);
    }
}

impl<C, S: ByteStream> Channel<C> for RtuMaster<C, S> {
    fn issue(
        &mut self,
        function: FunctionCode,
        target: Target,
        callback: Callback<C>,
        build: &mut dyn FnMut(&mut Pdu) -> crate::Result<()>,
    ) {
        let now = self.clock.now_us();
        let (first, set) = match target {
            Target::Slave(id) => (id, None),
            Target::Set(mut set) => {
                set.rewind();
                (set.next(), Some(set))
            }
        };
        if !slave::is_valid(first) {
            self.complete_unqueued(first, function, callback, ModbusError::InvalidArgument);
            return;
        }
        if first == slave::BROADCAST && !function.broadcast_capable() {
            self.complete_unqueued(first, function, callback, ModbusError::InvalidSlave);
            return;
        }
        let Some(index) = self.pool.acquire() else {
            warn!("adu pool exhausted");
            self.complete_unqueued(first, function, callback, ModbusError::NoFreeAdu);
            return;
        };
        {
            let adu = self.pool.get_mut(index);
            adu.slave = first;
            adu.slaves = set;
            adu.callback = Some(callback);
            adu.queued_at_us = now;
            adu.delay_us = 0;
            adu.pdu.clear();
        }
        if let Err(e) = build(&mut self.pool.get_mut(index).pdu) {
            self.fail_unsent(index, e);
            return;
        }
        if let Err(e) = self.queue.push(index) {
            self.fail_unsent(index, e);
            return;
        }
        self.metrics.requests_total += 1;
    }

    fn tick(&mut self) {
        let now = self.clock.now_us();
        match self.state {
            RxState::Idle => self.tick_idle(now),
            RxState::Receive => self.tick_receive(now),
            RxState::BufferClear => {
                if self.stream.available() > 0 {
                    self.drain(now);
                } else if self.silence_elapsed(now) {
                    self.state = RxState::Idle;
                }
            }
        }
    }

    fn metrics(&self) -> &MasterMetrics {
        &self.metrics
    }
}
