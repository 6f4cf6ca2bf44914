//! TCP master engine.
//!
//! One [`SlaveClient`] per configured station: its connection, reconnect
//! policy, pending queue and sent window. Requests are framed with an MBAP
//! header and either serialized one at a time or pipelined up to the window
//! capacity, with responses demultiplexed by transaction id.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::{TcpClientConfig, TcpConfig, PDU_SIZE_MAX};
use crate::error::ModbusError;
use crate::protocol::{mbap, mbap::MbapHeader, Pdu};
use crate::transport::tcp::TcpConnection;
use crate::transport::{Clock, Connection, MonotonicClock};
use crate::types::{slave, FunctionCode};

use super::adu::{AduPool, PendingQueue, SentEntry, SentWindow};
use super::{resolve_rotation, Callback, Channel, Disposition, MasterMetrics, Response, Target};

/// Where the per-client reader stands between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxPhase {
    /// Waiting for a complete MBAP header
    Header,
    /// Header consumed; waiting for the response PDU
    Body { adu: usize, remaining: usize },
    /// Unmatched response; draining its body to re-synchronize
    Discard { remaining: usize },
}

/// One configured slave endpoint.
struct SlaveClient {
    config: TcpClientConfig,
    conn: Box<dyn Connection>,
    queue: PendingQueue,
    sent: SentWindow,
    last_attempt_ms: Option<u64>,
    rx: RxPhase,
}

/// Asynchronous TCP master.
pub struct TcpMaster<C> {
    config: TcpConfig,
    clock: Box<dyn Clock>,
    context: C,
    pool: AduPool<C>,
    clients: Vec<SlaveClient>,
    metrics: MasterMetrics,
}

impl<C> TcpMaster<C> {
    /// Creates a master with the system clock.
    pub fn new(config: TcpConfig, context: C) -> crate::Result<Self> {
        Self::with_clock(config, context, Box::new(MonotonicClock::new()))
    }

    /// Creates a master with an explicit clock.
    pub fn with_clock(
        config: TcpConfig,
        context: C,
        clock: Box<dyn Clock>,
    ) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            pool: AduPool::new(config.adu_pool_size, config.pdu_size),
            clients: Vec::with_capacity(config.client_count),
            metrics: MasterMetrics::default(),
            config,
            clock,
            context,
        })
    }

    /// Registers a slave endpoint backed by a non-blocking socket.
    pub fn add_client(&mut self, config: TcpClientConfig) -> crate::Result<()> {
        let addr = SocketAddr::from((config.ip_address, config.port));
        let conn = TcpConnection::new(addr, Duration::from_millis(config.connect_timeout_ms));
        self.add_client_with(config, Box::new(conn))
    }

    /// Registers a slave endpoint over a caller-supplied connection.
    pub fn add_client_with(
        &mut self,
        config: TcpClientConfig,
        conn: Box<dyn Connection>,
    ) -> crate::Result<()> {
        config.validate()?;
        if self.clients.len() >= self.config.client_count {
            return Err(ModbusError::InvalidArgument);
        }
        if self.clients.iter().any(|c| c.config.slave == config.slave) {
            return Err(ModbusError::InvalidArgument);
        }
        self.clients.push(SlaveClient {
            queue: PendingQueue::new(self.config.queue_size),
            sent: SentWindow::new(config.window_size),
            last_attempt_ms: None,
            rx: RxPhase::Header,
            config,
            conn,
        });
        Ok(())
    }

    /// The user context callbacks are dispatched with.
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Number of registered slave endpoints.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of pooled ADUs currently dispensed.
    pub fn adus_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Requests queued for `station`.
    pub fn pending_for(&self, station: u8) -> Option<usize> {
        self.clients
            .iter()
            .find(|c| c.config.slave == station)
            .map(|c| c.queue.len())
    }

    /// Tears the engine down.
    ///
    /// Flushes every queue and window, drops every connection and releases
    /// all ADUs without invoking callbacks. Registered endpoints stay
    /// configured.
    pub fn reset(&mut self) {
        self.pool.release_all();
        for client in &mut self.clients {
            client.queue.clear();
            client.sent.clear();
            client.rx = RxPhase::Header;
            client.conn.close();
            client.last_attempt_ms = None;
        }
        self.metrics = MasterMetrics::default();
    }

    fn client_index(&self, station: u8) -> Option<usize> {
        self.clients.iter().position(|c| c.config.slave == station)
    }

    fn maintain_connection(&mut self, ci: usize, now_ms: u64) {
        if self.clients[ci].conn.is_connected() {
            return;
        }
        // A dropped connection orphans any half-read response.
        let phase = self.clients[ci].rx;
        self.clients[ci].rx = RxPhase::Header;
        if let RxPhase::Body { adu, .. } = phase {
            self.finish(adu, Err(ModbusError::ConnectionReset));
        }

        let client = &mut self.clients[ci];
        if client.last_attempt_ms.is_some() && !client.config.keep_alive {
            return;
        }
        if let Some(last) = client.last_attempt_ms {
            if now_ms.saturating_sub(last) < client.config.reconnect_interval_ms {
                return;
            }
        }
        client.last_attempt_ms = Some(now_ms);
        match client.conn.connect() {
            Ok(()) => debug!(slave = client.config.slave, "connected"),
            Err(e) => {
                warn!(slave = client.config.slave, error = %e, "connect failed");
                if e.kind() == io::ErrorKind::ConnectionRefused && !client.config.keep_alive {
                    // No retry is coming; the queue would starve silently.
                    // Bounded by the current length: a completed rotation may
                    // re-enqueue behind the flush.
                    let mut flush = self.clients[ci].queue.len();
                    while flush > 0 {
                        let Some(index) = self.clients[ci].queue.pop_front() else {
                            break;
                        };
                        flush -= 1;
                        self.finish(index, Err(ModbusError::ConnectionRefused));
                    }
                }
            }
        }
    }

    fn drain_queue(&mut self, ci: usize, now_ms: u64) {
        let now_us = self.clock.now_us();
        loop {
            let client = &mut self.clients[ci];
            if !client.conn.is_connected() {
                return;
            }
            let can_send = if client.config.all_at_once {
                client.sent.has_space()
            } else {
                client.sent.is_empty() && matches!(client.rx, RxPhase::Header)
            };
            if !can_send {
                return;
            }
            let Some(index) = client.queue.pop_ready(&self.pool, now_us) else {
                return;
            };

            let transaction_id = mbap::next_transaction_id();
            let mut frame = [0u8; mbap::MBAP_LEN + PDU_SIZE_MAX];
            let total = {
                let adu = self.pool.get(index);
                let pdu = adu.pdu.tx_pdu();
                frame[..mbap::MBAP_LEN]
                    .copy_from_slice(&mbap::build(transaction_id, adu.slave, pdu.len()));
                frame[mbap::MBAP_LEN..mbap::MBAP_LEN + pdu.len()].copy_from_slice(pdu);
                mbap::MBAP_LEN + pdu.len()
            };

            let client = &mut self.clients[ci];
            match client.conn.write_all(&frame[..total]) {
                Ok(()) => {
                    trace!(
                        slave = client.config.slave,
                        transaction = transaction_id,
                        frame = %hex::encode(&frame[..total]),
                        "tx"
                    );
                    let entry = SentEntry {
                        adu: index,
                        transaction_id,
                        sent_at_ms: now_ms,
                    };
                    if client.sent.insert(entry).is_err() {
                        self.finish(index, Err(ModbusError::SentBufferFull));
                        return;
                    }
                }
                Err(e) => {
                    warn!(slave = client.config.slave, error = %e, "write failed");
                    client.conn.close();
                    let error = if e.kind() == io::ErrorKind::ConnectionRefused {
                        ModbusError::ConnectionRefused
                    } else {
                        ModbusError::ConnectionReset
                    };
                    self.finish(index, Err(error));
                    return;
                }
            }
        }
    }

    fn read_responses(&mut self, ci: usize) {
        loop {
            match self.clients[ci].rx {
                RxPhase::Header => {
                    let client = &mut self.clients[ci];
                    if client.conn.available() < mbap::MBAP_LEN {
                        return;
                    }
                    let mut raw = [0u8; mbap::MBAP_LEN];
                    if client.conn.read(&mut raw).unwrap_or(0) < mbap::MBAP_LEN {
                        return;
                    }
                    let header = MbapHeader::decode(&raw);
                    trace!(
                        slave = client.config.slave,
                        transaction = header.transaction_id,
                        length = header.length,
                        "rx header"
                    );

                    let entry = if client.config.all_at_once {
                        client.sent.take_by_transaction(header.transaction_id)
                    } else {
                        client.sent.take_oldest()
                    };
                    let Some(entry) = entry else {
                        // Nothing outstanding under that id; skip the body
                        // to get back in sync.
                        debug!(
                            transaction = header.transaction_id,
                            "response matches no outstanding request"
                        );
                        client.rx = RxPhase::Discard {
                            remaining: header.remaining(),
                        };
                        continue;
                    };

                    if !client.config.all_at_once
                        && entry.transaction_id != header.transaction_id
                    {
                        let expected = entry.transaction_id;
                        drain_connection(client.conn.as_mut());
                        self.finish(
                            entry.adu,
                            Err(ModbusError::MbapTransactionId {
                                expected,
                                actual: header.transaction_id,
                            }),
                        );
                        continue;
                    }
                    if header.protocol_id != mbap::PROTOCOL_ID {
                        drain_connection(client.conn.as_mut());
                        self.finish(
                            entry.adu,
                            Err(ModbusError::MbapProtocolId {
                                actual: header.protocol_id,
                            }),
                        );
                        continue;
                    }
                    if header.unit_id != client.config.slave {
                        let expected = client.config.slave;
                        drain_connection(client.conn.as_mut());
                        self.finish(
                            entry.adu,
                            Err(ModbusError::MbapUnitId {
                                expected,
                                actual: header.unit_id,
                            }),
                        );
                        continue;
                    }
                    let remaining = header.remaining();
                    if remaining == 0 || remaining > PDU_SIZE_MAX {
                        drain_connection(client.conn.as_mut());
                        self.finish(entry.adu, Err(ModbusError::InvalidByteLength));
                        continue;
                    }
                    client.rx = RxPhase::Body {
                        adu: entry.adu,
                        remaining,
                    };
                }
                RxPhase::Body { adu, remaining } => {
                    {
                        let client = &mut self.clients[ci];
                        if client.conn.available() < remaining {
                            return;
                        }
                        let mut raw = [0u8; PDU_SIZE_MAX];
                        if client.conn.read(&mut raw[..remaining]).unwrap_or(0) < remaining {
                            return;
                        }
                        client.rx = RxPhase::Header;
                        self.pool.get_mut(adu).pdu.set_rx(&raw[..remaining]);
                    }
                    let result = self.pool.get_mut(adu).pdu.validate_response();
                    self.finish(adu, result);
                }
                RxPhase::Discard { remaining } => {
                    let client = &mut self.clients[ci];
                    let available = client.conn.available();
                    if available == 0 {
                        return;
                    }
                    let mut left = remaining.min(available);
                    let mut consumed = 0;
                    let mut sink = [0u8; PDU_SIZE_MAX];
                    while left > 0 {
                        let take = left.min(sink.len());
                        let n = client.conn.read(&mut sink[..take]).unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        consumed += n;
                        left -= n;
                    }
                    let remaining = remaining - consumed;
                    client.rx = if remaining == 0 {
                        RxPhase::Header
                    } else {
                        RxPhase::Discard { remaining }
                    };
                    if remaining > 0 {
                        return;
                    }
                }
            }
        }
    }

    fn expire_sent(&mut self, ci: usize, now_ms: u64) {
        let timeout = self.config.response_timeout_ms;
        while let Some(entry) = self.clients[ci].sent.take_expired(now_ms, timeout) {
            self.metrics.timeouts += 1;
            warn!(
                slave = self.clients[ci].config.slave,
                transaction = entry.transaction_id,
                "response timeout"
            );
            self.finish(entry.adu, Err(ModbusError::ResponseTimeout));
        }
    }

    /// Delivers the callback, advances the rotation and recycles the slot.
    fn finish(&mut self, index: usize, result: crate::Result<()>) {
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
                let now_us = self.clock.now_us();
                {
                    let adu = self.pool.get_mut(index);
                    adu.slave = next;
                    adu.queued_at_us = now_us;
                    adu.delay_us = delay_us;
                    adu.pdu.clear_rx();
                }
                match self.client_index(next) {
                    None => self.fail_released(index, ModbusError::NoClientForSlave),
                    Some(ci) => {
                        if self.clients[ci].queue.push(index).is_err() {
                            self.fail_released(index, ModbusError::QueueFull);
                        }
                    }
                }
            }
        }
    }

    fn fail_released(&mut self, index: usize, error: ModbusError) {
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
}

impl<C> Channel<C> for TcpMaster<C> {
    fn issue(
        &mut self,
        function: FunctionCode,
        target: Target,
        callback: Callback<C>,
        build: &mut dyn FnMut(&mut Pdu) -> crate::Result<()>,
    ) {
        let now_us = self.clock.now_us();
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
        if first == slave::BROADCAST {
            // Broadcast is a serial-only notion.
            self.complete_unqueued(first, function, callback, ModbusError::InvalidSlave);
            return;
        }
        if function.serial_only() {
            self.complete_unqueued(first, function, callback, ModbusError::NotSupported);
            return;
        }
        let Some(ci) = self.client_index(first) else {
            self.complete_unqueued(first, function, callback, ModbusError::NoClientForSlave);
            return;
        };
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
            adu.queued_at_us = now_us;
            adu.delay_us = 0;
            adu.pdu.clear();
        }
        if let Err(e) = build(&mut self.pool.get_mut(index).pdu) {
            self.fail_released(index, e);
            return;
        }
        if let Err(e) = self.clients[ci].queue.push(index) {
            self.fail_released(index, e);
            return;
        }
        self.metrics.requests_total += 1;
    }

    fn tick(&mut self) {
        let now_ms = self.clock.now_ms();
        for ci in 0..self.clients.len() {
            self.maintain_connection(ci, now_ms);
            self.drain_queue(ci, now_ms);
            self.read_responses(ci);
            self.expire_sent(ci, now_ms);
        }
    }

    fn metrics(&self) -> &MasterMetrics {
        &self.metrics
    }
}

fn drain_connection(conn: &mut dyn Connection) {
    let mut sink = [0u8; 256];
    while conn.available() > 0 {
        if conn.read(&mut sink).unwrap_or(0) == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::super::Requests;
    use super::*;
    use crate::transport::testing::ManualClock;

    #[derive(Default)]
    struct MockState {
        connected: bool,
        refuse_connect: bool,
        connect_attempts: usize,
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct MockConnection(Rc<RefCell<MockState>>);

    impl MockConnection {
        fn push_rx(&self, bytes: &[u8]) {
            self.0.borrow_mut().rx.extend(bytes.iter().copied());
        }

        fn tx(&self) -> Vec<u8> {
            self.0.borrow().tx.clone()
        }

        fn clear_tx(&self) {
            self.0.borrow_mut().tx.clear();
        }

        fn attempts(&self) -> usize {
            self.0.borrow().connect_attempts
        }

        fn refuse(&self, refuse: bool) {
            self.0.borrow_mut().refuse_connect = refuse;
        }

        fn drop_connection(&self) {
            self.0.borrow_mut().connected = false;
        }
    }

    impl Connection for MockConnection {
        fn connect(&mut self) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            state.connect_attempts += 1;
            if state.refuse_connect {
                Err(io::ErrorKind::ConnectionRefused.into())
            } else {
                state.connected = true;
                Ok(())
            }
        }

        fn is_connected(&self) -> bool {
            self.0.borrow().connected
        }

        fn available(&mut self) -> usize {
            self.0.borrow().rx.len()
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.0.borrow_mut();
            let mut n = 0;
            while n < buf.len() {
                match state.rx.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            if !state.connected {
                return Err(io::ErrorKind::NotConnected.into());
            }
            state.tx.extend_from_slice(buf);
            Ok(())
        }

        fn close(&mut self) {
            self.0.borrow_mut().connected = false;
        }
    }

    #[derive(Debug, PartialEq)]
    struct Event {
        slave: u8,
        function: u8,
        result: crate::Result<()>,
        word0: Option<u16>,
    }

    fn record(events: &mut Vec<Event>, response: Response<'_>) {
        events.push(Event {
            slave: response.slave(),
            function: response.function(),
            result: response.result(),
            word0: response.value::<u16>(0),
        });
    }

    type TestMaster = TcpMaster<Vec<Event>>;

    fn master_with(config: TcpConfig) -> (TestMaster, ManualClock) {
        let clock = ManualClock::new();
        let master = TcpMaster::with_clock(config, Vec::new(), Box::new(clock.clone()))
            .expect("valid config");
        (master, clock)
    }

    fn add_mock(master: &mut TestMaster, station: u8, all_at_once: bool) -> MockConnection {
        let conn = MockConnection::default();
        master
            .add_client_with(
                TcpClientConfig {
                    slave: station,
                    all_at_once,
                    ..Default::default()
                },
                Box::new(conn.clone()),
            )
            .expect("register");
        conn
    }

    /// Transaction id bytes of frame `i` in a capture of 12-byte frames.
    fn tid_bytes(tx: &[u8], i: usize) -> [u8; 2] {
        [tx[i * 12], tx[i * 12 + 1]]
    }

    fn response(tid: [u8; 2], unit: u8, pdu: &[u8]) -> Vec<u8> {
        let mut out = vec![tid[0], tid[1], 0x00, 0x00];
        out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        out.push(unit);
        out.extend_from_slice(pdu);
        out
    }

    #[test]
    fn test_read_holding_round_trip() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0x0000, 1, record);
        master.tick();

        let tx = conn.tx();
        assert_eq!(tx.len(), 12);
        // MBAP: protocol id 0, length 6, unit 1, then the PDU.
        assert_eq!(&tx[2..7], [0x00, 0x00, 0x00, 0x06, 0x01]);
        assert_eq!(&tx[7..], [0x03, 0x00, 0x00, 0x00, 0x01]);

        conn.push_rx(&response(tid_bytes(&tx, 0), 1, &[0x03, 0x02, 0x12, 0x34]));
        master.tick();

        assert_eq!(
            master.context().as_slice(),
            [Event {
                slave: 1,
                function: 0x03,
                result: Ok(()),
                word0: Some(0x1234),
            }]
        );
        assert_eq!(master.adus_in_use(), 0);
    }

    #[test]
    fn test_pipelined_out_of_order_responses() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, true);

        for addr in 0..3u16 {
            master.read_holding_registers(1u8, addr, 1, record);
        }
        master.tick();
        let tx = conn.tx();
        assert_eq!(tx.len(), 36);

        // Respond out of order: second, first, third.
        for (i, value) in [(1usize, 0x0102u16), (0, 0x0101), (2, 0x0103)] {
            conn.push_rx(&response(
                tid_bytes(&tx, i),
                1,
                &[0x03, 0x02, (value >> 8) as u8, value as u8],
            ));
        }
        master.tick();

        // Callbacks fire in arrival order, each bound to its own request.
        let words: Vec<Option<u16>> = master.context().iter().map(|e| e.word0).collect();
        assert_eq!(words, [Some(0x0102), Some(0x0101), Some(0x0103)]);
        assert_eq!(master.adus_in_use(), 0);
    }

    #[test]
    fn test_single_in_flight_serializes() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0, 1, record);
        master.read_holding_registers(1u8, 1, 1, record);
        master.tick();
        assert_eq!(conn.tx().len(), 12);

        let tx = conn.tx();
        conn.push_rx(&response(tid_bytes(&tx, 0), 1, &[0x03, 0x02, 0x00, 0x01]));
        master.tick();
        assert_eq!(master.context().len(), 1);
        // The freed slot is used on the following tick.
        master.tick();
        assert_eq!(conn.tx().len(), 24);
    }

    #[test]
    fn test_unknown_transaction_discarded() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, true);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        let tx = conn.tx();
        let tid = tid_bytes(&tx, 0);

        // A response under a foreign transaction id is dropped silently.
        let foreign = [tid[0] ^ 0xFF, tid[1]];
        conn.push_rx(&response(foreign, 1, &[0x03, 0x02, 0x00, 0x63]));
        master.tick();
        assert!(master.context().is_empty());

        // The real response still lands.
        conn.push_rx(&response(tid, 1, &[0x03, 0x02, 0x00, 0x2A]));
        master.tick();
        assert_eq!(master.context().len(), 1);
        assert_eq!(master.context()[0].word0, Some(0x2A));
    }

    #[test]
    fn test_transaction_mismatch_single_mode() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        let tid = tid_bytes(&conn.tx(), 0);
        conn.push_rx(&response([tid[0] ^ 0xFF, tid[1]], 1, &[0x03, 0x02, 0x00, 0x2A]));
        master.tick();

        assert_eq!(master.context().len(), 1);
        assert!(matches!(
            master.context()[0].result,
            Err(ModbusError::MbapTransactionId { .. })
        ));
    }

    #[test]
    fn test_mbap_protocol_id_validated() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        let tid = tid_bytes(&conn.tx(), 0);
        let mut bad = response(tid, 1, &[0x03, 0x02, 0x00, 0x2A]);
        bad[3] = 0x01; // protocol id 1
        conn.push_rx(&bad);
        master.tick();

        assert_eq!(
            master.context()[0].result,
            Err(ModbusError::MbapProtocolId { actual: 1 })
        );
    }

    #[test]
    fn test_mbap_unit_id_validated() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        let tid = tid_bytes(&conn.tx(), 0);
        conn.push_rx(&response(tid, 2, &[0x03, 0x02, 0x00, 0x2A]));
        master.tick();

        assert_eq!(
            master.context()[0].result,
            Err(ModbusError::MbapUnitId {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn test_response_timeout() {
        let (mut master, clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        assert_eq!(conn.tx().len(), 12);

        clock.advance_ms(999);
        master.tick();
        assert!(master.context().is_empty());

        clock.advance_ms(1);
        master.tick();
        assert_eq!(
            master.context()[0].result,
            Err(ModbusError::ResponseTimeout)
        );
        assert_eq!(master.metrics().timeouts, 1);
        assert_eq!(master.adus_in_use(), 0);
    }

    #[test]
    fn test_reconnect_interval_is_honored() {
        let (mut master, clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);
        conn.refuse(true);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        assert_eq!(conn.attempts(), 1);
        master.tick();
        assert_eq!(conn.attempts(), 1);

        clock.advance_ms(999);
        master.tick();
        assert_eq!(conn.attempts(), 1);

        clock.advance_ms(1);
        master.tick();
        assert_eq!(conn.attempts(), 2);

        // Once the endpoint accepts, the queued request goes out.
        conn.refuse(false);
        clock.advance_ms(1000);
        master.tick();
        assert_eq!(conn.tx().len(), 12);
    }

    #[test]
    fn test_connection_drop_fails_half_read_response() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        let tid = tid_bytes(&conn.tx(), 0);

        // Header arrives, then the peer drops before the body.
        let full = response(tid, 1, &[0x03, 0x02, 0x00, 0x2A]);
        conn.push_rx(&full[..7]);
        master.tick();
        assert!(master.context().is_empty());

        conn.drop_connection();
        master.tick();
        assert_eq!(
            master.context()[0].result,
            Err(ModbusError::ConnectionReset)
        );
        assert_eq!(master.adus_in_use(), 0);
    }

    #[test]
    fn test_no_client_for_slave() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        add_mock(&mut master, 1, false);

        master.read_holding_registers(9u8, 0, 1, record);
        assert_eq!(
            master.context()[0].result,
            Err(ModbusError::NoClientForSlave)
        );
    }

    #[test]
    fn test_broadcast_rejected() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        add_mock(&mut master, 1, false);

        master.write_single_coil(0u8, 5, true, record);
        assert_eq!(master.context()[0].result, Err(ModbusError::InvalidSlave));
    }

    #[test]
    fn test_serial_only_function_rejected() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        add_mock(&mut master, 1, false);

        master.read_exception_status(1u8, record);
        assert_eq!(master.context()[0].result, Err(ModbusError::NotSupported));
    }

    #[test]
    fn test_rotation_across_clients() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn1 = add_mock(&mut master, 1, false);
        let conn2 = add_mock(&mut master, 2, false);

        let mut set = crate::scheduler::SlaveSet::new();
        set.insert(1).expect("valid");
        set.insert(2).expect("valid");
        master.read_holding_registers(set, 0, 1, record);

        master.tick();
        assert_eq!(conn1.tx().len(), 12);
        assert_eq!(conn2.tx().len(), 0);

        let tid = tid_bytes(&conn1.tx(), 0);
        conn1.push_rx(&response(tid, 1, &[0x03, 0x02, 0x00, 0x01]));
        master.tick();
        assert_eq!(master.context().len(), 1);
        // The rotation moved the same ADU over to station 2's client.
        master.tick();
        assert_eq!(conn2.tx().len(), 12);

        let tid = tid_bytes(&conn2.tx(), 0);
        conn2.push_rx(&response(tid, 2, &[0x03, 0x02, 0x00, 0x02]));
        master.tick();

        assert_eq!(master.context().len(), 2);
        assert_eq!(master.context()[1].slave, 2);
        assert_eq!(master.adus_in_use(), 0);
    }

    #[test]
    fn test_window_limits_pipelined_sends() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = MockConnection::default();
        master
            .add_client_with(
                TcpClientConfig {
                    slave: 1,
                    all_at_once: true,
                    window_size: 2,
                    ..Default::default()
                },
                Box::new(conn.clone()),
            )
            .expect("register");

        for addr in 0..3u16 {
            master.read_holding_registers(1u8, addr, 1, record);
        }
        master.tick();
        assert_eq!(conn.tx().len(), 24);

        let tx = conn.tx();
        conn.push_rx(&response(tid_bytes(&tx, 0), 1, &[0x03, 0x02, 0x00, 0x01]));
        master.tick();
        master.tick();
        assert_eq!(conn.tx().len(), 36);
    }

    #[test]
    fn test_client_limit() {
        let (mut master, _clock) = master_with(TcpConfig {
            client_count: 1,
            ..Default::default()
        });
        add_mock(&mut master, 1, false);
        let conn = MockConnection::default();
        assert!(master
            .add_client_with(TcpClientConfig::default(), Box::new(conn.clone()))
            .is_err());
    }

    #[test]
    fn test_reset_restores_fresh_state() {
        let (mut master, _clock) = master_with(TcpConfig::default());
        let conn = add_mock(&mut master, 1, false);

        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        assert_eq!(master.adus_in_use(), 1);

        master.reset();
        assert_eq!(master.adus_in_use(), 0);
        assert_eq!(master.pending_for(1), Some(0));
        assert_eq!(master.metrics(), &MasterMetrics::default());
        assert!(!conn.0.borrow().connected);

        // New requests work as on a fresh engine.
        conn.clear_tx();
        master.read_holding_registers(1u8, 0, 1, record);
        master.tick();
        assert_eq!(conn.tx().len(), 12);
    }
}
