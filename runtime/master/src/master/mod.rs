//! Master engines and the request surface.
//!
//! A transport engine implements [`Channel`]: it hands out pooled ADUs,
//! queues them, and makes progress from a periodic [`Channel::tick`]. The
//! typed request surface is the [`Requests`] extension trait, whose provided
//! methods build a PDU and submit it; every call is non-blocking and every
//! outcome, error or data, arrives through the request's callback.

pub mod adu;
pub mod rtu;
pub mod tcp;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::{Element, Pdu};
use crate::scheduler::SlaveSet;
use crate::types::{slave, FunctionCode};

use adu::Adu;

pub use rtu::RtuMaster;
pub use tcp::TcpMaster;

/// Completion callback: a plain function pointer dispatched with the
/// master's user context. Two words, copied into the ADU slot.
pub type Callback<C> = fn(&mut C, Response<'_>);

// =============================================================================
// Responses
// =============================================================================

/// View of a completed request handed to its callback.
pub struct Response<'a> {
    slave: u8,
    function: u8,
    result: crate::Result<()>,
    pdu: Option<&'a Pdu>,
}

impl<'a> Response<'a> {
    pub(crate) fn new(
        slave: u8,
        function: u8,
        result: crate::Result<()>,
        pdu: Option<&'a Pdu>,
    ) -> Self {
        Self {
            slave,
            function,
            result,
            pdu,
        }
    }

    /// Station the request was addressed to.
    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Function code of the request.
    pub fn function(&self) -> u8 {
        self.function
    }

    /// Outcome of the request.
    pub fn result(&self) -> crate::Result<()> {
        self.result
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<crate::ModbusError> {
        self.result.err()
    }

    /// Validated payload, in the element layout of the request.
    pub fn data(&self) -> &[u8] {
        match (&self.result, self.pdu) {
            (Ok(()), Some(pdu)) => pdu.data(),
            _ => &[],
        }
    }

    /// Reads element `index` of the payload.
    pub fn value<T: Element>(&self, index: usize) -> Option<T> {
        match (&self.result, self.pdu) {
            (Ok(()), Some(pdu)) => pdu.value(index),
            _ => None,
        }
    }

    /// Reads bit `index` of a coil or discrete-input payload.
    pub fn bit(&self, index: usize) -> Option<bool> {
        match (&self.result, self.pdu) {
            (Ok(()), Some(pdu)) => pdu.bit(index),
            _ => None,
        }
    }
}

// =============================================================================
// Targets
// =============================================================================

/// Where a request goes: one station, or a rotation over a slave set.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Slave(u8),
    Set(SlaveSet),
}

impl From<u8> for Target {
    fn from(id: u8) -> Self {
        Self::Slave(id)
    }
}

impl From<SlaveSet> for Target {
    fn from(set: SlaveSet) -> Self {
        Self::Set(set)
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Counters maintained by every engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterMetrics {
    /// Requests accepted into a pending queue
    pub requests_total: u64,
    /// Callbacks delivered with success
    pub responses_success: u64,
    /// Callbacks delivered with an error
    pub responses_failed: u64,
    /// Of the failures, response timeouts
    pub timeouts: u64,
}

// =============================================================================
// Channel capability
// =============================================================================

/// A transport engine: pooled ADUs, a pending queue, tick-driven progress.
pub trait Channel<C> {
    /// Acquires an ADU, builds the request into it and enqueues it.
    ///
    /// Never blocks. On any failure (broadcast misuse, pool exhaustion,
    /// builder error, queue capacity) the callback fires synchronously with
    /// the error and nothing is written to the wire.
    fn issue(
        &mut self,
        function: FunctionCode,
        target: Target,
        callback: Callback<C>,
        build: &mut dyn FnMut(&mut Pdu) -> crate::Result<()>,
    );

    /// Advances the engine's state machine against the monotonic clock.
    fn tick(&mut self);

    /// Engine counters.
    fn metrics(&self) -> &MasterMetrics;
}

/// Typed request surface over any [`Channel`].
pub trait Requests<C>: Channel<C> {
    /// FC 01: read `count` coils starting at `addr`.
    fn read_coils(&mut self, target: impl Into<Target>, addr: u16, count: u16, callback: Callback<C>) {
        self.issue(FunctionCode::ReadCoils, target.into(), callback, &mut |pdu| {
            pdu.build_read_bits(FunctionCode::ReadCoils, addr, count)
        });
    }

    /// FC 02: read `count` discrete inputs starting at `addr`.
    fn read_discrete_inputs(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        count: u16,
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::ReadDiscreteInputs,
            target.into(),
            callback,
            &mut |pdu| pdu.build_read_bits(FunctionCode::ReadDiscreteInputs, addr, count),
        );
    }

    /// FC 03: read `count` holding registers starting at `addr`.
    fn read_holding_registers(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        count: u16,
        callback: Callback<C>,
    ) {
        self.read_holding::<u16>(target, addr, count, callback);
    }

    /// FC 03, typed: read `count` elements of `T` starting at `addr`.
    fn read_holding<T: Element>(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        count: u16,
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::ReadHoldingRegisters,
            target.into(),
            callback,
            &mut |pdu| {
                pdu.build_read_registers(FunctionCode::ReadHoldingRegisters, addr, count, T::SIZE)
            },
        );
    }

    /// FC 04: read `count` input registers starting at `addr`.
    fn read_input_registers(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        count: u16,
        callback: Callback<C>,
    ) {
        self.read_input::<u16>(target, addr, count, callback);
    }

    /// FC 04, typed: read `count` elements of `T` starting at `addr`.
    fn read_input<T: Element>(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        count: u16,
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::ReadInputRegisters,
            target.into(),
            callback,
            &mut |pdu| {
                pdu.build_read_registers(FunctionCode::ReadInputRegisters, addr, count, T::SIZE)
            },
        );
    }

    /// FC 05: write a single coil.
    fn write_single_coil(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        on: bool,
        callback: Callback<C>,
    ) {
        let value = if on { 0xFF00 } else { 0x0000 };
        self.issue(
            FunctionCode::WriteSingleCoil,
            target.into(),
            callback,
            &mut |pdu| pdu.build_write_single(FunctionCode::WriteSingleCoil, addr, value),
        );
    }

    /// FC 06: write a single holding register.
    fn write_single_register(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        value: u16,
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::WriteSingleRegister,
            target.into(),
            callback,
            &mut |pdu| pdu.build_write_single(FunctionCode::WriteSingleRegister, addr, value),
        );
    }

    /// FC 07: read the exception status byte (serial only).
    fn read_exception_status(&mut self, target: impl Into<Target>, callback: Callback<C>) {
        self.issue(
            FunctionCode::ReadExceptionStatus,
            target.into(),
            callback,
            &mut |pdu| pdu.build_read_exception_status(),
        );
    }

    /// FC 08: diagnostics with an echoed value.
    fn diagnostics(
        &mut self,
        target: impl Into<Target>,
        sub_function: u16,
        value: u16,
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::Diagnostics,
            target.into(),
            callback,
            &mut |pdu| pdu.build_diagnostics(sub_function, value),
        );
    }

    /// FC 15: write `bits` starting at `addr`.
    fn write_multiple_coils(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        bits: &[bool],
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::WriteMultipleCoils,
            target.into(),
            callback,
            &mut |pdu| pdu.build_write_bits(addr, bits),
        );
    }

    /// FC 16: write `values` starting at `addr`.
    fn write_multiple_registers(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        values: &[u16],
        callback: Callback<C>,
    ) {
        self.write_registers::<u16>(target, addr, values, callback);
    }

    /// FC 16, typed: write elements of `T` starting at `addr`.
    fn write_registers<T: Element>(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        values: &[T],
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::WriteMultipleRegisters,
            target.into(),
            callback,
            &mut |pdu| pdu.build_write_registers(addr, values),
        );
    }

    /// FC 16, untyped: write raw elements of `elem_size` bytes.
    fn write_registers_raw(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        data: &[u8],
        elem_size: usize,
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::WriteMultipleRegisters,
            target.into(),
            callback,
            &mut |pdu| pdu.build_write_registers_raw(addr, data, elem_size),
        );
    }

    /// FC 22: masked register update.
    fn mask_write_register(
        &mut self,
        target: impl Into<Target>,
        addr: u16,
        and_mask: u16,
        or_mask: u16,
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::MaskWriteRegister,
            target.into(),
            callback,
            &mut |pdu| pdu.build_mask_write(addr, and_mask, or_mask),
        );
    }

    /// FC 23: write `values` and read `read_count` registers in one
    /// transaction.
    fn read_write_registers(
        &mut self,
        target: impl Into<Target>,
        read_addr: u16,
        read_count: u16,
        write_addr: u16,
        values: &[u16],
        callback: Callback<C>,
    ) {
        self.issue(
            FunctionCode::ReadWriteMultipleRegisters,
            target.into(),
            callback,
            &mut |pdu| {
                let mut raw = [0u8; 2 * 121];
                if values.is_empty() {
                    return Err(crate::ModbusError::TooFewData);
                }
                if values.len() * 2 > raw.len() {
                    return Err(crate::ModbusError::TooManyData);
                }
                for (i, value) in values.iter().enumerate() {
                    value.write_ne(&mut raw[i * 2..]);
                }
                pdu.build_read_write_registers(
                    read_addr,
                    read_count,
                    write_addr,
                    &raw[..values.len() * 2],
                    2,
                )
            },
        );
    }
}

impl<C, M: Channel<C>> Requests<C> for M {}

// =============================================================================
// Rotation
// =============================================================================

/// What happens to an ADU once its callback has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// No further stations; return the slot to the pool.
    Release,
    /// Re-enqueue for the next station after `delay_us`.
    Requeue { slave: u8, delay_us: u64 },
}

/// Advances an ADU's slave-set rotation.
///
/// Wrapping to a station at or below the previous one means a cycle has
/// completed, which selects the repeat-cycle delay; otherwise the
/// inter-slave delay applies.
pub(crate) fn resolve_rotation<C>(adu: &mut Adu<C>) -> Disposition {
    let previous = adu.slave;
    let Some(set) = adu.slaves.as_mut() else {
        return Disposition::Release;
    };
    let next = set.next();
    if next == slave::EOF {
        return Disposition::Release;
    }
    let delay_ms = if next <= previous {
        set.repeat_delay_ms().max(0) as u64
    } else {
        set.delay_ms() as u64
    };
    Disposition::Requeue {
        slave: next,
        delay_us: delay_ms * 1_000,
    }
}

// =============================================================================
// Tick driver
// =============================================================================

/// Ticks `master` every `period` until `stop` holds `true`.
///
/// Convenience driver for hosts running a tokio event loop; bare-metal and
/// custom-loop hosts call [`Channel::tick`] themselves.
pub async fn drive_until<C, M: Channel<C>>(
    master: &mut M,
    period: Duration,
    stop: &mut watch::Receiver<bool>,
) {
    if *stop.borrow() {
        return;
    }
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => master.tick(),
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}
