//! PDU construction and response validation.
//!
//! A [`Pdu`] owns a transmit buffer, a receive buffer and the
//! expected-response header captured while the request was built. The
//! transport engines frame the transmit buffer (station address + CRC on
//! serial, MBAP on TCP), feed the response PDU back in and call
//! [`Pdu::validate_response`], which checks every echoed field against the
//! request before exposing the payload.

pub mod crc;
pub mod data;
pub mod mbap;

pub use data::{Element, MAX_ELEMENT_SIZE};

use crate::error::ModbusError;
use crate::types::FunctionCode;

const READ_BITS_MAX: u16 = 2000;
const WRITE_BITS_MAX: u16 = 1968;
const READ_REGISTERS_MAX: u16 = 125;
const WRITE_REGISTERS_MAX: u16 = 123;
const READ_WRITE_READ_MAX: u16 = 125;
const READ_WRITE_WRITE_MAX: u16 = 121;

/// Sub-functions accepted for FC 08.
const DIAGNOSTIC_SUB_FUNCTIONS: &[u16] =
    &[0x00, 0x01, 0x02, 0x03, 0x04, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x14];

/// Response shape captured at request-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    /// Function, byte count, data bytes
    Read { byte_count: u8 },
    /// Byte-for-byte echo of the request
    Echo { len: u8 },
    /// Function, address, quantity
    WriteAck,
    /// Function, status byte
    Status,
    /// Function, sub-function, echoed value
    Diagnostic,
}

/// A protocol data unit with its validation context.
#[derive(Debug)]
pub struct Pdu {
    tx: Vec<u8>,
    rx: Vec<u8>,
    capacity: usize,
    expected: Option<Expected>,
    function: u8,
    elem_size: u8,
    elem_count: u16,
    data_start: usize,
    data_len: usize,
}

impl Pdu {
    /// Creates a PDU with both buffers preallocated at `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: Vec::with_capacity(capacity),
            rx: Vec::with_capacity(capacity),
            capacity,
            expected: None,
            function: 0,
            elem_size: 0,
            elem_count: 0,
            data_start: 0,
            data_len: 0,
        }
    }

    /// Clears both buffers and the validation context.
    pub fn clear(&mut self) {
        self.tx.clear();
        self.clear_rx();
        self.expected = None;
        self.function = 0;
        self.elem_size = 0;
        self.elem_count = 0;
    }

    /// Clears the receive side only, keeping the request intact.
    pub fn clear_rx(&mut self) {
        self.rx.clear();
        self.data_start = 0;
        self.data_len = 0;
    }

    /// Request function code.
    pub fn function(&self) -> u8 {
        self.function
    }

    /// The request PDU bytes (function code + body).
    pub fn tx_pdu(&self) -> &[u8] {
        &self.tx
    }

    /// Expected response PDU length in bytes.
    pub fn expected_len(&self) -> usize {
        match self.expected {
            Some(Expected::Read { byte_count }) => 2 + byte_count as usize,
            Some(Expected::Echo { len }) => len as usize,
            Some(Expected::WriteAck) => 5,
            Some(Expected::Status) => 2,
            Some(Expected::Diagnostic) => 5,
            None => 0,
        }
    }

    /// Stores a received response PDU for validation.
    pub fn set_rx(&mut self, pdu: &[u8]) {
        self.clear_rx();
        self.rx.extend_from_slice(pdu);
    }

    // =========================================================================
    // Request builders
    // =========================================================================

    /// FC 01/02: read `count` coils or discrete inputs starting at `addr`.
    pub fn build_read_bits(
        &mut self,
        function: FunctionCode,
        addr: u16,
        count: u16,
    ) -> crate::Result<()> {
        if count == 0 {
            return Err(ModbusError::TooFewData);
        }
        if count > READ_BITS_MAX {
            return Err(ModbusError::TooManyData);
        }
        check_address_span(addr, count)?;
        let byte_count = ((count + 7) / 8) as u8;
        self.check_capacity(5, 2 + byte_count as usize)?;
        self.start(function);
        self.push_u16(addr);
        self.push_u16(count);
        self.expected = Some(Expected::Read { byte_count });
        self.elem_count = count;
        Ok(())
    }

    /// FC 03/04: read `elem_count` elements of `elem_size` bytes at `addr`.
    pub fn build_read_registers(
        &mut self,
        function: FunctionCode,
        addr: u16,
        elem_count: u16,
        elem_size: usize,
    ) -> crate::Result<()> {
        if elem_size == 0 || elem_size > MAX_ELEMENT_SIZE {
            return Err(ModbusError::InvalidSourceSize);
        }
        if elem_count == 0 {
            return Err(ModbusError::TooFewData);
        }
        let packed = data::packed_len(elem_count as usize, elem_size);
        let regs = (packed / 2) as u16;
        if regs > READ_REGISTERS_MAX {
            return Err(ModbusError::TooManyData);
        }
        check_address_span(addr, regs)?;
        self.check_capacity(5, 2 + packed)?;
        self.start(function);
        self.push_u16(addr);
        self.push_u16(regs);
        self.expected = Some(Expected::Read {
            byte_count: packed as u8,
        });
        self.elem_size = elem_size as u8;
        self.elem_count = elem_count;
        Ok(())
    }

    /// FC 05/06: write a single coil or register.
    pub fn build_write_single(
        &mut self,
        function: FunctionCode,
        addr: u16,
        value: u16,
    ) -> crate::Result<()> {
        self.check_capacity(5, 5)?;
        self.start(function);
        self.push_u16(addr);
        self.push_u16(value);
        self.expected = Some(Expected::Echo { len: 5 });
        Ok(())
    }

    /// FC 07: read the slave's exception status byte.
    pub fn build_read_exception_status(&mut self) -> crate::Result<()> {
        self.check_capacity(1, 2)?;
        self.start(FunctionCode::ReadExceptionStatus);
        self.expected = Some(Expected::Status);
        Ok(())
    }

    /// FC 08: diagnostics with an echoed 16-bit value.
    pub fn build_diagnostics(&mut self, sub_function: u16, value: u16) -> crate::Result<()> {
        if !DIAGNOSTIC_SUB_FUNCTIONS.contains(&sub_function) {
            return Err(ModbusError::InvalidSubFunction);
        }
        self.check_capacity(5, 5)?;
        self.start(FunctionCode::Diagnostics);
        self.push_u16(sub_function);
        self.push_u16(value);
        self.expected = Some(Expected::Diagnostic);
        Ok(())
    }

    /// FC 15: write `bits`, packed LSB-first, starting at `addr`.
    pub fn build_write_bits(&mut self, addr: u16, bits: &[bool]) -> crate::Result<()> {
        if bits.is_empty() {
            return Err(ModbusError::TooFewData);
        }
        if bits.len() > WRITE_BITS_MAX as usize {
            return Err(ModbusError::TooManyData);
        }
        check_address_span(addr, bits.len() as u16)?;
        let byte_count = (bits.len() + 7) / 8;
        self.check_capacity(6 + byte_count, 5)?;
        self.start(FunctionCode::WriteMultipleCoils);
        self.push_u16(addr);
        self.push_u16(bits.len() as u16);
        self.tx.push(byte_count as u8);
        for chunk in bits.chunks(8) {
            let mut byte = 0u8;
            for (k, bit) in chunk.iter().enumerate() {
                if *bit {
                    byte |= 1 << k;
                }
            }
            self.tx.push(byte);
        }
        self.expected = Some(Expected::WriteAck);
        Ok(())
    }

    /// FC 16: write elements of `elem_size` bytes starting at `addr`.
    pub fn build_write_registers_raw(
        &mut self,
        addr: u16,
        src: &[u8],
        elem_size: usize,
    ) -> crate::Result<()> {
        if src.is_empty() {
            return Err(ModbusError::TooFewData);
        }
        let count = data::check_source(src, elem_size)?;
        let packed = data::packed_len(count, elem_size);
        let regs = (packed / 2) as u16;
        if regs > WRITE_REGISTERS_MAX {
            return Err(ModbusError::TooManyData);
        }
        check_address_span(addr, regs)?;
        self.check_capacity(6 + packed, 5)?;
        self.start(FunctionCode::WriteMultipleRegisters);
        self.push_u16(addr);
        self.push_u16(regs);
        self.tx.push(packed as u8);
        for elem in src.chunks_exact(elem_size) {
            data::pack_element(&mut self.tx, elem);
        }
        self.expected = Some(Expected::WriteAck);
        Ok(())
    }

    /// FC 16, typed front end over [`build_write_registers_raw`].
    ///
    /// [`build_write_registers_raw`]: Pdu::build_write_registers_raw
    pub fn build_write_registers<T: Element>(
        &mut self,
        addr: u16,
        values: &[T],
    ) -> crate::Result<()> {
        let mut raw = [0u8; 2 * WRITE_REGISTERS_MAX as usize];
        let total = values.len() * T::SIZE;
        if total > raw.len() {
            return Err(ModbusError::TooManyData);
        }
        for (i, value) in values.iter().enumerate() {
            value.write_ne(&mut raw[i * T::SIZE..]);
        }
        self.build_write_registers_raw(addr, &raw[..total], T::SIZE)
    }

    /// FC 22: masked register update (`(current & and) | (or & !and)`).
    pub fn build_mask_write(&mut self, addr: u16, and_mask: u16, or_mask: u16) -> crate::Result<()> {
        self.check_capacity(7, 7)?;
        self.start(FunctionCode::MaskWriteRegister);
        self.push_u16(addr);
        self.push_u16(and_mask);
        self.push_u16(or_mask);
        self.expected = Some(Expected::Echo { len: 7 });
        Ok(())
    }

    /// FC 23: combined register write and read in one transaction.
    pub fn build_read_write_registers(
        &mut self,
        read_addr: u16,
        read_count: u16,
        write_addr: u16,
        src: &[u8],
        elem_size: usize,
    ) -> crate::Result<()> {
        if read_count == 0 || src.is_empty() {
            return Err(ModbusError::TooFewData);
        }
        if read_count > READ_WRITE_READ_MAX {
            return Err(ModbusError::TooManyData);
        }
        let count = data::check_source(src, elem_size)?;
        let packed = data::packed_len(count, elem_size);
        let write_regs = (packed / 2) as u16;
        if write_regs > READ_WRITE_WRITE_MAX {
            return Err(ModbusError::TooManyData);
        }
        check_address_span(read_addr, read_count)?;
        check_address_span(write_addr, write_regs)?;
        self.check_capacity(10 + packed, 2 + 2 * read_count as usize)?;
        self.start(FunctionCode::ReadWriteMultipleRegisters);
        self.push_u16(read_addr);
        self.push_u16(read_count);
        self.push_u16(write_addr);
        self.push_u16(write_regs);
        self.tx.push(packed as u8);
        for elem in src.chunks_exact(elem_size) {
            data::pack_element(&mut self.tx, elem);
        }
        self.expected = Some(Expected::Read {
            byte_count: (2 * read_count) as u8,
        });
        self.elem_size = 2;
        self.elem_count = read_count;
        Ok(())
    }

    // =========================================================================
    // Response validation
    // =========================================================================

    /// Validates the stored response against the request.
    ///
    /// On success the data region is exposed through [`Pdu::data`]; register
    /// payloads are converted in place back into the element layout the
    /// request was built with.
    pub fn validate_response(&mut self) -> crate::Result<()> {
        let expected = self.expected.ok_or(ModbusError::InvalidArgument)?;
        if self.rx.is_empty() {
            return Err(ModbusError::TooFewData);
        }
        let function = self.rx[0];
        if function == self.function | 0x80 {
            if self.rx.len() < 2 {
                return Err(ModbusError::TooFewData);
            }
            return Err(ModbusError::exception(self.rx[1]));
        }
        if function != self.function {
            return Err(ModbusError::InvalidFunction {
                expected: self.function,
                actual: function,
            });
        }
        match expected {
            Expected::Read { byte_count } => {
                if self.rx.len() < 2 {
                    return Err(ModbusError::TooFewData);
                }
                if self.rx[1] != byte_count || self.rx.len() != 2 + byte_count as usize {
                    return Err(ModbusError::InvalidByteLength);
                }
                self.data_start = 2;
                self.data_len = byte_count as usize;
                if self.elem_size > 0 {
                    let count = self.elem_count as usize;
                    let elem_size = self.elem_size as usize;
                    self.data_len =
                        data::unpack_in_place(&mut self.rx[2..], count, elem_size);
                }
            }
            Expected::Echo { len } => {
                if self.rx.len() != len as usize {
                    return Err(ModbusError::InvalidByteLength);
                }
                if self.rx[1..3] != self.tx[1..3] {
                    return Err(ModbusError::InvalidAddress);
                }
                if self.rx[3..] != self.tx[3..len as usize] {
                    return Err(ModbusError::InvalidData);
                }
            }
            Expected::WriteAck => {
                if self.rx.len() != 5 {
                    return Err(ModbusError::InvalidByteLength);
                }
                if self.rx[1..3] != self.tx[1..3] {
                    return Err(ModbusError::InvalidAddress);
                }
                if self.rx[3..5] != self.tx[3..5] {
                    return Err(ModbusError::InvalidDataQuantity);
                }
            }
            Expected::Status => {
                if self.rx.len() != 2 {
                    return Err(ModbusError::InvalidByteLength);
                }
                self.data_start = 1;
                self.data_len = 1;
            }
            Expected::Diagnostic => {
                if self.rx.len() != 5 {
                    return Err(ModbusError::InvalidByteLength);
                }
                if self.rx[1..3] != self.tx[1..3] {
                    return Err(ModbusError::InvalidSubFunction);
                }
                self.data_start = 3;
                self.data_len = 2;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Payload access
    // =========================================================================

    /// The validated data region, in the element layout of the request.
    pub fn data(&self) -> &[u8] {
        &self.rx[self.data_start..self.data_start + self.data_len]
    }

    /// Reads element `index` of the data region.
    pub fn value<T: Element>(&self, index: usize) -> Option<T> {
        let data = self.data();
        let end = (index + 1) * T::SIZE;
        if end > data.len() {
            return None;
        }
        Some(T::read_ne(&data[index * T::SIZE..end]))
    }

    /// Reads bit `index` of a coil or discrete-input payload.
    pub fn bit(&self, index: usize) -> Option<bool> {
        if self.elem_size == 0 && self.elem_count > 0 && index >= self.elem_count as usize {
            return None;
        }
        let data = self.data();
        let byte = data.get(index / 8)?;
        Some(byte & (1 << (index % 8)) != 0)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn start(&mut self, function: FunctionCode) {
        self.tx.clear();
        self.clear_rx();
        self.elem_size = 0;
        self.elem_count = 0;
        self.function = function.code();
        self.tx.push(self.function);
    }

    fn push_u16(&mut self, value: u16) {
        self.tx.extend_from_slice(&value.to_be_bytes());
    }

    fn check_capacity(&self, tx_len: usize, rx_len: usize) -> crate::Result<()> {
        if tx_len > self.capacity || rx_len > self.capacity {
            return Err(ModbusError::BufferTooSmall);
        }
        Ok(())
    }
}

fn check_address_span(addr: u16, count: u16) -> crate::Result<()> {
    if addr as u32 + count as u32 - 1 > 0xFFFF {
        return Err(ModbusError::InvalidAddress);
    }
    Ok(())
}
