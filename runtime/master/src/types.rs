//! Common types for the master runtime.

use serde::{Deserialize, Serialize};

// =============================================================================
// Slave addressing
// =============================================================================

/// Slave id constants and range checks.
///
/// Valid station addresses are 0–247, where 0 is the serial broadcast
/// address. 248–255 are reserved; the top of that range is used for the
/// iteration sentinels.
pub mod slave {
    /// Serial broadcast address; no response is expected.
    pub const BROADCAST: u8 = 0;
    /// Highest assignable station address.
    pub const MAX: u8 = 247;
    /// No slave.
    pub const NULL: u8 = 0xFD;
    /// Iteration exhausted.
    pub const EOF: u8 = 0xFE;
    /// Iteration not yet started.
    pub const BOF: u8 = 0xFF;

    /// Returns whether `id` is an assignable station address (broadcast included).
    pub fn is_valid(id: u8) -> bool {
        id <= MAX
    }
}

// =============================================================================
// Function codes
// =============================================================================

/// Supported MODBUS function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read coils (FC 01)
    ReadCoils = 0x01,
    /// Read discrete inputs (FC 02)
    ReadDiscreteInputs = 0x02,
    /// Read holding registers (FC 03)
    ReadHoldingRegisters = 0x03,
    /// Read input registers (FC 04)
    ReadInputRegisters = 0x04,
    /// Write single coil (FC 05)
    WriteSingleCoil = 0x05,
    /// Write single register (FC 06)
    WriteSingleRegister = 0x06,
    /// Read exception status (FC 07, serial only)
    ReadExceptionStatus = 0x07,
    /// Diagnostics (FC 08)
    Diagnostics = 0x08,
    /// Write multiple coils (FC 15)
    WriteMultipleCoils = 0x0F,
    /// Write multiple registers (FC 16)
    WriteMultipleRegisters = 0x10,
    /// Mask write register (FC 22)
    MaskWriteRegister = 0x16,
    /// Read/write multiple registers (FC 23)
    ReadWriteMultipleRegisters = 0x17,
}

impl FunctionCode {
    /// Decodes a raw function code byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x07 => Some(Self::ReadExceptionStatus),
            0x08 => Some(Self::Diagnostics),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x16 => Some(Self::MaskWriteRegister),
            0x17 => Some(Self::ReadWriteMultipleRegisters),
            _ => None,
        }
    }

    /// Raw wire value.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns whether the code may be addressed to the broadcast id.
    ///
    /// Only write-class codes are broadcast-capable; reads and diagnostics
    /// require an addressable slave to answer.
    pub fn broadcast_capable(self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
                | Self::MaskWriteRegister
        )
    }

    /// Returns whether the code is defined for serial transports only.
    pub fn serial_only(self) -> bool {
        matches!(self, Self::ReadExceptionStatus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slave_range() {
        assert!(slave::is_valid(0));
        assert!(slave::is_valid(247));
        assert!(!slave::is_valid(248));
        assert!(!slave::is_valid(slave::EOF));
    }

    #[test]
    fn test_function_code_round_trip() {
        for raw in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x0F, 0x10, 0x16, 0x17] {
            let code = FunctionCode::from_u8(raw).expect("known code");
            assert_eq!(code.code(), raw);
        }
        assert_eq!(FunctionCode::from_u8(0x09), None);
        assert_eq!(FunctionCode::from_u8(0x2B), None);
    }

    #[test]
    fn test_broadcast_capability() {
        assert!(FunctionCode::WriteSingleCoil.broadcast_capable());
        assert!(FunctionCode::WriteMultipleRegisters.broadcast_capable());
        assert!(FunctionCode::MaskWriteRegister.broadcast_capable());
        assert!(!FunctionCode::ReadCoils.broadcast_capable());
        assert!(!FunctionCode::ReadExceptionStatus.broadcast_capable());
        assert!(!FunctionCode::Diagnostics.broadcast_capable());
    }
}
