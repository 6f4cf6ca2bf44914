//! Error types for the master runtime.

use std::fmt;

use thiserror::Error;

/// Result type alias for master operations.
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Exception codes carried by a slave's exception response.
///
/// An exception response echoes the request function code with bit 7 set and
/// carries exactly one of these codes in its single data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Function code not supported by the slave
    IllegalFunction = 0x01,
    /// Register or coil address outside the slave's map
    IllegalDataAddress = 0x02,
    /// Request value rejected by the slave
    IllegalDataValue = 0x03,
    /// Unrecoverable error while servicing the request
    SlaveDeviceError = 0x04,
    /// Long-running request accepted, poll for completion
    Acknowledge = 0x05,
    /// Slave busy with a previous long-running request
    SlaveDeviceBusy = 0x06,
    /// Program function rejected
    NegativeAcknowledge = 0x07,
    /// Extended-memory parity check failed
    MemoryParityError = 0x08,
    /// Gateway could not allocate a path to the target
    GatewayPathUnavailable = 0x0A,
    /// Gateway target did not respond
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Decodes the data byte of an exception response.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::SlaveDeviceError),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::SlaveDeviceBusy),
            0x07 => Some(Self::NegativeAcknowledge),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Raw wire value.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::SlaveDeviceError => "slave device error",
            Self::Acknowledge => "acknowledge",
            Self::SlaveDeviceBusy => "slave device busy",
            Self::NegativeAcknowledge => "negative acknowledge",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetFailed => "gateway target failed",
        };
        write!(f, "{} ({})", name, *self as u8)
    }
}

/// Master error taxonomy.
///
/// Every error is a plain value: it is stored in the ADU that failed and
/// delivered to the caller through the response callback. No error is fatal
/// to an engine; after delivery the engine drains stale input and resumes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusError {
    // =========================================================================
    // Slave exceptions
    // =========================================================================
    /// Exception response from the slave
    #[error("modbus exception: {0}")]
    Exception(ExceptionCode),

    // =========================================================================
    // Connection errors (TCP)
    // =========================================================================
    /// Connection refused by the peer
    #[error("connection refused")]
    ConnectionRefused,

    /// Connection reset while a request was outstanding
    #[error("connection reset by peer")]
    ConnectionReset,

    // =========================================================================
    // Response errors
    // =========================================================================
    /// No response within the configured budget
    #[error("response timeout")]
    ResponseTimeout,

    /// Response carried a slave id other than the one addressed
    #[error("response from unexpected slave")]
    InvalidSlave,

    /// Response function code does not match the request
    #[error("unexpected function code {actual:#04x}, expected {expected:#04x}")]
    InvalidFunction { expected: u8, actual: u8 },

    /// Echoed diagnostic sub-function does not match the request
    #[error("invalid diagnostic sub-function")]
    InvalidSubFunction,

    /// Echoed address does not match the request
    #[error("invalid address")]
    InvalidAddress,

    /// Echoed data does not match the request
    #[error("invalid data")]
    InvalidData,

    /// Echoed quantity does not match the request
    #[error("invalid data quantity")]
    InvalidDataQuantity,

    /// Response byte count differs from the announced or expected length
    #[error("invalid byte length")]
    InvalidByteLength,

    /// Exception response carried an unknown exception code
    #[error("invalid exception code")]
    InvalidExceptionCode,

    /// CRC-16 mismatch on a serial frame
    #[error("crc mismatch: computed {computed:#06x}, received {received:#06x}")]
    Crc { computed: u16, received: u16 },

    /// MBAP transaction id matches no outstanding request
    #[error("mbap transaction id mismatch: expected {expected}, got {actual}")]
    MbapTransactionId { expected: u16, actual: u16 },

    /// MBAP protocol id is not zero
    #[error("mbap protocol id {actual} is not 0")]
    MbapProtocolId { actual: u16 },

    /// MBAP unit id differs from the addressed slave
    #[error("mbap unit id mismatch: expected {expected}, got {actual}")]
    MbapUnitId { expected: u8, actual: u8 },

    // =========================================================================
    // Request errors
    // =========================================================================
    /// Quantity above the limit for the function code
    #[error("too many data")]
    TooManyData,

    /// Zero quantity, or a frame shorter than its own header promises
    #[error("too few data")]
    TooFewData,

    /// Invalid call argument
    #[error("invalid argument")]
    InvalidArgument,

    /// Source slice length is not a multiple of the element size, or the
    /// element is larger than the codec admits
    #[error("invalid source size")]
    InvalidSourceSize,

    /// Operation not available on this transport
    #[error("not supported")]
    NotSupported,

    /// Payload would not fit the configured PDU buffer
    #[error("buffer too small")]
    BufferTooSmall,

    // =========================================================================
    // Capacity errors
    // =========================================================================
    /// Pending queue at capacity
    #[error("queue full")]
    QueueFull,

    /// TCP sent window at capacity
    #[error("sent buffer full")]
    SentBufferFull,

    /// No configured client for the addressed slave
    #[error("no client for slave")]
    NoClientForSlave,

    /// ADU pool exhausted
    #[error("no more free adu")]
    NoFreeAdu,
}

impl ModbusError {
    /// Returns the numeric error code used in telemetry and logs.
    pub fn error_code(&self) -> u16 {
        match self {
            // Connection errors: 1xx
            Self::ConnectionRefused => 102,
            Self::ConnectionReset => 103,

            // Protocol errors: 2xx (exceptions map to 200 + code)
            Self::Exception(code) => 200 + code.code() as u16,
            Self::ResponseTimeout => 220,
            Self::InvalidSlave => 221,
            Self::InvalidFunction { .. } => 222,
            Self::InvalidSubFunction => 223,
            Self::InvalidAddress => 224,
            Self::InvalidData => 225,
            Self::InvalidDataQuantity => 226,
            Self::InvalidByteLength => 227,
            Self::InvalidExceptionCode => 228,
            Self::Crc { .. } => 229,
            Self::MbapTransactionId { .. } => 230,
            Self::MbapProtocolId { .. } => 231,
            Self::MbapUnitId { .. } => 232,

            // Request errors: 3xx
            Self::TooManyData => 300,
            Self::TooFewData => 301,
            Self::InvalidArgument => 302,
            Self::InvalidSourceSize => 303,
            Self::NotSupported => 304,
            Self::BufferTooSmall => 305,

            // Capacity errors: 5xx
            Self::QueueFull => 500,
            Self::SentBufferFull => 501,
            Self::NoClientForSlave => 502,
            Self::NoFreeAdu => 503,
        }
    }

    /// Returns whether retrying the same request can be expected to help.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ResponseTimeout => true,
            Self::ConnectionReset => true,
            Self::Crc { .. } => true,
            Self::QueueFull | Self::SentBufferFull | Self::NoFreeAdu => true,
            Self::Exception(code) => {
                matches!(code, ExceptionCode::Acknowledge | ExceptionCode::SlaveDeviceBusy)
            }
            _ => false,
        }
    }

    /// Creates an exception error from a raw exception code byte.
    pub fn exception(code: u8) -> Self {
        match ExceptionCode::from_code(code) {
            Some(code) => Self::Exception(code),
            None => Self::InvalidExceptionCode,
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Structurally valid input with an out-of-range value
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ModbusError),

    /// Malformed YAML input
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed JSON input
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_round_trip() {
        for raw in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x0A, 0x0B] {
            let code = ExceptionCode::from_code(raw).expect("known code");
            assert_eq!(code.code(), raw);
        }
        assert_eq!(ExceptionCode::from_code(0x09), None);
        assert_eq!(ExceptionCode::from_code(0x0C), None);
        assert_eq!(ExceptionCode::from_code(0x00), None);
    }

    #[test]
    fn test_exception_error_constructor() {
        assert_eq!(
            ModbusError::exception(0x02),
            ModbusError::Exception(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(ModbusError::exception(0x0C), ModbusError::InvalidExceptionCode);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ModbusError::exception(0x02).error_code(), 202);
        assert_eq!(ModbusError::ResponseTimeout.error_code(), 220);
        assert_eq!(ModbusError::QueueFull.error_code(), 500);
    }

    #[test]
    fn test_recoverable() {
        assert!(ModbusError::ResponseTimeout.is_recoverable());
        assert!(ModbusError::Exception(ExceptionCode::SlaveDeviceBusy).is_recoverable());
        assert!(!ModbusError::Exception(ExceptionCode::IllegalFunction).is_recoverable());
        assert!(!ModbusError::NotSupported.is_recoverable());
    }
}
