//! Configuration types for the RTU and TCP masters.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ModbusError};
use crate::scheduler::SlaveSet;

/// Smallest admissible PDU buffer.
pub const PDU_SIZE_MIN: usize = 8;
/// Largest PDU a MODBUS frame can carry.
pub const PDU_SIZE_MAX: usize = 253;

// =============================================================================
// Serial line parameters
// =============================================================================

/// Parity configuration for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RtuParity {
    #[default]
    None,
    Odd,
    Even,
}

/// Stop bits configuration for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RtuStopBits {
    #[default]
    One,
    Two,
}

/// Data bits configuration for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RtuDataBits {
    Seven,
    #[default]
    Eight,
}

/// Timeout budgets derived from the serial line parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtuTimeouts {
    /// Longest tolerated gap between two bytes of one frame
    pub byte_us: u64,
    /// Silence that delimits one frame from the next
    pub frame_us: u64,
    /// Budget between the end of a transmission and the first response byte
    pub response_us: u64,
}

// =============================================================================
// RTU master configuration
// =============================================================================

/// Configuration for an RTU master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConfig {
    /// Baud rate (e.g. 9600, 19200, 115200)
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Data bits setting
    #[serde(default)]
    pub data_bits: RtuDataBits,

    /// Parity setting
    #[serde(default)]
    pub parity: RtuParity,

    /// Stop bits setting
    #[serde(default)]
    pub stop_bits: RtuStopBits,

    /// Per-ADU buffer capacity in bytes (8–253)
    #[serde(default = "default_pdu_size")]
    pub pdu_size: usize,

    /// ADU pool capacity
    #[serde(default = "default_pool_size")]
    pub adu_pool_size: usize,

    /// Pending queue capacity
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Budget between a transmission and the first response byte
    #[serde(default = "default_rtu_response_timeout")]
    pub response_timeout_ms: u64,

    /// Overrides the derived inter-frame silence
    #[serde(default)]
    pub frame_timeout_us: Option<u64>,

    /// Overrides the derived inter-byte budget
    #[serde(default)]
    pub byte_timeout_us: Option<u64>,

    /// Spacing between consecutive slaves of a rotation
    #[serde(default)]
    pub slave_set_delay_ms: u32,

    /// Spacing between rotation cycles; negative disables repetition
    #[serde(default = "default_repeat_delay")]
    pub slave_set_repeat_delay_ms: i32,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: RtuDataBits::Eight,
            parity: RtuParity::None,
            stop_bits: RtuStopBits::One,
            pdu_size: PDU_SIZE_MAX,
            adu_pool_size: 16,
            queue_size: 16,
            response_timeout_ms: 3,
            frame_timeout_us: None,
            byte_timeout_us: None,
            slave_set_delay_ms: 0,
            slave_set_repeat_delay_ms: -1,
        }
    }
}

impl RtuConfig {
    /// Bits per character on the wire: start + data + parity + stop.
    pub fn bits_per_char(&self) -> u32 {
        1 + match self.data_bits {
            RtuDataBits::Seven => 7,
            RtuDataBits::Eight => 8,
        } + match self.parity {
            RtuParity::None => 0,
            _ => 1,
        } + match self.stop_bits {
            RtuStopBits::One => 1,
            RtuStopBits::Two => 2,
        }
    }

    /// One character time in microseconds.
    pub fn char_time_us(&self) -> u64 {
        (self.bits_per_char() as u64 * 1_000_000) / self.baud as u64
    }

    /// Effective timeout budgets.
    ///
    /// For baud rates up to 19200 the byte and frame budgets are 1.5 and 3.5
    /// character times; above that the fixed high-speed values 750 µs and
    /// 1750 µs apply. Explicit overrides win in both regimes.
    pub fn timeouts(&self) -> RtuTimeouts {
        let (derived_byte, derived_frame) = if self.baud > 19_200 {
            (750, 1_750)
        } else {
            let c = self.char_time_us();
            (c * 3 / 2, c * 7 / 2)
        };
        RtuTimeouts {
            byte_us: self.byte_timeout_us.unwrap_or(derived_byte),
            frame_us: self.frame_timeout_us.unwrap_or(derived_frame),
            response_us: self.response_timeout_ms * 1_000,
        }
    }

    /// Creates an empty slave set carrying this configuration's delays.
    pub fn slave_set(&self) -> SlaveSet {
        SlaveSet::with_delays(self.slave_set_delay_ms, self.slave_set_repeat_delay_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.baud == 0 {
            return Err(ModbusError::InvalidArgument);
        }
        validate_pdu_size(self.pdu_size)?;
        if self.adu_pool_size == 0 || self.queue_size == 0 {
            return Err(ModbusError::InvalidArgument);
        }
        Ok(())
    }

    /// Loads a configuration from YAML and validates it.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from JSON and validates it.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// TCP master configuration
// =============================================================================

/// Configuration for a TCP master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Per-ADU buffer capacity in bytes (8–253)
    #[serde(default = "default_pdu_size")]
    pub pdu_size: usize,

    /// ADU pool capacity, shared by all clients
    #[serde(default = "default_pool_size")]
    pub adu_pool_size: usize,

    /// Per-client pending queue capacity
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Maximum number of concurrently configured slave clients
    #[serde(default = "default_client_count")]
    pub client_count: usize,

    /// Budget between a transmission and the complete response
    #[serde(default = "default_tcp_response_timeout")]
    pub response_timeout_ms: u64,

    /// Spacing between consecutive slaves of a rotation
    #[serde(default)]
    pub slave_set_delay_ms: u32,

    /// Spacing between rotation cycles; negative disables repetition
    #[serde(default = "default_repeat_delay")]
    pub slave_set_repeat_delay_ms: i32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            pdu_size: PDU_SIZE_MAX,
            adu_pool_size: 16,
            queue_size: 16,
            client_count: 4,
            response_timeout_ms: 1000,
            slave_set_delay_ms: 0,
            slave_set_repeat_delay_ms: -1,
        }
    }
}

impl TcpConfig {
    /// Creates an empty slave set carrying this configuration's delays.
    pub fn slave_set(&self) -> SlaveSet {
        SlaveSet::with_delays(self.slave_set_delay_ms, self.slave_set_repeat_delay_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        validate_pdu_size(self.pdu_size)?;
        if self.adu_pool_size == 0 || self.queue_size == 0 || self.client_count == 0 {
            return Err(ModbusError::InvalidArgument);
        }
        Ok(())
    }

    /// Loads a configuration from YAML and validates it.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from JSON and validates it.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }
}

/// Per-slave TCP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpClientConfig {
    /// Station address answered by this endpoint
    #[serde(default = "default_unit_id")]
    pub slave: u8,

    /// Endpoint IP address
    #[serde(default = "default_ip")]
    pub ip_address: Ipv4Addr,

    /// Endpoint port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Automatically reconnect after a drop
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Minimum spacing between reconnect attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Allow multiple outstanding requests, demultiplexed by transaction id
    #[serde(default)]
    pub all_at_once: bool,

    /// Sent-window capacity (outstanding requests in pipelined mode)
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            slave: 1,
            ip_address: Ipv4Addr::new(127, 0, 0, 1),
            port: 502,
            connect_timeout_ms: 5000,
            keep_alive: true,
            reconnect_interval_ms: 1000,
            all_at_once: false,
            window_size: 8,
        }
    }
}

impl TcpClientConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if !crate::types::slave::is_valid(self.slave) || self.slave == crate::types::slave::BROADCAST
        {
            return Err(ModbusError::InvalidArgument);
        }
        if self.window_size == 0 {
            return Err(ModbusError::InvalidArgument);
        }
        Ok(())
    }
}

fn validate_pdu_size(pdu_size: usize) -> crate::Result<()> {
    if !(PDU_SIZE_MIN..=PDU_SIZE_MAX).contains(&pdu_size) {
        return Err(ModbusError::BufferTooSmall);
    }
    Ok(())
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_baud() -> u32 {
    9600
}
fn default_pdu_size() -> usize {
    PDU_SIZE_MAX
}
fn default_pool_size() -> usize {
    16
}
fn default_queue_size() -> usize {
    16
}
fn default_client_count() -> usize {
    4
}
fn default_rtu_response_timeout() -> u64 {
    3
}
fn default_tcp_response_timeout() -> u64 {
    1000
}
fn default_repeat_delay() -> i32 {
    -1
}
fn default_unit_id() -> u8 {
    1
}
fn default_ip() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, 1)
}
fn default_port() -> u16 {
    502
}
fn default_connect_timeout() -> u64 {
    5000
}
fn default_reconnect_interval() -> u64 {
    1000
}
fn default_window_size() -> usize {
    8
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_timeouts_low_speed() {
        let config = RtuConfig {
            baud: 9600,
            ..Default::default()
        };
        // 8N1: 10 bits per character, 1041 µs each.
        assert_eq!(config.bits_per_char(), 10);
        let t = config.timeouts();
        assert_eq!(t.byte_us, 1041 * 3 / 2);
        assert_eq!(t.frame_us, 1041 * 7 / 2);
        assert_eq!(t.response_us, 3_000);
    }

    #[test]
    fn test_derived_timeouts_parity_counts() {
        let config = RtuConfig {
            baud: 19200,
            parity: RtuParity::Even,
            ..Default::default()
        };
        // 8E1: 11 bits per character.
        assert_eq!(config.bits_per_char(), 11);
        let t = config.timeouts();
        let c = 11 * 1_000_000 / 19200;
        assert_eq!(t.byte_us, c * 3 / 2);
        assert_eq!(t.frame_us, c * 7 / 2);
    }

    #[test]
    fn test_derived_timeouts_high_speed() {
        let config = RtuConfig {
            baud: 115200,
            ..Default::default()
        };
        let t = config.timeouts();
        assert_eq!(t.byte_us, 750);
        assert_eq!(t.frame_us, 1750);
    }

    #[test]
    fn test_timeout_overrides() {
        let config = RtuConfig {
            baud: 115200,
            frame_timeout_us: Some(5000),
            byte_timeout_us: Some(2000),
            ..Default::default()
        };
        let t = config.timeouts();
        assert_eq!(t.byte_us, 2000);
        assert_eq!(t.frame_us, 5000);
    }

    #[test]
    fn test_pdu_size_bounds() {
        let mut config = RtuConfig::default();
        config.pdu_size = 7;
        assert!(matches!(config.validate(), Err(ModbusError::BufferTooSmall)));
        config.pdu_size = 254;
        assert!(matches!(config.validate(), Err(ModbusError::BufferTooSmall)));
        config.pdu_size = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let config = RtuConfig::from_yaml_str("baud: 19200\nqueue_size: 4\n").expect("parse");
        assert_eq!(config.baud, 19200);
        assert_eq!(config.queue_size, 4);
        // Unspecified fields take their defaults.
        assert_eq!(config.pdu_size, PDU_SIZE_MAX);
        assert_eq!(config.response_timeout_ms, 3);
    }

    #[test]
    fn test_from_json() {
        let config =
            TcpConfig::from_json_str(r#"{"adu_pool_size": 8, "client_count": 2}"#).expect("parse");
        assert_eq!(config.adu_pool_size, 8);
        assert_eq!(config.client_count, 2);
        assert_eq!(config.response_timeout_ms, 1000);
    }

    #[test]
    fn test_client_config_rejects_broadcast() {
        let config = TcpClientConfig {
            slave: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
