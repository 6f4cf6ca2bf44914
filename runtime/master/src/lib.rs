//! # modbus-master
//!
//! An asynchronous MODBUS master for RTU and TCP slaves.
//!
//! Requests never block: issuing one takes a preallocated ADU from the
//! engine's pool, builds the PDU, stamps the target station and returns.
//! A periodic tick drives each engine's state machine — framing, timeout
//! accounting, response validation and callback delivery all happen there,
//! against a monotonic clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        MODBUS MASTER                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Layer 4: Request surface                                        │
//! │   • Requests (typed builders over any Channel)                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Layer 3: Engines                                                │
//! │   • RtuMaster (frame-timed serial state machine)                │
//! │   • TcpMaster (per-slave clients, MBAP demultiplexing)          │
//! │   • SlaveSet rotation, ADU pool and queues                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Layer 2: Protocol                                               │
//! │   • PDU builders + response validation                          │
//! │   • CRC-16, MBAP, typed register packing                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Layer 1: Transport contracts                                    │
//! │   • ByteStream, Connection, Clock                               │
//! │   • TcpConnection, SerialStream adapters                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use modbus_master::{
//!     config::{TcpClientConfig, TcpConfig},
//!     master::{drive_until, Requests, TcpMaster},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut master = TcpMaster::new(TcpConfig::default(), Vec::<u16>::new())?;
//!     master.add_client(TcpClientConfig {
//!         slave: 1,
//!         ip_address: "192.168.1.10".parse()?,
//!         ..Default::default()
//!     })?;
//!
//!     // Poll one holding register; the callback runs inside tick().
//!     master.read_holding_registers(1u8, 100, 1, |values, response| {
//!         if let Some(word) = response.value::<u16>(0) {
//!             values.push(word);
//!         }
//!     });
//!
//!     let (_stop, mut stop_rx) = tokio::sync::watch::channel(false);
//!     drive_until(&mut master, Duration::from_millis(1), &mut stop_rx).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature flags
//!
//! - `serial`: OS serial-port adapter for the RTU engine (via `serialport`)
//!
//! ## Scheduling model
//!
//! The core is single-threaded and cooperative. Every wait — inter-frame
//! silence, byte gaps, response budgets, reconnect spacing, rotation
//! delays — is a deadline compared against the clock during a tick, so the
//! host decides when progress happens: a tokio interval, a bare-metal
//! superloop, or [`master::drive_until`]. After initialization the hot path
//! performs no allocation; ADUs, queues and windows are fixed-capacity and
//! recycled in place.

pub mod config;
pub mod error;
pub mod master;
pub mod protocol;
pub mod scheduler;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{RtuConfig, TcpClientConfig, TcpConfig};
pub use error::{ConfigError, ExceptionCode, ModbusError, Result};
pub use master::{Callback, Channel, MasterMetrics, Requests, Response, RtuMaster, Target, TcpMaster};
pub use protocol::{Element, Pdu};
pub use scheduler::SlaveSet;
pub use types::{slave, FunctionCode};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
