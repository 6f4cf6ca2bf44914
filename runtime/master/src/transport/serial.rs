//! Serial port adapter (requires the `serial` feature).

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::warn;

use super::ByteStream;
use crate::config::{RtuConfig, RtuDataBits, RtuParity, RtuStopBits};

/// [`ByteStream`] over an OS serial port.
///
/// When `rts_direction` is set the RTS line drives an RS-485 transceiver:
/// asserted for the duration of a transmission, released after the flush.
pub struct SerialStream {
    port: Box<dyn SerialPort>,
    rts_direction: bool,
}

impl SerialStream {
    /// Opens `path` with the line parameters of `config`.
    pub fn open(path: &str, config: &RtuConfig) -> serialport::Result<Self> {
        let port = serialport::new(path, config.baud)
            .data_bits(match config.data_bits {
                RtuDataBits::Seven => serialport::DataBits::Seven,
                RtuDataBits::Eight => serialport::DataBits::Eight,
            })
            .parity(match config.parity {
                RtuParity::None => serialport::Parity::None,
                RtuParity::Odd => serialport::Parity::Odd,
                RtuParity::Even => serialport::Parity::Even,
            })
            .stop_bits(match config.stop_bits {
                RtuStopBits::One => serialport::StopBits::One,
                RtuStopBits::Two => serialport::StopBits::Two,
            })
            .timeout(Duration::from_millis(0))
            .open()?;
        Ok(Self {
            port,
            rts_direction: false,
        })
    }

    /// Drives an RS-485 transceiver's direction from the RTS line.
    pub fn with_rts_direction(mut self) -> Self {
        self.rts_direction = true;
        self
    }
}

impl ByteStream for SerialStream {
    fn available(&mut self) -> usize {
        self.port.bytes_to_read().unwrap_or(0) as usize
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.port.read(buf).unwrap_or(0)
    }

    fn write_all(&mut self, buf: &[u8]) {
        if let Err(e) = self.port.write_all(buf) {
            warn!(error = %e, "serial write failed");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.port.flush() {
            warn!(error = %e, "serial flush failed");
        }
    }

    fn begin_transmit(&mut self) {
        if self.rts_direction {
            if let Err(e) = self.port.write_request_to_send(true) {
                warn!(error = %e, "rts assert failed");
            }
        }
    }

    fn end_transmit(&mut self) {
        if self.rts_direction {
            if let Err(e) = self.port.write_request_to_send(false) {
                warn!(error = %e, "rts release failed");
            }
        }
    }
}
