//! Serial transport for the SAS link.
//!
//! SAS marks the first byte of every message with a 9th "wakeup" bit. On an
//! 8N1-style port this is realized with parity: the first byte of a transmit
//! goes out under mark parity, the remainder under space parity. The receive
//! side ignores parity entirely; the host is the only talker that needs the
//! marker. No driver 9th-bit emulation is assumed.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};

use crate::error::{Error, Result};

/// The poll engine's view of the wire. Implemented by [`SerialTransport`]
/// and by in-memory fixtures in tests.
///
/// A `Link` is also a [`Read`] so the frame decoder can pull response bytes
/// straight off it; reads honor the transport's timeouts.
pub trait Link: Read + Send {
    /// Transmits one complete frame, first byte carrying the wakeup marker.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Closes and reopens the underlying device.
    fn reopen(&mut self) -> Result<()>;

    /// Whether the device is currently usable.
    fn is_open(&self) -> bool;
}

pub struct SerialTransport {
    port: Option<TTYPort>,
    path: String,
    baudrate: u32,
    inter_byte_timeout: Duration,
    response_timeout: Duration,
    // The first byte after a send waits the full response timeout; the rest
    // of the frame only gets the inter-byte window.
    awaiting_first_byte: bool,
}

impl SerialTransport {
    /// Opens the device exclusively at 8 data bits, 1 stop bit.
    pub fn open(
        path: &str,
        baudrate: u32,
        inter_byte_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        let mut transport = Self {
            port: None,
            path: path.to_owned(),
            baudrate,
            inter_byte_timeout,
            response_timeout,
            awaiting_first_byte: false,
        };
        transport.reopen()?;
        Ok(transport)
    }

    fn port_mut(&mut self) -> Result<&mut TTYPort> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::DeviceGone("serial port closed".into()))
    }

    // Drops the handle and reports the device as gone.
    fn close_on(&mut self, err: io::Error) -> Error {
        self.port = None;
        Error::DeviceGone(format!("{}: {err}", self.path))
    }
}

// Writes one frame with the wakeup parity dance. Serial-port configuration
// failures and plain write failures are distinguished so the caller can tell
// a vanished device from a driver refusal.
fn write_frame(port: &mut TTYPort, first: u8, rest: &[u8]) -> std::result::Result<(), WriteError> {
    // One frame in flight: anything still buffered is a stale response.
    port.clear(ClearBuffer::Input).map_err(WriteError::Serial)?;

    port.set_parity(Parity::Mark).map_err(WriteError::Serial)?;
    port.write_all(&[first]).map_err(WriteError::Io)?;
    port.flush().map_err(WriteError::Io)?;

    port.set_parity(Parity::Space).map_err(WriteError::Serial)?;
    if !rest.is_empty() {
        port.write_all(rest).map_err(WriteError::Io)?;
        port.flush().map_err(WriteError::Io)?;
    }

    Ok(())
}

enum WriteError {
    Serial(serialport::Error),
    Io(io::Error),
}

impl Link for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let Some((&first, rest)) = bytes.split_first() else {
            return Ok(());
        };

        let outcome = write_frame(self.port_mut()?, first, rest);

        match outcome {
            Ok(()) => {
                self.awaiting_first_byte = true;
                Ok(())
            }
            Err(WriteError::Serial(err)) => Err(err.into()),
            Err(WriteError::Io(err)) => Err(self.close_on(err)),
        }
    }

    fn reopen(&mut self) -> Result<()> {
        self.port = None;

        let mut port = serialport::new(self.path.as_str(), self.baudrate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::Space)
            .flow_control(FlowControl::None)
            .timeout(self.inter_byte_timeout)
            .open_native()?;

        port.set_exclusive(true)?;

        self.port = Some(port);
        self.awaiting_first_byte = false;

        log::debug!("opened {} at {} baud", self.path, self.baudrate);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = if self.awaiting_first_byte {
            self.response_timeout
        } else {
            self.inter_byte_timeout
        };

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;

        port.set_timeout(timeout)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let n = port.read(buf)?;
        if n > 0 {
            self.awaiting_first_byte = false;
        }
        Ok(n)
    }
}
