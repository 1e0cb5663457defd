//! RS-232 transport.
//!
//! Older benchtop units (2400/2410) are commonly wired over RS-232. The
//! `serialport` crate is blocking, so every exchange runs on
//! `spawn_blocking` with the port behind a `std::sync::Mutex`. Replies are
//! read byte-wise until the terminator or the deadline.
//!
//! Without the `instrument_serial` feature the type still exists, but
//! `open` always fails.

use super::Connection;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use std::sync::{Arc, Mutex, PoisonError};
#[cfg(feature = "instrument_serial")]
use std::time::Instant;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Per-read poll timeout on the underlying port.
#[cfg(feature = "instrument_serial")]
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// SCPI over a serial port.
pub struct SerialConnection {
    resource: String,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn serialport::SerialPort>>>>,
    #[cfg(feature = "instrument_serial")]
    terminator: u8,
}

#[cfg(feature = "instrument_serial")]
impl SerialConnection {
    /// Open `port_name` at `baud_rate`, 8N1, no flow control.
    pub async fn open(port_name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(POLL_TIMEOUT)
                .open()
                .map_err(|e| TransportError::Unreachable(format!("{}: {}", name, e)))
        })
        .await
        .map_err(|e| TransportError::Unreachable(format!("serial open task failed: {}", e)))??;

        debug!(resource = port_name, baud_rate, "serial port opened");
        Ok(Self {
            resource: port_name.to_string(),
            port: Some(Arc::new(Mutex::new(port))),
            terminator: b'\n',
        })
    }

    fn port(&self) -> Result<Arc<Mutex<Box<dyn serialport::SerialPort>>>, TransportError> {
        self.port.clone().ok_or(TransportError::Closed)
    }

    async fn exchange(
        &self,
        command: &str,
        reply_timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        let port = self.port()?;
        let resource = self.resource.clone();
        let line = format!("{}\n", command);
        let command = command.to_string();
        let terminator = self.terminator;

        tokio::task::spawn_blocking(move || {
            let mut port = port.lock().unwrap_or_else(PoisonError::into_inner);
            let io_err = |e: std::io::Error| TransportError::Unreachable(format!("{}: {}", resource, e));

            port.write_all(line.as_bytes()).map_err(io_err)?;
            port.flush().map_err(io_err)?;

            let Some(timeout) = reply_timeout else {
                return Ok(String::new());
            };

            let deadline = Instant::now() + timeout;
            let mut reply = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout { command, timeout });
                }
                match port.read(&mut byte) {
                    Ok(0) => continue,
                    Ok(_) if byte[0] == terminator => break,
                    Ok(_) => reply.push(byte[0]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(io_err(e)),
                }
            }
            Ok(String::from_utf8_lossy(&reply).trim().to_string())
        })
        .await
        .map_err(|e| TransportError::Unreachable(format!("serial I/O task failed: {}", e)))?
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl SerialConnection {
    /// Serial support is compiled out; always fails.
    pub async fn open(port_name: &str, _baud_rate: u32) -> Result<Self, TransportError> {
        Err(TransportError::Unreachable(format!(
            "{}: serial support not enabled. Rebuild with --features instrument_serial",
            port_name
        )))
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Connection for SerialConnection {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        self.exchange(command, None).await?;
        debug!(resource = %self.resource, command, "sent");
        Ok(())
    }

    async fn query(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        let reply = self.exchange(command, Some(timeout)).await?;
        debug!(resource = %self.resource, command, reply = %reply, "query");
        Ok(reply)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!(resource = %self.resource, "serial port closed");
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Connection for SerialConnection {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn is_open(&self) -> bool {
        false
    }

    async fn send(&mut self, _command: &str) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }

    async fn query(&mut self, _command: &str, _timeout: Duration) -> Result<String, TransportError> {
        Err(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "instrument_serial"))]
    #[tokio::test]
    async fn test_open_without_feature_fails() {
        let err = SerialConnection::open("/dev/ttyUSB0", 9600)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("instrument_serial"));
    }

    #[cfg(feature = "instrument_serial")]
    #[tokio::test]
    async fn test_open_missing_port_is_unreachable() {
        let result = SerialConnection::open("/dev/does-not-exist-smu", 9600).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
