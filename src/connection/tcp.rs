//! Raw SCPI socket transport.
//!
//! LAN-capable source/measure units accept newline-terminated SCPI on a plain
//! TCP socket (port 5025 on Keithley instruments). Replies are read up to the
//! next `\n` or until the query timeout elapses.

use super::Connection;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Default SCPI raw-socket port.
pub const SCPI_PORT: u16 = 5025;

/// SCPI over a TCP socket.
pub struct TcpConnection {
    resource: String,
    stream: Option<BufReader<TcpStream>>,
    line_terminator: String,
}

impl TcpConnection {
    /// Connect to `address` (`host` or `host:port`), giving up after `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, SCPI_PORT)
        };

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| TransportError::Timeout {
                command: format!("connect {}", target),
                timeout,
            })?
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", target, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", target, e)))?;

        debug!(resource = %target, "TCP connection established");
        Ok(Self {
            resource: target,
            stream: Some(BufReader::new(stream)),
            line_terminator: "\n".to_string(),
        })
    }

    /// Set the string appended to every outgoing command.
    pub fn with_line_terminator(mut self, terminator: &str) -> Self {
        self.line_terminator = terminator.to_string();
        self
    }

    fn stream(&mut self) -> Result<&mut BufReader<TcpStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    async fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        let line = format!("{}{}", command, self.line_terminator);
        let resource = self.resource.clone();
        let stream = self.stream()?.get_mut();
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", resource, e)))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", resource, e)))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        self.write_line(command).await?;
        debug!(resource = %self.resource, command, "sent");
        Ok(())
    }

    async fn query(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.write_line(command).await?;

        let resource = self.resource.clone();
        let reader = self.stream()?;
        let mut raw = Vec::new();
        let read = tokio::time::timeout(timeout, reader.read_until(b'\n', &mut raw))
            .await
            .map_err(|_| TransportError::Timeout {
                command: command.to_string(),
                timeout,
            })?
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", resource, e)))?;

        if read == 0 {
            return Err(TransportError::Unreachable(format!(
                "{}: connection closed by peer",
                resource
            )));
        }

        // Undecodable bytes are left for the reply parser to reject.
        let reply = String::from_utf8_lossy(&raw).trim().to_string();
        debug!(resource = %resource, command, reply = %reply, "query");
        Ok(reply)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
            debug!(resource = %self.resource, "TCP connection closed");
        }
        Ok(())
    }
}
