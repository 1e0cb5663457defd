//! VISA transport for USB-TMC and GPIB resources.
//!
//! Supports resource strings like:
//! - `USB0::0x05E6::0x2461::04123456::INSTR`
//! - `GPIB0::24::INSTR`
//!
//! `visa-rs` is blocking, so I/O runs on `spawn_blocking`. The resource
//! manager is kept alive for as long as the session, since dropping it closes
//! every session it opened.

use super::Connection;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::io::{BufRead, BufReader, Write};
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex, PoisonError};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Lock timeout passed to the resource manager when opening a session.
#[cfg(feature = "instrument_visa")]
const OPEN_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(feature = "instrument_visa")]
struct Session {
    _rm: DefaultRM,
    instr: Instrument,
}

/// SCPI over a VISA session.
pub struct VisaConnection {
    resource: String,
    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<Session>>>,
}

#[cfg(feature = "instrument_visa")]
impl VisaConnection {
    /// Open a VISA session to `resource`.
    pub async fn open(resource: &str) -> Result<Self, TransportError> {
        let name = resource.to_string();
        let session = tokio::task::spawn_blocking(move || {
            let unreachable = |e: visa_rs::Error| TransportError::Unreachable(format!("{}: {}", name, e));
            let rm = DefaultRM::new().map_err(unreachable)?;
            let address = std::ffi::CString::new(name.as_str())
                .map_err(|e| TransportError::Unreachable(format!("{}: {}", name, e)))?;
            let instr = rm
                .open(&address.into(), AccessMode::NO_LOCK, OPEN_TIMEOUT)
                .map_err(unreachable)?;
            Ok::<_, TransportError>(Session { _rm: rm, instr })
        })
        .await
        .map_err(|e| TransportError::Unreachable(format!("VISA open task failed: {}", e)))??;

        debug!(resource, "VISA session opened");
        Ok(Self {
            resource: resource.to_string(),
            session: Some(Arc::new(Mutex::new(session))),
        })
    }

    async fn exchange(
        &self,
        command: &str,
        reply_timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        let session = self.session.clone().ok_or(TransportError::Closed)?;
        let resource = self.resource.clone();
        let line = format!("{}\n", command);
        let expects_reply = reply_timeout.is_some();

        let task = tokio::task::spawn_blocking(move || {
            let session = session.lock().unwrap_or_else(PoisonError::into_inner);
            let io_err = |e: std::io::Error| TransportError::Unreachable(format!("{}: {}", resource, e));

            (&session.instr).write_all(line.as_bytes()).map_err(io_err)?;
            if !expects_reply {
                return Ok(String::new());
            }
            let mut raw = Vec::new();
            BufReader::new(&session.instr)
                .read_until(b'\n', &mut raw)
                .map_err(io_err)?;
            Ok(String::from_utf8_lossy(&raw).trim().to_string())
        });

        let joined = match reply_timeout {
            Some(timeout) => tokio::time::timeout(timeout, task)
                .await
                .map_err(|_| TransportError::Timeout {
                    command: command.to_string(),
                    timeout,
                })?,
            None => task.await,
        };
        joined.map_err(|e| TransportError::Unreachable(format!("VISA I/O task failed: {}", e)))?
    }
}

#[cfg(not(feature = "instrument_visa"))]
impl VisaConnection {
    /// VISA support is compiled out; always fails.
    pub async fn open(resource: &str) -> Result<Self, TransportError> {
        Err(TransportError::Unreachable(format!(
            "{}: VISA support not enabled. Rebuild with --features instrument_visa",
            resource
        )))
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Connection for VisaConnection {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
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
        if self.session.take().is_some() {
            debug!(resource = %self.resource, "VISA session closed");
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl Connection for VisaConnection {
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

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_open_without_feature_fails() {
        let result = VisaConnection::open("USB0::0x05E6::0x2461::04123456::INSTR").await;
        match result {
            Err(TransportError::Unreachable(msg)) => assert!(msg.contains("instrument_visa")),
            _ => panic!("expected Unreachable"),
        }
    }
}
