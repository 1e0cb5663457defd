//! Command/response transports to a single instrument.
//!
//! A [`Connection`] is the only thing the rest of the engine knows about the
//! wire: it can send a command, send a query and wait for the terminated
//! reply, and close. There are no implicit retries at this level; callers
//! decide what a failure means.
//!
//! Implementations:
//! - [`TcpConnection`]: raw SCPI socket (always available)
//! - [`SerialConnection`]: RS-232 via `serialport` (feature `instrument_serial`)
//! - [`VisaConnection`]: USB/GPIB via `visa-rs` (feature `instrument_visa`)
//! - [`MockConnection`]: simulated source/measure unit for tests and `--simulate`

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod visa;

pub use mock::{Load, MockConnection};
pub use serial::SerialConnection;
pub use tcp::TcpConnection;
pub use visa::VisaConnection;

use crate::config::{InstrumentSettings, TransportKind};
use crate::error::TransportError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Opaque transport to one instrument.
#[async_trait]
pub trait Connection: Send {
    /// Address this connection was opened on.
    fn resource(&self) -> &str;

    /// Whether `close` has not been called yet.
    fn is_open(&self) -> bool;

    /// Send a command without waiting for a reply.
    async fn send(&mut self, command: &str) -> Result<(), TransportError>;

    /// Send a query and block until the terminated reply arrives or `timeout`
    /// elapses. The returned reply has its terminator stripped.
    async fn query(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Release the transport. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Open the transport described by `settings`.
///
/// With `simulate` set every instrument gets a [`MockConnection`] regardless
/// of its configured transport.
pub async fn open(
    id: &str,
    settings: &InstrumentSettings,
    simulate: bool,
) -> Result<Box<dyn Connection>> {
    let kind = if simulate {
        TransportKind::Mock
    } else {
        settings.transport
    };
    info!(instrument = id, resource = %settings.resource, ?kind, "opening connection");

    let connection: Box<dyn Connection> = match kind {
        TransportKind::Mock => Box::new(MockConnection::new(&settings.resource, settings.model)),
        TransportKind::Tcp => Box::new(
            TcpConnection::connect(&settings.resource, settings.timeout)
                .await
                .with_context(|| format!("Failed to connect to '{}' over TCP", settings.resource))?,
        ),
        TransportKind::Serial => Box::new(
            SerialConnection::open(&settings.resource, settings.baud_rate)
                .await
                .with_context(|| format!("Failed to open serial port '{}'", settings.resource))?,
        ),
        TransportKind::Visa => Box::new(
            VisaConnection::open(&settings.resource)
                .await
                .with_context(|| format!("Failed to open VISA resource '{}'", settings.resource))?,
        ),
    };
    Ok(connection)
}
