//! Byte-stream transport for line-oriented instrument protocols.
//!
//! Motion controllers on RS-232 / USB-CDC links speak request/response
//! protocols framed by a line terminator. Protocol engines only need four
//! things from the link, captured by the [`Transport`] trait:
//!
//! - write a complete command
//! - read up to a terminator with a deadline
//! - discard late bytes left over from an abandoned exchange
//! - close the link
//!
//! [`SerialTransport`] implements the trait for any tokio stream
//! (`tokio_serial::SerialStream` on hardware, `tokio::io::DuplexStream` in
//! tests), so drivers never depend on the concrete medium.
//!
//! # Example
//!
//! ```rust,ignore
//! use stage_core::serial::{open_serial_async, SerialTransport, Transport};
//! use std::time::Duration;
//!
//! let port = open_serial_async("/dev/ttyUSB0", 115200, "C-867").await?;
//! let mut link = SerialTransport::new(Box::new(port));
//!
//! link.write_all(b"*IDN?\n").await?;
//! let line = link.read_until(b'\n', Duration::from_secs(5)).await?;
//! ```

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Transport Trait
// =============================================================================

/// A single physical request/response channel.
///
/// The link has no multiplexing: callers must complete one exchange before
/// starting the next, otherwise replies interleave and framing is lost.
/// Implementations are not required to be `Sync`; owners serialize access.
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes and flush.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read bytes up to and including `terminator`.
    ///
    /// Returns [`TransportError::Timeout`] if the terminator does not arrive
    /// within `timeout`, and [`TransportError::Closed`] on EOF.
    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Throw away anything that arrives within `window`.
    ///
    /// Returns the number of bytes discarded.
    async fn discard_pending(&mut self, window: Duration) -> usize;

    /// Shut the link down. Further use is undefined.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(bytes).await
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).read_until(terminator, timeout).await
    }

    async fn discard_pending(&mut self, window: Duration) -> usize {
        (**self).discard_pending(window).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

// =============================================================================
// SerialTransport
// =============================================================================

/// [`Transport`] over a buffered async byte stream.
///
/// `BufReader` lets `read_until` accumulate bytes until the terminator is
/// seen, which is how line-delimited ASCII protocols are framed.
pub struct SerialTransport {
    port: BufReader<DynSerial>,
}

impl SerialTransport {
    pub fn new(port: DynSerial) -> Self {
        Self {
            port: BufReader::new(port),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let writer = self.port.get_mut();
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut line = Vec::with_capacity(64);
        let n = tokio::time::timeout(timeout, self.port.read_until(terminator, &mut line))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        // EOF, or EOF in the middle of a line
        if n == 0 || line.last() != Some(&terminator) {
            return Err(TransportError::Closed);
        }
        Ok(line)
    }

    async fn discard_pending(&mut self, window: Duration) -> usize {
        let discarded = drain_serial_buffer(&mut self.port, window).await;
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded stale bytes from link");
        }
        discarded
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.port.get_mut().shutdown().await?;
        Ok(())
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a port until nothing arrives before `window` ends.
///
/// Returns the total number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // window elapsed
        }
    }

    total_discarded
}
