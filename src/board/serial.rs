//! Serial port plumbing.
//!
//! - [`SerialPortIO`]: trait alias for anything a board can be read from
//! - [`DynSerial`]: type-erased boxed port
//! - [`SerialOpener`]: opens real ports through `tokio-serial`
//! - [`available_ports`]: lists ports for the presentation layer
//!
//! Requires the `instrument_serial` feature for real hardware. Without it the
//! opener and the port listing fail with [`CaptureError::SerialFeatureDisabled`].

use super::PortOpener;
use crate::error::{AppResult, CaptureError};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a board connection:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens ports with 8N1 framing and no flow control.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial> {
        use tokio::task::spawn_blocking;
        use tokio_serial::SerialPortBuilderExt;

        let port_path = port.to_string();

        // Opening can block on some USB adapters; keep it off the runtime.
        let stream = spawn_blocking(move || {
            tokio_serial::new(&port_path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| CaptureError::Serial(e.to_string()))
        })
        .await
        .map_err(|e| CaptureError::Serial(format!("open task failed: {e}")))??;

        Ok(Box::new(stream))
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, _port: &str, _baud_rate: u32) -> AppResult<DynSerial> {
        Err(CaptureError::SerialFeatureDisabled)
    }
}

/// Names of the serial ports present on this machine, sorted.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> AppResult<Vec<String>> {
    let mut names: Vec<String> = tokio_serial::available_ports()
        .map_err(|e| CaptureError::Serial(e.to_string()))?
        .into_iter()
        .map(|p| p.port_name)
        .collect();
    names.sort();
    Ok(names)
}

/// Names of the serial ports present on this machine, sorted.
#[cfg(not(feature = "instrument_serial"))]
pub fn available_ports() -> AppResult<Vec<String>> {
    Err(CaptureError::SerialFeatureDisabled)
}
