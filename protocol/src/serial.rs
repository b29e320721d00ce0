//! Native asynchronous serial port support.
//!
//! Uses the [`serial2-tokio`](https://crates.io/crates/serial2-tokio) crate.

use crate::port::{Port, PortOpener};
use async_trait::async_trait;
use embedded_io_adapters::tokio_1::FromTokio;
use embedded_io_async::{ErrorType, Read, Write};
use log::debug;
use serial2_tokio::{CharSize, FlowControl, Parity, Settings, StopBits};
use std::{
    io,
    path::{Path, PathBuf},
};

type Inner = FromTokio<serial2_tokio::SerialPort>;

/// Serial port implementing [`Port`].
///
/// Remembers its path and baud rate, so it can be reopened after being closed.
pub struct SerialPort {
    path: PathBuf,
    baud_rate: u32,
    inner: Option<Inner>,
}

impl SerialPort {
    /// Returns the path of the serial device.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&mut self) -> io::Result<&mut Inner> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

/// Opens a native serial port at the given path.
///
/// The port is configured for raw 8N1 transfers and any stale data is discarded.
/// Returns a [`SerialPort`] that can be passed to any
/// [`Communicator`](crate::Communicator) method.
pub fn open(path: impl AsRef<Path>, baud_rate: u32) -> io::Result<SerialPort> {
    let path = path.as_ref().to_path_buf();
    let inner = open_native(&path, baud_rate)?;

    Ok(SerialPort {
        path,
        baud_rate,
        inner: Some(inner),
    })
}

fn open_native(path: &Path, baud_rate: u32) -> io::Result<Inner> {
    debug!("Opening {} at {baud_rate} baud", path.display());

    let port = serial2_tokio::SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud_rate)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::One);
        settings.set_parity(Parity::None);
        settings.set_flow_control(FlowControl::None);

        Ok(settings)
    })?;

    port.discard_buffers()?;

    Ok(FromTokio::new(port))
}

impl ErrorType for SerialPort {
    type Error = io::Error;
}

impl Read for SerialPort {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.connection()?.read(buf).await
    }
}

impl Write for SerialPort {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.connection()?.write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.connection()?.flush().await
    }
}

impl Port for SerialPort {
    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn open(&mut self) -> Result<(), Self::Error> {
        if self.inner.is_none() {
            self.inner = Some(open_native(&self.path, self.baud_rate)?);
        }

        Ok(())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if self.inner.take().is_some() {
            debug!("Closed {}", self.path.display());
        }

        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), Self::Error> {
        self.connection()?.inner().discard_input_buffer()
    }
}

/// [`PortOpener`] creating native serial ports.
#[derive(Clone, Debug)]
pub struct SerialOpener {
    path: PathBuf,
    baud_rate: u32,
}

impl SerialOpener {
    /// Constructs an opener for the serial device at the given path.
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

#[async_trait(?Send)]
impl PortOpener for SerialOpener {
    type Port = SerialPort;

    async fn open(&mut self) -> Result<SerialPort, io::Error> {
        open(&self.path, self.baud_rate)
    }
}
