//! Port abstraction and fault recovery for a shared bus.
//!
//! A [`PortManager`] owns one port and every [`Manager`] whose controller
//! is attached to it. It opens the port lazily, splits the time budget of
//! each cycle between the managers, and closes, reopens or recreates the
//! port after transport faults.

use crate::manager::{EventHandler, Manager};
use async_trait::async_trait;
use core::time::Duration;
use embedded_io_async::{ErrorType, Read, Write};
use log::{error, info, warn};
use tokio::time;

/// Byte-oriented, half-duplex transport to one or more controllers.
///
/// Reads must not block indefinitely. A read returning zero bytes means
/// no data is available yet.
pub trait Port: Read + Write {
    /// Returns the line speed used to derive per-byte timeouts.
    fn baud_rate(&self) -> u32;

    /// Returns `true` while the port can transfer data.
    fn is_open(&self) -> bool;

    /// Opens the port again after it was closed.
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Closes the port. Closing a closed port has no effect.
    fn close(&mut self) -> Result<(), Self::Error>;

    /// Drops any bytes received but not read yet.
    fn discard_input(&mut self) -> Result<(), Self::Error>;
}

/// Error type of the port produced by a [`PortOpener`].
pub type PortError<O> = <<O as PortOpener>::Port as ErrorType>::Error;

/// Factory for ports.
///
/// Implemented for closures returning a port, so a plain
/// `|| serial::open(path, baud_rate)` works as an opener.
#[async_trait(?Send)]
pub trait PortOpener {
    /// Type of port produced.
    type Port: Port;

    /// Creates a new, open port.
    async fn open(&mut self) -> Result<Self::Port, PortError<Self>>;
}

#[async_trait(?Send)]
impl<P, F> PortOpener for F
where
    P: Port,
    F: FnMut() -> Result<P, P::Error>,
{
    type Port = P;

    async fn open(&mut self) -> Result<P, P::Error> {
        self()
    }
}

/// Port manager settings.
#[derive(Clone, Debug)]
pub struct Options {
    /// Time to sleep after a transport fault, none to continue immediately.
    pub sleep_interval_on_error: Option<Duration>,
    /// Number of faults on the same port after which it is recreated
    /// instead of reopened, none to always reopen.
    pub reopen_attempts_before_new_port: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sleep_interval_on_error: Some(Duration::from_secs(5)),
            reopen_attempts_before_new_port: Some(2),
        }
    }
}

/// Runs the managers of all controllers sharing one port.
pub struct PortManager<O: PortOpener, H> {
    opener: O,
    port: Option<O::Port>,
    managers: Vec<Manager<H>>,
    options: Options,
    errors_count: u32,
}

impl<O: PortOpener, H: EventHandler> PortManager<O, H> {
    /// Constructs a port manager. The port is opened on first use.
    pub fn new(opener: O, managers: Vec<Manager<H>>, options: Options) -> Self {
        Self {
            opener,
            port: None,
            managers,
            options,
            errors_count: 0,
        }
    }

    /// Returns the managers in the order they are served.
    #[must_use]
    pub fn managers(&self) -> &[Manager<H>] {
        &self.managers
    }

    /// Returns the managers for modification.
    pub fn managers_mut(&mut self) -> &mut [Manager<H>] {
        &mut self.managers
    }

    /// Returns the current port, if one was created.
    #[must_use]
    pub fn port(&self) -> Option<&O::Port> {
        self.port.as_ref()
    }

    /// Returns the current port for modification, if one was created.
    pub fn port_mut(&mut self) -> Option<&mut O::Port> {
        self.port.as_mut()
    }

    /// Runs one communication cycle for every manager.
    ///
    /// The optional time budget is split evenly between the managers.
    ///
    /// A transport fault ends the cycle: the remaining managers are skipped,
    /// the port is closed and the configured sleep interval elapses before
    /// this returns. Faults are logged, never returned.
    pub async fn communicate(&mut self, max_time_to_talk: Option<Duration>) {
        if let Err(err) = self.run_managers(max_time_to_talk).await {
            error!("Communication failed: {err:?}");
            self.recover().await;
        }
    }

    /// Closes the port. The next cycle reopens it.
    pub fn close(&mut self) {
        if let Some(port) = self.port.as_mut().filter(|port| port.is_open()) {
            info!("Closing port");

            if let Err(err) = port.close() {
                warn!("Failed to close port: {err:?}");
            }
        }
    }

    async fn run_managers(
        &mut self,
        max_time_to_talk: Option<Duration>,
    ) -> Result<(), crate::Error<PortError<O>>> {
        let port = match self.port.take() {
            Some(port) => port,
            None => {
                info!("Creating new port");
                self.opener.open().await?
            }
        };
        let port = self.port.insert(port);

        if !port.is_open() {
            info!("Reopening port");
            port.open()?;
        }

        let count = u32::try_from(self.managers.len()).unwrap_or(u32::MAX);
        let budget = max_time_to_talk.filter(|_| count > 0).map(|time| time / count);

        for manager in &mut self.managers {
            manager.communicate(port, budget).await?;
        }

        Ok(())
    }

    async fn recover(&mut self) {
        self.errors_count += 1;
        self.close();

        if self
            .options
            .reopen_attempts_before_new_port
            .is_some_and(|attempts| self.errors_count >= attempts)
        {
            warn!("Port failed {} times, recreating it", self.errors_count);

            self.port = None;
            self.errors_count = 0;
        }

        if let Some(interval) = self.options.sleep_interval_on_error {
            time::sleep(interval).await;
        }
    }
}
