//! Communicate with VRC-T70 temperature sensor controllers over a serial link.
//!
//! # Overview
//!
//! The `vrc_t70` crate implements the binary protocol spoken by the VRC-T70
//! controller, a device that polls up to 7 trunks of 1-Wire temperature
//! sensors. It offers an asynchronous, port-agnostic API built on
//! [`embedded_io_async`] traits.
//!
//! Depending on your needs, you can:
//!
//! - Run one or more [`manager::Manager`] instances behind a [`port::PortManager`]
//!   to keep a cached, continuously refreshed view of every sensor.
//! - Use the typed [`Communicator`] methods to issue single commands.
//! - Work directly with the wire [`codec`] to encode requests and decode responses.
//!
//! # Getting started
//!
//! Controllers are typically attached through an RS-485 adapter configured as follows:
//!
//! - **Baud rate:** 115200
//! - **Parity:** None
//! - **Data bits:** 8
//! - **Stop bits:** 1
//!
//! If you enable the `native-serial` feature, you can obtain a compatible
//! serial port instance using [`serial::open`]:
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), std::io::Error> {
//! let mut port = vrc_t70::serial::open("/dev/ttyUSB0", vrc_t70::DEFAULT_BAUD_RATE)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Examples
//!
//! ## Querying temperatures using the [`Communicator`]
//!
//! ```no_run
//! use vrc_t70::{Communicator, Trunk, communicator::Options};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let mut port = vrc_t70::serial::open("/dev/ttyUSB0", vrc_t70::DEFAULT_BAUD_RATE)?;
//! let mut comm = Communicator::new(1, Options::default())?;
//! let trunk = Trunk::new(1)?;
//!
//! println!("Sensors: {}", comm.rescan_sensors_on_trunk(&mut port, trunk).await?);
//!
//! for sensor in comm.get_temperatures_on_trunk(&mut port, trunk).await? {
//!     println!("{}: {:?}", sensor.index, sensor.temperature);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Polling several controllers sharing a port
//!
//! ```no_run
//! use std::time::Duration;
//! use vrc_t70::{Communicator, communicator, manager::{self, Manager}, port::{self, PortManager}};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let opener = vrc_t70::serial::SerialOpener::new("/dev/ttyUSB0", vrc_t70::DEFAULT_BAUD_RATE);
//! let managers = vec![
//!     Manager::new(Communicator::new(1, communicator::Options::default())?, manager::Options::default(), ()),
//!     Manager::new(Communicator::new(2, communicator::Options::default())?, manager::Options::default(), ()),
//! ];
//! let mut ports = PortManager::new(opener, managers, port::Options::default());
//!
//! loop {
//!     ports.communicate(Some(Duration::from_secs(1))).await;
//! }
//! # }
//! ```
//!
//! # Protocol details
//!
//! Every exchange is a request frame answered by exactly one response frame.
//! Both carry the controller address, a command identifier, a 16-bit sequence id
//! and a trailing CRC-8. Controllers answer only requests addressed to them,
//! so several of them can share one half-duplex bus.
//!
//! A host starts a session by setting a random 32-bit session id,
//! then rescans each trunk to learn how many sensors are attached before
//! querying their addresses and temperatures.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod communicator;
pub mod manager;
pub mod port;
pub mod response;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

#[cfg(test)]
mod fake;

pub use codec::{Command, ProcessingResult, RawResponse, Request};
pub use communicator::Communicator;
pub use embedded_io_async;
pub use response::{Response, ResponseData, SensorAddress, SensorTemperature};

use core::{
    fmt::{Debug, Display, Formatter},
    ops::RangeInclusive,
};

/// Default baud rate of the controller's serial interface.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Valid controller addresses.
pub const CONTROLLER_ADDRESSES: RangeInclusive<u8> = 1..=254;

/// Valid trunk numbers.
pub const TRUNKS: RangeInclusive<u8> = 1..=7;

/// Number of trunks on a controller.
pub const TRUNKS_COUNT: usize = 7;

/// Valid sensor indices within a trunk.
pub const SENSOR_INDICES: RangeInclusive<u8> = 0..=9;

/// Maximum number of sensors attached to a single trunk.
pub const SENSORS_PER_TRUNK: usize = 10;

/// Valid session ids.
///
/// Zero is reserved for "no session", the upper bound is kept clear of `u32::MAX`.
pub const SESSION_IDS: RangeInclusive<u32> = 1..=0xffff_fffe;

/// A specialized [`Result`] type for [`Communicator`] operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for [`Communicator`] operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// Encoding, decoding or argument validation failed.
    Codec(codec::Error),
    /// Fewer bytes than a complete response header arrived in time.
    IncompleteResponse,
    /// A response arrived from a controller other than the addressed one.
    WrongAddress {
        /// Address the request was sent to.
        expected: u8,
        /// Address found in the response.
        received: u8,
    },
    /// The controller did not answer any attempt.
    NoResponse,
    /// A port-specific input/output error.
    Io(E),
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Codec(err) => write!(f, "codec error: {err}"),
            Self::IncompleteResponse => write!(f, "incomplete response"),
            Self::WrongAddress { expected, received } => write!(
                f,
                "response from controller {received:#04x}, expected {expected:#04x}"
            ),
            Self::NoResponse => write!(f, "no response from controller"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::Io(err)
    }
}

/// Trunk of a controller.
///
/// Always holds a number within [`TRUNKS`].
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Debug)]
pub struct Trunk(u8);

impl Trunk {
    /// Constructs a trunk from its 1-based number.
    ///
    /// # Errors
    ///
    /// - [`codec::Error::InvalidValue`] if the number is outside [`TRUNKS`].
    pub fn new(number: u8) -> core::result::Result<Self, codec::Error> {
        if TRUNKS.contains(&number) {
            Ok(Self(number))
        } else {
            Err(codec::Error::InvalidValue("trunk number"))
        }
    }

    /// Returns the 1-based trunk number.
    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Returns the 0-based position of the trunk, suitable for indexing per-trunk arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Iterates over all trunks in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        TRUNKS.map(Self)
    }
}

impl TryFrom<u8> for Trunk {
    type Error = codec::Error;

    fn try_from(number: u8) -> core::result::Result<Self, Self::Error> {
        Self::new(number)
    }
}

impl Display for Trunk {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn check_range<T: PartialOrd>(
    value: T,
    range: &RangeInclusive<T>,
    name: &'static str,
) -> core::result::Result<T, codec::Error> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(codec::Error::InvalidValue(name))
    }
}
