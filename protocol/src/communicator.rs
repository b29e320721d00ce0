//! Request/response exchange with a single controller.
//!
//! A [`Communicator`] owns the addressing and sequencing state for one
//! controller. It borrows the port for each exchange, so several
//! communicators can take turns on a shared bus.

use crate::{
    CONTROLLER_ADDRESSES, Error, Result, SensorAddress, SensorTemperature, Trunk, check_range,
    codec::{self, RESPONSE_OVERHEAD, RawResponse, Request},
    port::Port,
    response::{Response, ResponseData},
};
use core::time::Duration;
use log::{debug, trace, warn};
use tokio::time::{self, Instant};

/// Interval between polls of a port that has no data available.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Communicator settings.
#[derive(Clone, Debug)]
pub struct Options {
    /// Number of times a request is sent before giving up.
    pub retries: u32,
    /// Minimum time between the starts of two consecutive requests.
    pub min_delay_between_requests: Duration,
    /// Minimum time to wait for the first bytes of a response.
    pub min_response_wait: Duration,
    /// Discard responses whose sequence id does not match the request.
    pub validate_sequence_id: bool,
    /// Fail immediately with [`Error::WrongAddress`] when another controller answers.
    ///
    /// Useful for discovering controllers with unknown addresses.
    pub strict_address: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retries: 3,
            min_delay_between_requests: Duration::from_millis(10),
            min_response_wait: Duration::from_millis(75),
            validate_sequence_id: true,
            strict_address: false,
        }
    }
}

/// Result of a single request transmission.
#[derive(Debug)]
enum Outcome {
    Success(Response),
    /// Fewer bytes than a response header arrived.
    Incomplete(usize),
    /// The received bytes do not form a valid response.
    Malformed(codec::Error),
    /// A valid response came from another controller.
    WrongAddress(u8),
    /// A valid response answered another request.
    WrongSequence(u16),
}

/// Asynchronous VRC-T70 communicator.
///
/// Sends requests through any [`Port`] and retries them until a matching
/// response arrives or the configured number of attempts is used up.
///
/// # Examples
///
/// ```no_run
/// use vrc_t70::{Communicator, Trunk, communicator::Options};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut port = vrc_t70::serial::open("/dev/ttyUSB0", vrc_t70::DEFAULT_BAUD_RATE)?;
/// let mut comm = Communicator::new(0x08, Options::default())?;
///
/// comm.ping(&mut port).await?;
///
/// for sensor in comm.get_sensors_unique_address_on_trunk(&mut port, Trunk::new(1)?).await? {
///     println!("{}: {:016x}", sensor.index, sensor.address);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Communicator {
    address: u8,
    sequence_id: u16,
    options: Options,
    last_request_time: Option<Instant>,
}

impl Communicator {
    /// Constructs a communicator for the controller at the given address.
    ///
    /// # Errors
    ///
    /// - [`codec::Error::InvalidValue`] if the address is outside [`CONTROLLER_ADDRESSES`].
    pub fn new(address: u8, options: Options) -> core::result::Result<Self, codec::Error> {
        Ok(Self {
            address: check_range(address, &CONTROLLER_ADDRESSES, "controller address")?,
            sequence_id: 1,
            options,
            last_request_time: None,
        })
    }

    /// Returns the address of the target controller.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Changes the address of the target controller.
    ///
    /// # Errors
    ///
    /// - [`codec::Error::InvalidValue`] if the address is outside [`CONTROLLER_ADDRESSES`].
    pub fn set_address(&mut self, address: u8) -> core::result::Result<(), codec::Error> {
        self.address = check_range(address, &CONTROLLER_ADDRESSES, "controller address")?;

        Ok(())
    }

    /// Returns the sequence id of the next request.
    #[must_use]
    pub fn sequence_id(&self) -> u16 {
        self.sequence_id
    }

    /// Sets the sequence id of the next request.
    pub fn set_sequence_id(&mut self, sequence_id: u16) {
        self.sequence_id = sequence_id;
    }

    /// Returns the communicator settings.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns the communicator settings for modification.
    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Sends a request and waits for the matching response.
    ///
    /// An unset address or sequence id is taken from the communicator.
    /// Every retry transmits the identical frame, including its sequence id.
    ///
    /// Incomplete or malformed responses, as well as responses from other
    /// controllers or to other requests, cause the request to be sent again.
    ///
    /// # Errors
    ///
    /// - [`Error::NoResponse`] if no attempt produced a matching response.
    /// - [`Error::WrongAddress`] if another controller answered and
    ///   [`Options::strict_address`] is set.
    /// - [`Error::Io`] if the port fails.
    pub async fn communicate<P: Port>(
        &mut self,
        port: &mut P,
        request: Request,
    ) -> Result<Response, P::Error> {
        let address = request.address.unwrap_or(self.address);
        let sequence_id = request.sequence_id.unwrap_or(self.sequence_id);
        let wait = self
            .options
            .min_response_wait
            .max(request.command.response_wait());
        let frame = request
            .with_address(address)
            .with_sequence_id(sequence_id)
            .encode()
            .map_err(Error::Codec)?;

        for attempt in 1..=self.options.retries {
            debug!("Sending (attempt {attempt}): {frame:02x?}");

            match self.attempt(port, &frame, wait).await? {
                Outcome::Success(resp) => return Ok(resp),
                Outcome::WrongAddress(received) => {
                    warn!(
                        "Received response from controller {received:#04x}, expected {address:#04x}"
                    );

                    if self.options.strict_address {
                        return Err(Error::WrongAddress {
                            expected: address,
                            received,
                        });
                    }
                }
                Outcome::WrongSequence(received) => {
                    warn!(
                        "Received response with sequence id {received:#06x}, expected {sequence_id:#06x}"
                    );
                }
                Outcome::Incomplete(received) => {
                    debug!("Incomplete response, received {received} bytes");
                    port.discard_input()?;
                }
                Outcome::Malformed(err) => {
                    debug!("Malformed response: {err}");
                    port.discard_input()?;
                }
            }
        }

        Err(Error::NoResponse)
    }

    /// Checks that the controller is alive.
    pub async fn ping<P: Port>(&mut self, port: &mut P) -> Result<(), P::Error> {
        match self.communicate(port, Request::ping()).await?.into_data() {
            ResponseData::Ping => Ok(()),
            _ => Err(unknown_response()),
        }
    }

    /// Reads the controller's current session id.
    pub async fn get_session_id<P: Port>(&mut self, port: &mut P) -> Result<u32, P::Error> {
        match self
            .communicate(port, Request::get_session_id())
            .await?
            .into_data()
        {
            ResponseData::GetSessionId { session_id } => Ok(session_id),
            _ => Err(unknown_response()),
        }
    }

    /// Stores a new session id on the controller, returning the confirmed value.
    ///
    /// # Errors
    ///
    /// - [`codec::Error::InvalidValue`] if the session id is outside [`SESSION_IDS`](crate::SESSION_IDS).
    /// - [`codec::Error::UnknownResponse`] if the controller confirms a different session id.
    pub async fn set_session_id<P: Port>(
        &mut self,
        port: &mut P,
        session_id: u32,
    ) -> Result<u32, P::Error> {
        let req = Request::set_session_id(session_id).map_err(Error::Codec)?;

        match self.communicate(port, req).await?.into_data() {
            ResponseData::SetSessionId { session_id: stored } if stored == session_id => {
                Ok(stored)
            }
            _ => Err(unknown_response()),
        }
    }

    /// Enumerates the sensors on a trunk, returning their number.
    ///
    /// The controller needs up to a second to scan the bus.
    pub async fn rescan_sensors_on_trunk<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
    ) -> Result<u8, P::Error> {
        match self
            .communicate(port, Request::rescan_sensors_on_trunk(trunk))
            .await?
            .into_data()
        {
            ResponseData::RescanSensorsOnTrunk {
                trunk: echoed,
                sensors_count,
            } if echoed == trunk => Ok(sensors_count),
            _ => Err(unknown_response()),
        }
    }

    /// Returns the number of sensors found on a trunk by the last rescan.
    pub async fn get_sensors_count_on_trunk<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
    ) -> Result<u8, P::Error> {
        match self
            .communicate(port, Request::get_sensors_count_on_trunk(trunk))
            .await?
            .into_data()
        {
            ResponseData::GetSensorsCountOnTrunk {
                trunk: echoed,
                sensors_count,
            } if echoed == trunk => Ok(sensors_count),
            _ => Err(unknown_response()),
        }
    }

    /// Reads the temperature of a single sensor.
    ///
    /// # Errors
    ///
    /// - [`codec::Error::InvalidValue`] if the index is outside [`SENSOR_INDICES`](crate::SENSOR_INDICES).
    /// - [`codec::Error::UnknownResponse`] if the response describes another sensor.
    pub async fn get_temperature_of_sensor_on_trunk<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
        index: u8,
    ) -> Result<SensorTemperature, P::Error> {
        let req = Request::get_temperature_of_sensor_on_trunk(trunk, index).map_err(Error::Codec)?;

        match self.communicate(port, req).await?.into_data() {
            ResponseData::GetTemperatureOfSensorOnTrunk(sensor)
                if sensor.trunk == trunk && sensor.index == index =>
            {
                Ok(sensor)
            }
            _ => Err(unknown_response()),
        }
    }

    /// Reads the temperatures of all sensors on a trunk.
    pub async fn get_temperatures_on_trunk<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
    ) -> Result<Vec<SensorTemperature>, P::Error> {
        match self
            .communicate(port, Request::get_temperatures_on_trunk(trunk))
            .await?
            .into_data()
        {
            ResponseData::GetTemperaturesOnTrunk {
                trunk: echoed,
                sensors,
            } if echoed == trunk => Ok(sensors),
            _ => Err(unknown_response()),
        }
    }

    /// Reads the address of a single sensor.
    ///
    /// # Errors
    ///
    /// - [`codec::Error::InvalidValue`] if the index is outside [`SENSOR_INDICES`](crate::SENSOR_INDICES).
    /// - [`codec::Error::UnknownResponse`] if the response describes another sensor.
    pub async fn get_sensor_unique_address_on_trunk<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
        index: u8,
    ) -> Result<SensorAddress, P::Error> {
        let req = Request::get_sensor_unique_address_on_trunk(trunk, index).map_err(Error::Codec)?;

        match self.communicate(port, req).await?.into_data() {
            ResponseData::GetSensorUniqueAddressOnTrunk(sensor)
                if sensor.trunk == trunk && sensor.index == index =>
            {
                Ok(sensor)
            }
            _ => Err(unknown_response()),
        }
    }

    /// Reads the addresses of all sensors on a trunk.
    pub async fn get_sensors_unique_address_on_trunk<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
    ) -> Result<Vec<SensorAddress>, P::Error> {
        match self
            .communicate(port, Request::get_sensors_unique_address_on_trunk(trunk))
            .await?
            .into_data()
        {
            ResponseData::GetSensorsUniqueAddressOnTrunk {
                trunk: echoed,
                sensors,
            } if echoed == trunk => Ok(sensors),
            _ => Err(unknown_response()),
        }
    }

    /// Moves the controller to a new address.
    ///
    /// On success, the communicator targets the new address from then on.
    ///
    /// # Errors
    ///
    /// - [`codec::Error::InvalidValue`] if the address is outside [`CONTROLLER_ADDRESSES`].
    /// - [`codec::Error::UnknownResponse`] if the controller confirms a different address.
    pub async fn set_controller_new_address<P: Port>(
        &mut self,
        port: &mut P,
        address: u8,
    ) -> Result<u8, P::Error> {
        let req = Request::set_controller_new_address(address).map_err(Error::Codec)?;

        match self.communicate(port, req).await?.into_data() {
            ResponseData::SetControllerNewAddress { address: confirmed }
                if confirmed == address =>
            {
                self.address = confirmed;

                Ok(confirmed)
            }
            _ => Err(unknown_response()),
        }
    }

    /// Transmits a frame once and reads back whatever answers it.
    async fn attempt<P: Port>(
        &mut self,
        port: &mut P,
        frame: &[u8],
        wait: Duration,
    ) -> Result<Outcome, P::Error> {
        if let Some(last) = self.last_request_time {
            time::sleep_until(last + self.options.min_delay_between_requests).await;
        }

        self.write(port, frame).await?;

        let symbol_time = symbol_time(port.baud_rate());
        let started = Instant::now();
        let mut data = vec![0x00; RESPONSE_OVERHEAD];

        // Header plus either the checksum or the first payload byte
        let header_deadline = started + wait + symbol_time * RESPONSE_OVERHEAD as u32;
        let received = read(port, &mut data, header_deadline).await?;

        if received < RESPONSE_OVERHEAD {
            return Ok(Outcome::Incomplete(received));
        }

        let len = data[RESPONSE_OVERHEAD - 2];

        if len > 0 {
            let deadline =
                Instant::now() + symbol_time * u32::from(len) + wait.saturating_sub(started.elapsed());

            data.resize(RESPONSE_OVERHEAD + usize::from(len), 0x00);

            let received = read(port, &mut data[RESPONSE_OVERHEAD..], deadline).await?;

            data.truncate(RESPONSE_OVERHEAD + received);
        }

        trace!("Read from port: {data:02x?}");

        let raw = match RawResponse::decode(&data) {
            Ok(raw) => raw,
            Err(err) => return Ok(Outcome::Malformed(err)),
        };

        if raw.address() != frame[0] {
            return Ok(Outcome::WrongAddress(raw.address()));
        }

        if self.options.validate_sequence_id
            && raw.sequence_id() != u16::from_be_bytes([frame[2], frame[3]])
        {
            return Ok(Outcome::WrongSequence(raw.sequence_id()));
        }

        Ok(match Response::from_raw(raw) {
            Ok(resp) => Outcome::Success(resp),
            Err(err) => Outcome::Malformed(err),
        })
    }

    /// Writes a complete frame and advances the sequence id.
    async fn write<P: Port>(&mut self, port: &mut P, buf: &[u8]) -> Result<(), P::Error> {
        trace!("Write to port: {buf:02x?}");
        port.write_all(buf).await?;
        port.flush().await?;

        self.last_request_time = Some(Instant::now());
        self.sequence_id = self.sequence_id.wrapping_add(1);

        Ok(())
    }
}

/// Reads into the buffer until it is full or the deadline passes.
///
/// Returns the number of bytes read. A port returning no data is polled again.
async fn read<P: Port>(port: &mut P, buf: &mut [u8], deadline: Instant) -> Result<usize, P::Error> {
    let mut filled = 0;

    while filled < buf.len() {
        match time::timeout_at(deadline, port.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => {
                let now = Instant::now();

                if now >= deadline {
                    break;
                }

                time::sleep_until(deadline.min(now + POLL_INTERVAL)).await;
            }
            Ok(Ok(len)) => filled += len,
            Ok(Err(err)) => return Err(Error::Io(err)),
            Err(_) => break,
        }
    }

    Ok(filled)
}

/// Returns the worst-case transmission time of a single byte.
fn symbol_time(baud_rate: u32) -> Duration {
    Duration::from_secs_f64(1.5 / f64::from(baud_rate.max(1)))
}

fn unknown_response<E>() -> Error<E> {
    Error::Codec(codec::Error::UnknownResponse)
}
