//! Wire format of VRC-T70 frames.
//!
//! A request frame is laid out as
//! `address | command | sequence_id (BE) | length | data | crc8`,
//! a response frame as
//! `address | event | sequence_id (BE) | processing_result | length | payload | crc8`.
//!
//! The checksum is CRC-8 with generator polynomial `0x1d5`,
//! zero initial value, no reflection and no final XOR,
//! computed over every byte preceding it.

use crate::{CONTROLLER_ADDRESSES, SENSOR_INDICES, SESSION_IDS, Trunk, check_range};
use core::{
    fmt::{Display, Formatter},
    time::Duration,
};
use crc::{CRC_8_DVB_S2, Crc};
use log::trace;
use strum::FromRepr;

/// Number of bytes surrounding the data of a request frame.
pub const REQUEST_OVERHEAD: usize = 6;

/// Number of bytes surrounding the payload of a response frame.
///
/// This is also the size of the smallest possible response.
pub const RESPONSE_OVERHEAD: usize = 7;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_DVB_S2);

/// Error type for encoding, decoding and argument validation.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Error {
    /// The named value is outside its valid range.
    InvalidValue(&'static str),
    /// The request lacks an address or a sequence id.
    IncompleteRequest,
    /// No bytes were received.
    EmptyResponse,
    /// The frame checksum does not match its contents.
    WrongCrc,
    /// The frame or payload length does not match its layout.
    WrongPayloadLength,
    /// The frame carries an unknown command or event id.
    UnknownCommand(u8),
    /// The response does not answer the issued request.
    UnknownResponse,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidValue(name) => write!(f, "invalid {name}"),
            Self::IncompleteRequest => write!(f, "request has no address or sequence id"),
            Self::EmptyResponse => write!(f, "empty response"),
            Self::WrongCrc => write!(f, "wrong crc"),
            Self::WrongPayloadLength => write!(f, "wrong payload length"),
            Self::UnknownCommand(id) => write!(f, "unknown command: {id:#04x}"),
            Self::UnknownResponse => write!(f, "unknown response"),
        }
    }
}

impl core::error::Error for Error {}

/// Command understood by the controller.
///
/// Responses carry the id of the command they answer as their event id.
#[derive(FromRepr, strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Command {
    /// Checks that the controller is alive.
    Ping = 0x01,
    /// Reads the last measured temperature of one sensor.
    GetTemperatureOfSensorOnTrunk = 0x02,
    /// Reads the last measured temperatures of all sensors on a trunk.
    GetTemperaturesOnTrunk = 0x03,
    /// Reads the 64-bit address of one sensor.
    GetSensorUniqueAddressOnTrunk = 0x04,
    /// Reads the 64-bit addresses of all sensors on a trunk.
    GetSensorsUniqueAddressOnTrunk = 0x05,
    /// Stores a new session id.
    SetSessionId = 0x06,
    /// Reads the current session id.
    GetSessionId = 0x07,
    /// Moves the controller to another bus address.
    SetControllerNewAddress = 0x08,
    /// Enumerates the sensors on a trunk.
    RescanSensorsOnTrunk = 0x09,
    /// Reads the number of sensors found by the last rescan.
    GetSensorsCountOnTrunk = 0x0a,
}

impl Command {
    /// Returns how long the controller may take to process the command,
    /// on top of the regular response timeout.
    ///
    /// A rescan drives the sensor bus and takes by far the longest.
    #[must_use]
    pub const fn response_wait(self) -> Duration {
        match self {
            Self::Ping | Self::GetTemperaturesOnTrunk | Self::GetSensorsCountOnTrunk => {
                Duration::ZERO
            }
            Self::GetSessionId => Duration::from_millis(50),
            Self::GetTemperatureOfSensorOnTrunk
            | Self::GetSensorUniqueAddressOnTrunk
            | Self::SetControllerNewAddress => Duration::from_millis(200),
            Self::GetSensorsUniqueAddressOnTrunk | Self::SetSessionId => {
                Duration::from_millis(250)
            }
            Self::RescanSensorsOnTrunk => Duration::from_secs(1),
        }
    }
}

/// Processing result reported by the controller.
#[derive(FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum ProcessingResult {
    /// The request was processed.
    NoError = 0x00,
    /// The command is not supported.
    UnknownRequest = 0x01,
    /// The request is not allowed in the current state.
    AccessDenied = 0x02,
    /// An argument of the request is out of range.
    IncorrectValue = 0x03,
    /// A sensor failed to respond.
    SensorError = 0x04,
    /// A sensor is still converting.
    SensorBusy = 0x05,
}

/// Computes the frame checksum over the given bytes.
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Request sent to a controller.
///
/// The address and sequence id can be left unset,
/// in which case the [`Communicator`](crate::Communicator) fills them in.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Request {
    /// Address of the target controller.
    pub address: Option<u8>,
    /// Command to execute.
    pub command: Command,
    /// Sequence id echoed by the response.
    pub sequence_id: Option<u16>,
    /// Command arguments.
    pub payload: Vec<u8>,
}

impl Request {
    /// Constructs a request with unset address and sequence id.
    #[must_use]
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        let req = Self {
            address: None,
            command,
            sequence_id: None,
            payload,
        };

        trace!("New request: {req:x?}");

        req
    }

    /// Sets the target address.
    #[must_use]
    pub fn with_address(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }

    /// Sets the sequence id.
    #[must_use]
    pub fn with_sequence_id(mut self, sequence_id: u16) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    /// Constructs a ping request.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(Command::Ping, Vec::new())
    }

    /// Constructs a request reading the session id.
    #[must_use]
    pub fn get_session_id() -> Self {
        Self::new(Command::GetSessionId, Vec::new())
    }

    /// Constructs a request storing a session id.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidValue`] if the session id is outside [`SESSION_IDS`].
    pub fn set_session_id(session_id: u32) -> Result<Self, Error> {
        let session_id = check_range(session_id, &SESSION_IDS, "session id")?;

        Ok(Self::new(
            Command::SetSessionId,
            session_id.to_be_bytes().to_vec(),
        ))
    }

    /// Constructs a request rescanning a trunk.
    #[must_use]
    pub fn rescan_sensors_on_trunk(trunk: Trunk) -> Self {
        Self::new(Command::RescanSensorsOnTrunk, vec![trunk.number()])
    }

    /// Constructs a request reading the sensor count of a trunk.
    #[must_use]
    pub fn get_sensors_count_on_trunk(trunk: Trunk) -> Self {
        Self::new(Command::GetSensorsCountOnTrunk, vec![trunk.number()])
    }

    /// Constructs a request reading the temperature of a single sensor.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidValue`] if the index is outside [`SENSOR_INDICES`].
    pub fn get_temperature_of_sensor_on_trunk(trunk: Trunk, index: u8) -> Result<Self, Error> {
        let index = check_range(index, &SENSOR_INDICES, "sensor index")?;

        Ok(Self::new(
            Command::GetTemperatureOfSensorOnTrunk,
            vec![trunk.number(), index],
        ))
    }

    /// Constructs a request reading all temperatures of a trunk.
    #[must_use]
    pub fn get_temperatures_on_trunk(trunk: Trunk) -> Self {
        Self::new(Command::GetTemperaturesOnTrunk, vec![trunk.number()])
    }

    /// Constructs a request reading the address of a single sensor.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidValue`] if the index is outside [`SENSOR_INDICES`].
    pub fn get_sensor_unique_address_on_trunk(trunk: Trunk, index: u8) -> Result<Self, Error> {
        let index = check_range(index, &SENSOR_INDICES, "sensor index")?;

        Ok(Self::new(
            Command::GetSensorUniqueAddressOnTrunk,
            vec![trunk.number(), index],
        ))
    }

    /// Constructs a request reading all sensor addresses of a trunk.
    #[must_use]
    pub fn get_sensors_unique_address_on_trunk(trunk: Trunk) -> Self {
        Self::new(Command::GetSensorsUniqueAddressOnTrunk, vec![trunk.number()])
    }

    /// Constructs a request moving the controller to a new address.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidValue`] if the address is outside [`CONTROLLER_ADDRESSES`].
    pub fn set_controller_new_address(address: u8) -> Result<Self, Error> {
        let address = check_range(address, &CONTROLLER_ADDRESSES, "controller address")?;

        Ok(Self::new(Command::SetControllerNewAddress, vec![address]))
    }

    /// Serializes the request into a frame.
    ///
    /// # Errors
    ///
    /// - [`Error::IncompleteRequest`] if the address or sequence id is unset.
    /// - [`Error::InvalidValue`] if the payload exceeds 255 bytes.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let (Some(address), Some(sequence_id)) = (self.address, self.sequence_id) else {
            return Err(Error::IncompleteRequest);
        };
        let len = u8::try_from(self.payload.len())
            .map_err(|_| Error::InvalidValue("payload length"))?;
        let mut frame = Vec::with_capacity(REQUEST_OVERHEAD + self.payload.len());

        frame.push(address);
        frame.push(self.command as u8);
        frame.extend_from_slice(&sequence_id.to_be_bytes());
        frame.push(len);
        frame.extend_from_slice(&self.payload);
        frame.push(crc8(&frame));

        Ok(frame)
    }

    /// Parses a request frame.
    ///
    /// Used by tooling that listens on the bus or emulates a controller.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let body = check_crc(data)?;

        if data.len() < REQUEST_OVERHEAD || data.len() - REQUEST_OVERHEAD != usize::from(body[4]) {
            return Err(Error::WrongPayloadLength);
        }

        let command = Command::from_repr(body[1]).ok_or(Error::UnknownCommand(body[1]))?;

        Ok(Self {
            address: Some(body[0]),
            command,
            sequence_id: Some(u16::from_be_bytes([body[2], body[3]])),
            payload: body[REQUEST_OVERHEAD - 1..].to_vec(),
        })
    }
}

/// Response frame as received from the controller.
///
/// Only its framing has been verified. Use [`Response::from_raw`](crate::Response::from_raw)
/// to interpret the payload.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct RawResponse {
    address: u8,
    event_id: u8,
    sequence_id: u16,
    processing_result: u8,
    payload: Vec<u8>,
    crc: u8,
}

impl RawResponse {
    /// Constructs a response, computing its checksum.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidValue`] if the payload exceeds 255 bytes.
    pub fn new(
        address: u8,
        event_id: u8,
        sequence_id: u16,
        processing_result: u8,
        payload: Vec<u8>,
    ) -> Result<Self, Error> {
        let len = u8::try_from(payload.len()).map_err(|_| Error::InvalidValue("payload length"))?;
        let mut resp = Self {
            address,
            event_id,
            sequence_id,
            processing_result,
            payload,
            crc: 0,
        };
        let mut digest = CRC8.digest();

        digest.update(&resp.header(len));
        digest.update(&resp.payload);
        resp.crc = digest.finalize();

        Ok(resp)
    }

    /// Parses a response frame.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyResponse`] if no data is given.
    /// - [`Error::WrongCrc`] if the last byte is not the checksum of the preceding ones.
    /// - [`Error::WrongPayloadLength`] if the frame length disagrees with its length field.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::EmptyResponse);
        }

        let body = check_crc(data)?;

        if data.len() < RESPONSE_OVERHEAD
            || data.len() - RESPONSE_OVERHEAD != usize::from(body[5])
        {
            return Err(Error::WrongPayloadLength);
        }

        Ok(Self {
            address: body[0],
            event_id: body[1],
            sequence_id: u16::from_be_bytes([body[2], body[3]]),
            processing_result: body[4],
            payload: body[RESPONSE_OVERHEAD - 1..].to_vec(),
            crc: data[data.len() - 1],
        })
    }

    /// Serializes the response into a frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Payload length is bounded by construction
        #[allow(clippy::cast_possible_truncation)]
        let mut frame = self.header(self.payload.len() as u8).to_vec();

        frame.extend_from_slice(&self.payload);
        frame.push(self.crc);

        frame
    }

    /// Returns the address of the responding controller.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Returns the id of the answered command.
    #[must_use]
    pub fn event_id(&self) -> u8 {
        self.event_id
    }

    /// Returns the echoed sequence id.
    #[must_use]
    pub fn sequence_id(&self) -> u16 {
        self.sequence_id
    }

    /// Returns the raw processing result code.
    #[must_use]
    pub fn processing_result_code(&self) -> u8 {
        self.processing_result
    }

    /// Returns the processing result, if the code is known.
    #[must_use]
    pub fn processing_result(&self) -> Option<ProcessingResult> {
        ProcessingResult::from_repr(self.processing_result)
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the frame checksum.
    #[must_use]
    pub fn crc(&self) -> u8 {
        self.crc
    }

    fn header(&self, len: u8) -> [u8; RESPONSE_OVERHEAD - 1] {
        let [seq_hi, seq_lo] = self.sequence_id.to_be_bytes();

        [
            self.address,
            self.event_id,
            seq_hi,
            seq_lo,
            self.processing_result,
            len,
        ]
    }
}

/// Verifies the trailing checksum, returning the bytes it covers.
fn check_crc(data: &[u8]) -> Result<&[u8], Error> {
    let (&crc, body) = data.split_last().ok_or(Error::WrongPayloadLength)?;

    if crc8(body) == crc {
        Ok(body)
    } else {
        Err(Error::WrongCrc)
    }
}
