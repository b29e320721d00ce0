//! Typed responses.
//!
//! [`Response::from_raw`] maps the event id of a [`RawResponse`] to the
//! matching [`ResponseData`] variant and validates the payload layout.

use crate::{
    CONTROLLER_ADDRESSES, SENSOR_INDICES, SENSORS_PER_TRUNK, Trunk, check_range,
    codec::{Command, Error, RawResponse},
};
use log::debug;

const TEMPERATURE_RECORD_LEN: usize = 5;
const ADDRESS_RECORD_LEN: usize = 9;

/// Temperature reading of a single sensor.
#[derive(PartialEq, Copy, Clone, Debug)]
pub struct SensorTemperature {
    /// Trunk the sensor is attached to.
    pub trunk: Trunk,
    /// Position of the sensor within the trunk.
    pub index: u8,
    /// Whether the sensor answered its last conversion.
    pub connected: bool,
    /// Temperature in degrees Celsius, only present for connected sensors.
    pub temperature: Option<f32>,
}

/// Unique 64-bit address of a single sensor.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct SensorAddress {
    /// Trunk the sensor is attached to.
    pub trunk: Trunk,
    /// Position of the sensor within the trunk.
    pub index: u8,
    /// Sensor address.
    pub address: u64,
    /// Whether the controller flagged the sensor as faulty.
    pub error_detected: bool,
}

/// Decoded payload of a response, one variant per [`Command`].
#[derive(PartialEq, Clone, Debug)]
pub enum ResponseData {
    /// Answer to [`Command::Ping`].
    Ping,
    /// Answer to [`Command::GetSessionId`].
    GetSessionId {
        /// Current session id.
        session_id: u32,
    },
    /// Answer to [`Command::SetSessionId`].
    SetSessionId {
        /// Session id stored by the controller.
        session_id: u32,
    },
    /// Answer to [`Command::RescanSensorsOnTrunk`].
    RescanSensorsOnTrunk {
        /// Rescanned trunk.
        trunk: Trunk,
        /// Number of sensors found.
        sensors_count: u8,
    },
    /// Answer to [`Command::GetSensorsCountOnTrunk`].
    GetSensorsCountOnTrunk {
        /// Queried trunk.
        trunk: Trunk,
        /// Number of sensors found by the last rescan.
        sensors_count: u8,
    },
    /// Answer to [`Command::GetTemperatureOfSensorOnTrunk`].
    GetTemperatureOfSensorOnTrunk(SensorTemperature),
    /// Answer to [`Command::GetTemperaturesOnTrunk`].
    GetTemperaturesOnTrunk {
        /// Queried trunk.
        trunk: Trunk,
        /// Readings ordered by sensor index.
        sensors: Vec<SensorTemperature>,
    },
    /// Answer to [`Command::GetSensorUniqueAddressOnTrunk`].
    GetSensorUniqueAddressOnTrunk(SensorAddress),
    /// Answer to [`Command::GetSensorsUniqueAddressOnTrunk`].
    GetSensorsUniqueAddressOnTrunk {
        /// Queried trunk.
        trunk: Trunk,
        /// Addresses ordered by sensor index.
        sensors: Vec<SensorAddress>,
    },
    /// Answer to [`Command::SetControllerNewAddress`].
    SetControllerNewAddress {
        /// Address the controller now listens on.
        address: u8,
    },
}

impl ResponseData {
    /// Returns the command answered by this response.
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            Self::Ping => Command::Ping,
            Self::GetSessionId { .. } => Command::GetSessionId,
            Self::SetSessionId { .. } => Command::SetSessionId,
            Self::RescanSensorsOnTrunk { .. } => Command::RescanSensorsOnTrunk,
            Self::GetSensorsCountOnTrunk { .. } => Command::GetSensorsCountOnTrunk,
            Self::GetTemperatureOfSensorOnTrunk(_) => Command::GetTemperatureOfSensorOnTrunk,
            Self::GetTemperaturesOnTrunk { .. } => Command::GetTemperaturesOnTrunk,
            Self::GetSensorUniqueAddressOnTrunk(_) => Command::GetSensorUniqueAddressOnTrunk,
            Self::GetSensorsUniqueAddressOnTrunk { .. } => Command::GetSensorsUniqueAddressOnTrunk,
            Self::SetControllerNewAddress { .. } => Command::SetControllerNewAddress,
        }
    }
}

/// Response with a decoded payload.
#[derive(PartialEq, Clone, Debug)]
pub struct Response {
    raw: RawResponse,
    data: ResponseData,
}

impl Response {
    /// Interprets a raw response according to its event id.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownResponse`] if the event id is not a known command.
    /// - [`Error::WrongPayloadLength`] if the payload does not match the command's layout.
    /// - [`Error::InvalidValue`] if a trunk, sensor index, flag or address is out of range.
    pub fn from_raw(raw: RawResponse) -> Result<Self, Error> {
        let command = Command::from_repr(raw.event_id()).ok_or(Error::UnknownResponse)?;
        let payload = raw.payload();
        let data = match command {
            // Pong payload is ignored
            Command::Ping => ResponseData::Ping,
            Command::GetSessionId => ResponseData::GetSessionId {
                session_id: parse_session_id(payload)?,
            },
            Command::SetSessionId => ResponseData::SetSessionId {
                session_id: parse_session_id(payload)?,
            },
            Command::RescanSensorsOnTrunk => {
                let (trunk, sensors_count) = parse_sensors_count(payload)?;

                ResponseData::RescanSensorsOnTrunk {
                    trunk,
                    sensors_count,
                }
            }
            Command::GetSensorsCountOnTrunk => {
                let (trunk, sensors_count) = parse_sensors_count(payload)?;

                ResponseData::GetSensorsCountOnTrunk {
                    trunk,
                    sensors_count,
                }
            }
            Command::GetTemperatureOfSensorOnTrunk => {
                let &[trunk, index, connected, t0, t1, t2, t3] = payload else {
                    return Err(Error::WrongPayloadLength);
                };

                ResponseData::GetTemperatureOfSensorOnTrunk(parse_temperature(
                    Trunk::new(trunk)?,
                    index,
                    connected,
                    [t0, t1, t2, t3],
                )?)
            }
            Command::GetTemperaturesOnTrunk => {
                let (trunk, records) = split_records(payload, TEMPERATURE_RECORD_LEN)?;
                let sensors = records
                    .chunks_exact(TEMPERATURE_RECORD_LEN)
                    .zip(0..)
                    .map(|(rec, index)| {
                        parse_temperature(trunk, index, rec[0], [rec[1], rec[2], rec[3], rec[4]])
                    })
                    .collect::<Result<_, _>>()?;

                ResponseData::GetTemperaturesOnTrunk { trunk, sensors }
            }
            Command::GetSensorUniqueAddressOnTrunk => {
                let (&[trunk, index], address) = payload
                    .split_first_chunk::<2>()
                    .ok_or(Error::WrongPayloadLength)?;
                let address = address.try_into().map_err(|_| Error::WrongPayloadLength)?;

                ResponseData::GetSensorUniqueAddressOnTrunk(SensorAddress {
                    trunk: Trunk::new(trunk)?,
                    index: check_range(index, &SENSOR_INDICES, "sensor index")?,
                    address: u64::from_be_bytes(address),
                    error_detected: false,
                })
            }
            Command::GetSensorsUniqueAddressOnTrunk => {
                let (trunk, records) = split_records(payload, ADDRESS_RECORD_LEN)?;
                let sensors = records
                    .chunks_exact(ADDRESS_RECORD_LEN)
                    .zip(0..)
                    .map(|(rec, index)| {
                        let address = rec[..8].try_into().map_err(|_| Error::WrongPayloadLength)?;

                        Ok(SensorAddress {
                            trunk,
                            index: check_range(index, &SENSOR_INDICES, "sensor index")?,
                            address: u64::from_be_bytes(address),
                            error_detected: parse_flag(rec[8], "error flag")?,
                        })
                    })
                    .collect::<Result<_, Error>>()?;

                ResponseData::GetSensorsUniqueAddressOnTrunk { trunk, sensors }
            }
            Command::SetControllerNewAddress => {
                let &[address] = payload else {
                    return Err(Error::WrongPayloadLength);
                };

                ResponseData::SetControllerNewAddress {
                    address: check_range(address, &CONTROLLER_ADDRESSES, "controller address")?,
                }
            }
        };

        debug!("Decoded response: {data:?}");

        Ok(Self { raw, data })
    }

    /// Returns the underlying raw response.
    #[must_use]
    pub fn raw(&self) -> &RawResponse {
        &self.raw
    }

    /// Returns the decoded payload.
    #[must_use]
    pub fn data(&self) -> &ResponseData {
        &self.data
    }

    /// Consumes the response, returning the decoded payload.
    #[must_use]
    pub fn into_data(self) -> ResponseData {
        self.data
    }
}

impl TryFrom<RawResponse> for Response {
    type Error = Error;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

fn parse_session_id(payload: &[u8]) -> Result<u32, Error> {
    let bytes = payload.try_into().map_err(|_| Error::WrongPayloadLength)?;

    Ok(u32::from_be_bytes(bytes))
}

fn parse_sensors_count(payload: &[u8]) -> Result<(Trunk, u8), Error> {
    let &[trunk, count] = payload else {
        return Err(Error::WrongPayloadLength);
    };

    // The last sensor found must fit into a valid slot
    if let Some(last) = count.checked_sub(1) {
        check_range(last, &SENSOR_INDICES, "sensors count")?;
    }

    Ok((Trunk::new(trunk)?, count))
}

fn parse_flag(value: u8, name: &'static str) -> Result<bool, Error> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::InvalidValue(name)),
    }
}

fn parse_temperature(
    trunk: Trunk,
    index: u8,
    connected: u8,
    value: [u8; 4],
) -> Result<SensorTemperature, Error> {
    let connected = parse_flag(connected, "connected flag")?;

    Ok(SensorTemperature {
        trunk,
        index: check_range(index, &SENSOR_INDICES, "sensor index")?,
        connected,
        temperature: connected.then(|| f32::from_le_bytes(value)),
    })
}

/// Splits a multi-sensor payload into its trunk and fixed-size records.
fn split_records(payload: &[u8], record_len: usize) -> Result<(Trunk, &[u8]), Error> {
    let (&trunk, records) = payload.split_first().ok_or(Error::WrongPayloadLength)?;

    if records.len() % record_len != 0 {
        return Err(Error::WrongPayloadLength);
    }

    if records.len() / record_len > SENSORS_PER_TRUNK {
        return Err(Error::WrongPayloadLength);
    }

    Ok((Trunk::new(trunk)?, records))
}
