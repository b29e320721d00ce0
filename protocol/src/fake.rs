//! In-memory ports for tests.

use crate::{
    Command, RawResponse, Request, SENSORS_PER_TRUNK, TRUNKS_COUNT, Trunk,
    codec::REQUEST_OVERHEAD, port::Port,
};
use embedded_io_async::{ErrorType, Read, Write};
use std::{cell::Cell, collections::VecDeque, io, rc::Rc};

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

/// Port replaying canned input and recording output.
///
/// Input is either available from the start or released one reply per flush.
#[derive(Debug)]
pub struct FakePort {
    pub tx: Vec<u8>,
    pub write_chunk: usize,
    pub read_chunk: usize,
    pub discarded: usize,
    rx: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    open: bool,
}

impl FakePort {
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            tx: Vec::new(),
            write_chunk: usize::MAX,
            read_chunk: usize::MAX,
            discarded: 0,
            rx: input.iter().copied().collect(),
            replies: VecDeque::new(),
            open: true,
        }
    }

    pub fn with_replies(replies: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Self::with_input(&[])
        }
    }
}

impl ErrorType for FakePort {
    type Error = io::Error;
}

impl Read for FakePort {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let len = buf.len().min(self.read_chunk).min(self.rx.len());

        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..len)) {
            *dst = src;
        }

        Ok(len)
    }
}

impl Write for FakePort {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let len = buf.len().min(self.write_chunk);

        self.tx.extend_from_slice(&buf[..len]);

        Ok(len)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        if let Some(reply) = self.replies.pop_front() {
            self.rx.extend(reply);
        }

        Ok(())
    }
}

impl Port for FakePort {
    fn baud_rate(&self) -> u32 {
        crate::DEFAULT_BAUD_RATE
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), Self::Error> {
        self.open = true;

        Ok(())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.open = false;

        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), Self::Error> {
        self.rx.clear();
        self.discarded += 1;

        Ok(())
    }
}

/// Simulated 1-Wire sensor.
#[derive(Clone, Debug)]
pub struct FakeSensor {
    pub address: u64,
    pub temperature: Option<f32>,
}

impl FakeSensor {
    pub fn new(address: u64, temperature: Option<f32>) -> Self {
        Self {
            address,
            temperature,
        }
    }
}

/// Simulated controller answering requests addressed to it.
#[derive(Debug)]
pub struct FakeDevice {
    pub address: u8,
    pub session_id: u32,
    pub sensors: [Vec<FakeSensor>; TRUNKS_COUNT],
    /// Sensors found by the last rescan of each trunk.
    pub found: [usize; TRUNKS_COUNT],
    pub requests: Vec<Command>,
    /// Number of upcoming requests to ignore.
    pub silent: usize,
}

impl FakeDevice {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            session_id: 0,
            sensors: Default::default(),
            found: [0; TRUNKS_COUNT],
            requests: Vec::new(),
            silent: 0,
        }
    }

    pub fn with_sensors(
        mut self,
        trunk: Trunk,
        sensors: impl IntoIterator<Item = FakeSensor>,
    ) -> Self {
        self.sensors[trunk.index()] = sensors.into_iter().take(SENSORS_PER_TRUNK).collect();
        self
    }

    pub fn count(&self, command: Command) -> usize {
        self.requests.iter().filter(|&&c| c == command).count()
    }

    fn found_sensors(&self, trunk: usize) -> &[FakeSensor] {
        &self.sensors[trunk][..self.found[trunk]]
    }

    fn respond(&mut self, req: &Request) -> Option<RawResponse> {
        self.requests.push(req.command);

        if self.silent > 0 {
            self.silent -= 1;
            return None;
        }

        let payload = &req.payload;
        let trunk = payload
            .first()
            .and_then(|&n| Trunk::new(n).ok())
            .map(Trunk::index);

        let data = match req.command {
            Command::Ping => Vec::new(),
            Command::GetSessionId => self.session_id.to_be_bytes().to_vec(),
            Command::SetSessionId => {
                self.session_id = u32::from_be_bytes(payload[..4].try_into().ok()?);
                payload.clone()
            }
            Command::RescanSensorsOnTrunk | Command::GetSensorsCountOnTrunk => {
                let trunk = trunk?;

                if req.command == Command::RescanSensorsOnTrunk {
                    self.found[trunk] = self.sensors[trunk].len();
                }

                vec![payload[0], u8::try_from(self.found[trunk]).ok()?]
            }
            Command::GetTemperatureOfSensorOnTrunk => {
                let sensor = self.found_sensors(trunk?).get(usize::from(payload[1]))?;

                [&payload[..2], &temperature_record(sensor)[..]].concat()
            }
            Command::GetTemperaturesOnTrunk => {
                let mut data = vec![payload[0]];

                for sensor in self.found_sensors(trunk?) {
                    data.extend(temperature_record(sensor));
                }

                data
            }
            Command::GetSensorUniqueAddressOnTrunk => {
                let sensor = self.found_sensors(trunk?).get(usize::from(payload[1]))?;

                [&payload[..2], &sensor.address.to_be_bytes()[..]].concat()
            }
            Command::GetSensorsUniqueAddressOnTrunk => {
                let mut data = vec![payload[0]];

                for sensor in self.found_sensors(trunk?) {
                    data.extend(address_record(sensor));
                }

                data
            }
            Command::SetControllerNewAddress => payload.clone(),
        };

        let resp = RawResponse::new(
            self.address,
            req.command as u8,
            req.sequence_id?,
            0x00,
            data,
        )
        .ok()?;

        // Answer from the old address, then move
        if req.command == Command::SetControllerNewAddress {
            self.address = payload[0];
        }

        Some(resp)
    }
}

fn temperature_record(sensor: &FakeSensor) -> Vec<u8> {
    let mut record = vec![u8::from(sensor.temperature.is_some())];

    record.extend(sensor.temperature.unwrap_or_default().to_le_bytes());
    record
}

fn address_record(sensor: &FakeSensor) -> Vec<u8> {
    let mut record = sensor.address.to_be_bytes().to_vec();

    record.push(u8::from(sensor.temperature.is_none()));
    record
}

/// Counters shared between a test and the buses it creates.
#[derive(Default, Debug)]
pub struct BusStats {
    pub created: Cell<usize>,
    pub reopened: Cell<usize>,
    pub closed: Cell<usize>,
}

/// Simulated bus with any number of controllers attached.
#[derive(Debug)]
pub struct FakeBus {
    pub devices: Vec<FakeDevice>,
    /// Writes of requests to this address fail.
    pub faulty_address: Option<u8>,
    stats: Rc<BusStats>,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
    open: bool,
}

impl FakeBus {
    pub fn new(devices: impl IntoIterator<Item = FakeDevice>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            faulty_address: None,
            stats: Rc::default(),
            pending: Vec::new(),
            rx: VecDeque::new(),
            open: true,
        }
    }

    pub fn with_stats(mut self, stats: &Rc<BusStats>) -> Self {
        self.stats = Rc::clone(stats);
        self
    }

    pub fn device(&self, address: u8) -> Option<&FakeDevice> {
        self.devices.iter().find(|device| device.address == address)
    }

    pub fn device_mut(&mut self, address: u8) -> Option<&mut FakeDevice> {
        self.devices
            .iter_mut()
            .find(|device| device.address == address)
    }

    fn dispatch(&mut self) -> Result<(), io::Error> {
        let Some(&len) = self.pending.get(REQUEST_OVERHEAD - 2) else {
            return Ok(());
        };
        let frame_len = REQUEST_OVERHEAD + usize::from(len);

        if self.pending.len() < frame_len {
            return Ok(());
        }

        let frame: Vec<u8> = self.pending.drain(..frame_len).collect();
        let Ok(req) = Request::decode(&frame) else {
            return Ok(());
        };
        let Some(address) = req.address else {
            return Ok(());
        };
        let Some(device) = self.device_mut(address) else {
            return Ok(());
        };
        let resp = device.respond(&req);

        if self.faulty_address == Some(address) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        if let Some(resp) = resp {
            self.rx.extend(resp.encode());
        }

        Ok(())
    }
}

impl ErrorType for FakeBus {
    type Error = io::Error;
}

impl Read for FakeBus {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if !self.open {
            return Err(not_connected());
        }

        let len = buf.len().min(self.rx.len());

        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..len)) {
            *dst = src;
        }

        Ok(len)
    }
}

impl Write for FakeBus {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if !self.open {
            return Err(not_connected());
        }

        self.pending.extend_from_slice(buf);
        self.dispatch()?;

        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        if self.open {
            Ok(())
        } else {
            Err(not_connected())
        }
    }
}

impl Port for FakeBus {
    fn baud_rate(&self) -> u32 {
        crate::DEFAULT_BAUD_RATE
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), Self::Error> {
        self.open = true;
        self.stats.reopened.set(self.stats.reopened.get() + 1);

        Ok(())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if self.open {
            self.open = false;
            self.pending.clear();
            self.rx.clear();
            self.stats.closed.set(self.stats.closed.get() + 1);
        }

        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), Self::Error> {
        self.rx.clear();

        Ok(())
    }
}
