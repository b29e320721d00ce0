use super::task::{Priority, Task, TaskAction};
use crate::{SENSORS_PER_TRUNK, TRUNKS_COUNT, Trunk};
use core::cmp::Reverse;
use log::trace;
use std::collections::{BTreeMap, BinaryHeap};
use tokio::time::Instant;

/// Sensor addresses of a trunk, indexed by slot.
pub type TrunkAddresses = [Option<u64>; SENSORS_PER_TRUNK];

/// Sensor temperatures of a trunk, indexed by slot.
pub type TrunkTemperatures = [Option<f32>; SENSORS_PER_TRUNK];

/// Last known state of a sensor.
#[derive(PartialEq, Clone, Debug)]
pub struct SensorInfo {
    /// Trunk the sensor was found on.
    pub trunk: Trunk,
    /// Slot of the sensor within its trunk.
    pub index: u8,
    /// 64-bit sensor address.
    pub address: u64,
    /// Whether the controller reported a problem with the sensor.
    pub error_detected: bool,
    /// Last temperature read, if any.
    pub temperature: Option<f32>,
}

/// Cached view of a controller, maintained by its [`Manager`](super::Manager).
#[derive(Default, Debug)]
pub struct Context {
    pub(super) session_id: Option<u32>,
    pub(super) last_communication_time: Option<Instant>,
    pub(super) no_response_count: u32,
    pub(super) expected_sensors_count: [Option<u8>; TRUNKS_COUNT],
    pub(super) addresses: [Option<TrunkAddresses>; TRUNKS_COUNT],
    pub(super) temperatures: [Option<TrunkTemperatures>; TRUNKS_COUNT],
    pub(super) sensors: BTreeMap<u64, SensorInfo>,
    pub(super) temperature_refresh_time: [Option<Instant>; TRUNKS_COUNT],
    tasks: BinaryHeap<Reverse<Task>>,
}

impl Context {
    /// Returns the id of the session started by the manager.
    #[must_use]
    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// Returns when the controller last answered, none while disconnected.
    #[must_use]
    pub fn last_communication_time(&self) -> Option<Instant> {
        self.last_communication_time
    }

    /// Returns the number of consecutive failed tasks.
    #[must_use]
    pub fn no_response_count(&self) -> u32 {
        self.no_response_count
    }

    /// Returns the sensor count reported by the last rescan of a trunk.
    #[must_use]
    pub fn expected_sensors_count(&self, trunk: Trunk) -> Option<u8> {
        self.expected_sensors_count[trunk.index()]
    }

    /// Returns the sensor addresses of a trunk, once read.
    #[must_use]
    pub fn addresses(&self, trunk: Trunk) -> Option<&TrunkAddresses> {
        self.addresses[trunk.index()].as_ref()
    }

    /// Returns the sensor temperatures of a trunk, once read.
    #[must_use]
    pub fn temperatures(&self, trunk: Trunk) -> Option<&TrunkTemperatures> {
        self.temperatures[trunk.index()].as_ref()
    }

    /// Returns when the temperatures of a trunk were last read.
    #[must_use]
    pub fn temperature_refresh_time(&self, trunk: Trunk) -> Option<Instant> {
        self.temperature_refresh_time[trunk.index()]
    }

    /// Iterates over all known sensors, ordered by address.
    pub fn sensors(&self) -> impl Iterator<Item = &SensorInfo> {
        self.sensors.values()
    }

    /// Returns the sensor with the given address.
    #[must_use]
    pub fn sensor(&self, address: u64) -> Option<&SensorInfo> {
        self.sensors.get(&address)
    }

    /// Returns `true` once addresses and temperatures were read for every trunk.
    #[must_use]
    pub fn has_data_for_all_trunks(&self) -> bool {
        self.addresses.iter().all(Option::is_some) && self.temperatures.iter().all(Option::is_some)
    }

    /// Forgets everything read from the controller.
    ///
    /// The session and connection state are kept.
    pub fn clear_data_retrieved_from_controller(&mut self) {
        self.expected_sensors_count = [None; TRUNKS_COUNT];
        self.addresses = [None; TRUNKS_COUNT];
        self.temperatures = [None; TRUNKS_COUNT];
        self.temperature_refresh_time = [None; TRUNKS_COUNT];
        self.sensors.clear();
    }

    /// Returns the queued tasks in the order they will run.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|Reverse(task)| *task).collect();

        tasks.sort_unstable();
        tasks
    }

    /// Returns `true` if a trunk lacks addresses, or holds fewer or more
    /// addresses than its last rescan reported.
    pub(super) fn is_missing_addresses(&self, trunk: Trunk) -> bool {
        let Some(addresses) = &self.addresses[trunk.index()] else {
            return true;
        };
        let present = addresses.iter().flatten().count();

        self.expected_sensors_count[trunk.index()].map(usize::from) != Some(present)
    }

    /// Queues a task unless an identical one is already waiting.
    pub(super) fn push_task(&mut self, priority: Priority, action: TaskAction) {
        let task = Task::new(priority, action);

        if self.tasks.iter().any(|Reverse(queued)| *queued == task) {
            return;
        }

        trace!("Queued task: {task}");

        self.tasks.push(Reverse(task));
    }

    pub(super) fn pop_task(&mut self) -> Option<Task> {
        self.tasks.pop().map(|Reverse(task)| task)
    }

    pub(super) fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub(super) fn clear_tasks(&mut self) {
        self.tasks.clear();
    }
}
