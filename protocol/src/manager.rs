//! Continuous polling of a single controller.
//!
//! A [`Manager`] keeps a cached [`Context`] of everything read from its
//! controller and decides which requests to send next. Each call to
//! [`Manager::communicate`] first schedules new work, then runs queued
//! tasks by priority:
//!
//! 1. Without a live connection or session, everything queued is dropped
//!    and a bootstrap starts a new session and rescans every trunk.
//! 2. Once every trunk has been read, temperatures are refreshed periodically.
//! 3. Trunks with missing addresses or temperatures are read again, or
//!    rescanned if both are missing.
//! 4. Otherwise, the controller is pinged periodically to detect disconnects.

mod context;
mod task;

pub use context::{Context, SensorInfo, TrunkAddresses, TrunkTemperatures};
pub use task::{Priority, Task, TaskAction};

use crate::{Communicator, Error, Result, SENSORS_PER_TRUNK, SESSION_IDS, Trunk, port::Port};
use core::time::Duration;
use log::{debug, info, warn};
use rand::Rng;
use tokio::time::Instant;

/// Manager settings.
#[derive(Clone, Debug)]
pub struct Options {
    /// Idle time after which the controller is pinged.
    pub interval_between_pings: Duration,
    /// Age after which the temperatures of a trunk are read again.
    pub interval_between_temperature_refresh: Duration,
    /// Number of consecutive failed tasks after which the controller
    /// is considered disconnected.
    pub missed_communications_before_disconnect: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval_between_pings: Duration::from_secs(3),
            interval_between_temperature_refresh: Duration::from_secs(10),
            missed_communications_before_disconnect: 6,
        }
    }
}

/// Receives notifications about a controller.
///
/// All methods do nothing by default.
#[allow(unused_variables)]
pub trait EventHandler {
    /// Called when the controller answers for the first time, or again after a disconnect.
    fn controller_connected(&mut self, controller_address: u8) {}

    /// Called when the controller stops answering.
    fn controller_disconnected(&mut self, controller_address: u8) {}

    /// Called after a trunk was rescanned.
    fn sensors_count_received(&mut self, controller_address: u8, trunk: Trunk, count: u8) {}

    /// Called after the sensor addresses of a trunk were read.
    fn addresses_received(
        &mut self,
        controller_address: u8,
        trunk: Trunk,
        addresses: &TrunkAddresses,
    ) {
    }

    /// Called after the temperatures of a trunk were read.
    fn temperatures_received(
        &mut self,
        controller_address: u8,
        trunk: Trunk,
        temperatures: &TrunkTemperatures,
    ) {
    }
}

impl EventHandler for () {}

/// Polls a single controller and caches its state.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use vrc_t70::{Communicator, communicator, manager::{self, Manager}};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut port = vrc_t70::serial::open("/dev/ttyUSB0", vrc_t70::DEFAULT_BAUD_RATE)?;
/// let comm = Communicator::new(1, communicator::Options::default())?;
/// let mut manager = Manager::new(comm, manager::Options::default(), ());
///
/// loop {
///     manager.communicate(&mut port, Some(Duration::from_secs(1))).await?;
///
///     for sensor in manager.context().sensors() {
///         println!("{:016x}: {:?}", sensor.address, sensor.temperature);
///     }
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct Manager<H> {
    communicator: Communicator,
    options: Options,
    handler: H,
    context: Context,
}

impl<H: EventHandler> Manager<H> {
    /// Constructs a manager.
    ///
    /// Sequence id validation is disabled on the communicator,
    /// as controllers sharing a bus answer strictly in order.
    pub fn new(mut communicator: Communicator, options: Options, handler: H) -> Self {
        communicator.options_mut().validate_sequence_id = false;

        Self {
            communicator,
            options,
            handler,
            context: Context::default(),
        }
    }

    /// Returns the address of the managed controller.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.communicator.address()
    }

    /// Returns `true` while the controller answers.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.context.last_communication_time.is_some()
    }

    /// Returns the cached controller state.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns the manager settings.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns the underlying communicator.
    #[must_use]
    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// Returns the underlying communicator for modification.
    pub fn communicator_mut(&mut self) -> &mut Communicator {
        &mut self.communicator
    }

    /// Returns the event handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns the event handler for modification.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Schedules new tasks and runs queued ones by priority.
    ///
    /// Stops once the queue is empty or the optional time budget is used up.
    /// The budget is checked between tasks, so the last task may overrun it.
    /// Tasks that fail are dropped and count towards a disconnect.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the port fails. The running task is dropped.
    pub async fn communicate<P: Port>(
        &mut self,
        port: &mut P,
        max_time_to_talk: Option<Duration>,
    ) -> Result<(), P::Error> {
        let started = Instant::now();

        self.add_tasks();

        while let Some(task) = self.context.pop_task() {
            debug!("Controller {:#04x} running {task}", self.address());

            match self.run(port, task.action).await {
                Ok(()) => self.communication_succeeded(),
                Err(Error::Io(err)) => return Err(Error::Io(err)),
                Err(err) => {
                    warn!("Controller {:#04x} failed {task}: {err:?}", self.address());
                    self.communication_failed();
                }
            }

            if max_time_to_talk.is_some_and(|max| started.elapsed() >= max) {
                debug!("Controller {:#04x} used up its time", self.address());
                break;
            }
        }

        Ok(())
    }

    fn add_tasks(&mut self) {
        let ctx = &mut self.context;
        let now = Instant::now();

        if ctx.last_communication_time.is_none() || ctx.session_id.is_none() {
            ctx.clear_tasks();
            ctx.push_task(Priority::High, TaskAction::Bootstrap);
            return;
        }

        if ctx.has_data_for_all_trunks() {
            let interval = self.options.interval_between_temperature_refresh;
            let mut refreshing = false;

            for trunk in Trunk::all() {
                let due = ctx.temperature_refresh_time[trunk.index()]
                    .is_none_or(|time| now.duration_since(time) >= interval);

                if due {
                    ctx.push_task(Priority::Low, TaskAction::QueryTemperatures(trunk));
                    refreshing = true;
                }
            }

            if refreshing {
                return;
            }
        }

        if !ctx.has_tasks() && !ctx.has_data_for_all_trunks() {
            for trunk in Trunk::all() {
                let missing_addresses = ctx.is_missing_addresses(trunk);
                let missing_temperatures = ctx.temperatures[trunk.index()].is_none();

                match (missing_addresses, missing_temperatures) {
                    (true, true) => ctx.push_task(Priority::High, TaskAction::Rescan(trunk)),
                    (true, false) => {
                        ctx.push_task(Priority::Medium, TaskAction::QueryAddresses(trunk));
                    }
                    (false, true) => {
                        ctx.push_task(Priority::Low, TaskAction::QueryTemperatures(trunk));
                    }
                    (false, false) => {}
                }
            }

            if ctx.has_tasks() {
                return;
            }
        }

        let ping_due = ctx
            .last_communication_time
            .is_none_or(|time| now.duration_since(time) >= self.options.interval_between_pings);

        if !ctx.has_tasks() && ping_due {
            ctx.push_task(Priority::UltraLow, TaskAction::Ping);
        }
    }

    async fn run<P: Port>(&mut self, port: &mut P, action: TaskAction) -> Result<(), P::Error> {
        match action {
            TaskAction::Bootstrap => self.bootstrap(port).await,
            TaskAction::Rescan(trunk) => self.rescan(port, trunk).await,
            TaskAction::QueryAddresses(trunk) => self.query_addresses(port, trunk).await,
            TaskAction::QueryTemperatures(trunk) => self.query_temperatures(port, trunk).await,
            TaskAction::Ping => self.communicator.ping(port).await,
        }
    }

    async fn bootstrap<P: Port>(&mut self, port: &mut P) -> Result<(), P::Error> {
        self.context.clear_data_retrieved_from_controller();

        let session_id = random_session_id(self.context.session_id);
        let session_id = self.communicator.set_session_id(port, session_id).await?;

        info!(
            "Controller {:#04x} started session {session_id:#010x}",
            self.address()
        );

        self.context.session_id = Some(session_id);

        for trunk in Trunk::all() {
            self.context.push_task(Priority::High, TaskAction::Rescan(trunk));
        }

        Ok(())
    }

    async fn rescan<P: Port>(&mut self, port: &mut P, trunk: Trunk) -> Result<(), P::Error> {
        let count = self
            .communicator
            .rescan_sensors_on_trunk(port, trunk)
            .await?;

        info!(
            "Controller {:#04x} found {count} sensors on trunk {trunk}",
            self.address()
        );

        self.context.expected_sensors_count[trunk.index()] = Some(count);
        self.context.push_task(Priority::Medium, TaskAction::QueryAddresses(trunk));
        self.context.push_task(Priority::Low, TaskAction::QueryTemperatures(trunk));
        self.handler
            .sensors_count_received(self.communicator.address(), trunk, count);

        Ok(())
    }

    async fn query_addresses<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
    ) -> Result<(), P::Error> {
        let sensors = self
            .communicator
            .get_sensors_unique_address_on_trunk(port, trunk)
            .await?;
        let mut addresses = [None; SENSORS_PER_TRUNK];

        for sensor in sensors {
            addresses[usize::from(sensor.index)] = Some(sensor.address);

            self.context
                .sensors
                .entry(sensor.address)
                .and_modify(|info| info.error_detected = sensor.error_detected)
                .or_insert(SensorInfo {
                    trunk,
                    index: sensor.index,
                    address: sensor.address,
                    error_detected: sensor.error_detected,
                    temperature: None,
                });
        }

        self.context.addresses[trunk.index()] = Some(addresses);
        self.handler
            .addresses_received(self.communicator.address(), trunk, &addresses);

        Ok(())
    }

    async fn query_temperatures<P: Port>(
        &mut self,
        port: &mut P,
        trunk: Trunk,
    ) -> Result<(), P::Error> {
        let sensors = self
            .communicator
            .get_temperatures_on_trunk(port, trunk)
            .await?;
        let known = self.context.addresses[trunk.index()].unwrap_or_default();
        let mut temperatures = [None; SENSORS_PER_TRUNK];

        for sensor in sensors {
            let index = usize::from(sensor.index);

            temperatures[index] = sensor.temperature;

            let info = known[index].and_then(|address| self.context.sensors.get_mut(&address));

            if let Some(info) = info {
                info.temperature = sensor.temperature;
                info.error_detected = !sensor.connected;
            }
        }

        self.context.temperatures[trunk.index()] = Some(temperatures);
        self.handler
            .temperatures_received(self.communicator.address(), trunk, &temperatures);
        self.context.temperature_refresh_time[trunk.index()] = Some(Instant::now());

        Ok(())
    }

    fn communication_succeeded(&mut self) {
        let reconnected = self.context.last_communication_time.is_none();

        self.context.last_communication_time = Some(Instant::now());
        self.context.no_response_count = 0;

        if reconnected {
            info!("Controller {:#04x} connected", self.address());
            self.handler.controller_connected(self.communicator.address());
        }
    }

    fn communication_failed(&mut self) {
        self.context.no_response_count += 1;

        if self.context.no_response_count == self.options.missed_communications_before_disconnect {
            warn!("Controller {:#04x} disconnected", self.address());

            self.context.last_communication_time = None;
            self.handler
                .controller_disconnected(self.communicator.address());
        }
    }
}

/// Picks a random session id, avoiding the given one.
#[must_use]
pub fn random_session_id(forbidden: Option<u32>) -> u32 {
    let mut rng = rand::thread_rng();

    loop {
        let session_id = rng.gen_range(SESSION_IDS);

        if Some(session_id) != forbidden {
            return session_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Command, communicator,
        fake::{FakeBus, FakeDevice, FakeSensor},
        tests::init_logger,
    };
    use tokio::time;

    #[derive(Default, Debug)]
    struct Recorder {
        connected: usize,
        disconnected: usize,
        counts: Vec<(Trunk, u8)>,
        addresses: Vec<Trunk>,
        temperatures: Vec<Trunk>,
    }

    impl EventHandler for Recorder {
        fn controller_connected(&mut self, _controller_address: u8) {
            self.connected += 1;
        }

        fn controller_disconnected(&mut self, _controller_address: u8) {
            self.disconnected += 1;
        }

        fn sensors_count_received(&mut self, _controller_address: u8, trunk: Trunk, count: u8) {
            self.counts.push((trunk, count));
        }

        fn addresses_received(
            &mut self,
            _controller_address: u8,
            trunk: Trunk,
            _: &TrunkAddresses,
        ) {
            self.addresses.push(trunk);
        }

        fn temperatures_received(
            &mut self,
            _controller_address: u8,
            trunk: Trunk,
            _: &TrunkTemperatures,
        ) {
            self.temperatures.push(trunk);
        }
    }

    const ADDRESSES: [u64; 3] = [
        0x28ff_2c7d_9015_01c1,
        0x28ff_fd7f_9015_0155,
        0x28ff_6f31_9015_04ab,
    ];

    fn trunk(number: u8) -> Trunk {
        Trunk::new(number).expect("trunk number should be valid")
    }

    fn manager_with(options: Options) -> Manager<Recorder> {
        let comm = Communicator::new(1, communicator::Options::default())
            .expect("address should be valid");

        Manager::new(comm, options, Recorder::default())
    }

    fn manager() -> Manager<Recorder> {
        manager_with(Options::default())
    }

    fn bus() -> FakeBus {
        FakeBus::new([FakeDevice::new(1).with_sensors(
            trunk(2),
            [
                FakeSensor::new(ADDRESSES[0], Some(21.5)),
                FakeSensor::new(ADDRESSES[1], None),
                FakeSensor::new(ADDRESSES[2], Some(-0.5)),
            ],
        )])
    }

    fn device(bus: &FakeBus) -> &FakeDevice {
        bus.device(1).expect("device should be attached")
    }

    #[test]
    fn sequence_validation_is_disabled() {
        assert!(
            !manager().communicator().options().validate_sequence_id,
            "manager should accept any sequence id"
        );
    }

    #[test]
    fn bootstrap_first() {
        let mut manager = manager();

        manager.add_tasks();

        assert_eq!(
            manager.context().pending_tasks(),
            [Task::new(Priority::High, TaskAction::Bootstrap)],
            "fresh manager should only bootstrap"
        );
    }

    #[test]
    fn bootstrap_replaces_queued_tasks() {
        let mut manager = manager();
        let ctx = &mut manager.context;

        ctx.session_id = Some(0x1234);
        ctx.expected_sensors_count[1] = Some(2);
        ctx.addresses[1] = Some([None; SENSORS_PER_TRUNK]);
        ctx.temperatures[4] = Some([Some(20.0); SENSORS_PER_TRUNK]);
        ctx.push_task(Priority::Medium, TaskAction::QueryAddresses(trunk(2)));
        ctx.push_task(Priority::Low, TaskAction::QueryTemperatures(trunk(5)));
        ctx.push_task(Priority::UltraLow, TaskAction::Ping);

        manager.add_tasks();

        assert_eq!(
            manager.context().pending_tasks(),
            [Task::new(Priority::High, TaskAction::Bootstrap)],
            "unconnected controller should drop queued work and bootstrap"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_scan() -> core::result::Result<(), Box<dyn std::error::Error>> {
        init_logger();

        let mut bus = bus();
        let mut manager = manager();

        manager.communicate(&mut bus, None).await?;

        let ctx = manager.context();

        assert!(manager.is_connected(), "controller should be connected");
        assert_eq!(
            ctx.session_id(),
            Some(device(&bus).session_id),
            "session should be stored"
        );
        assert!(ctx.has_data_for_all_trunks(), "every trunk should be read");
        assert!(ctx.pending_tasks().is_empty(), "queue should be drained");
        assert_eq!(
            ctx.addresses(trunk(2)),
            Some(&[
                Some(ADDRESSES[0]),
                Some(ADDRESSES[1]),
                Some(ADDRESSES[2]),
                None,
                None,
                None,
                None,
                None,
                None,
                None
            ]),
            "addresses should fill the first three slots"
        );
        assert_eq!(
            ctx.temperatures(trunk(2)).map(|t| t[..4].to_vec()),
            Some(vec![Some(21.5), None, Some(-0.5), None]),
            "temperatures should fill the first three slots"
        );
        assert_eq!(
            ctx.addresses(trunk(1)),
            Some(&[None; SENSORS_PER_TRUNK]),
            "empty trunk should have no addresses"
        );
        assert_eq!(ctx.sensors().count(), 3, "every sensor should be recorded");
        assert_eq!(
            ctx.sensor(ADDRESSES[1]).map(|s| (s.index, s.error_detected, s.temperature)),
            Some((1, true, None)),
            "disconnected sensor should be flagged"
        );
        assert_eq!(
            ctx.sensor(ADDRESSES[2]).map(|s| (s.trunk, s.temperature)),
            Some((trunk(2), Some(-0.5))),
            "temperature should be stored on the sensor"
        );

        let events = manager.handler();

        assert_eq!(events.connected, 1, "connection should be reported once");
        assert_eq!(
            events.counts,
            Trunk::all()
                .map(|t| (t, if t == trunk(2) { 3 } else { 0 }))
                .collect::<Vec<_>>(),
            "every trunk should be rescanned in order"
        );
        assert_eq!(
            events.addresses.len(),
            7,
            "every trunk should report addresses"
        );
        assert_eq!(
            events.temperatures.len(),
            7,
            "every trunk should report temperatures"
        );
        assert_eq!(
            device(&bus).count(Command::Ping),
            0,
            "no ping should be needed"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn steady_state_is_quiet() -> core::result::Result<(), Box<dyn std::error::Error>> {
        init_logger();

        let mut bus = bus();
        let mut manager = manager();

        manager.communicate(&mut bus, None).await?;

        let requests = device(&bus).requests.len();

        manager.communicate(&mut bus, None).await?;

        assert_eq!(
            device(&bus).requests.len(),
            requests,
            "nothing should be sent while data is fresh"
        );

        time::sleep(Duration::from_secs(3)).await;
        manager.communicate(&mut bus, None).await?;

        assert_eq!(
            device(&bus).count(Command::Ping),
            1,
            "idle controller should be pinged"
        );

        time::sleep(Duration::from_secs(7)).await;
        manager.communicate(&mut bus, None).await?;

        assert_eq!(
            device(&bus).count(Command::GetTemperaturesOnTrunk),
            14,
            "stale temperatures should be refreshed on every trunk"
        );
        assert_eq!(
            device(&bus).count(Command::Ping),
            1,
            "refresh should replace the ping"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_checked_between_tasks()
    -> core::result::Result<(), Box<dyn std::error::Error>> {
        init_logger();

        let mut bus = bus();
        let mut manager = manager();

        manager.communicate(&mut bus, Some(Duration::ZERO)).await?;

        assert!(manager.context().session_id().is_some(), "bootstrap should run");
        assert_eq!(
            manager.context().pending_tasks(),
            Trunk::all()
                .map(|t| Task::new(Priority::High, TaskAction::Rescan(t)))
                .collect::<Vec<_>>(),
            "rescans should wait for the next call"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn no_ping_while_tasks_are_queued()
    -> core::result::Result<(), Box<dyn std::error::Error>> {
        init_logger();

        let mut bus = bus();
        let mut manager = manager();

        manager.communicate(&mut bus, Some(Duration::ZERO)).await?;

        let queued = manager.context().pending_tasks();

        time::sleep(Duration::from_secs(4)).await;
        manager.add_tasks();

        assert_eq!(
            manager.context().pending_tasks(),
            queued,
            "queued work should not be joined by a ping"
        );

        manager.communicate(&mut bus, None).await?;

        assert_eq!(
            device(&bus).count(Command::Ping),
            0,
            "busy controller should not be pinged"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_and_reconnect() -> core::result::Result<(), Box<dyn std::error::Error>> {
        init_logger();

        let mut bus = bus();
        let mut manager = manager_with(Options {
            interval_between_temperature_refresh: Duration::from_secs(3600),
            ..Options::default()
        });

        manager.communicate(&mut bus, None).await?;

        let session_id = manager.context().session_id();

        bus.device_mut(1).expect("device should be attached").silent = usize::MAX;

        for _ in 0..6 {
            time::sleep(Duration::from_secs(3)).await;
            manager.communicate(&mut bus, None).await?;
        }

        assert!(!manager.is_connected(), "controller should be disconnected");
        assert_eq!(
            manager.handler().disconnected,
            1,
            "disconnect should be reported once"
        );
        assert_eq!(
            manager.context().no_response_count(),
            6,
            "every ping should have failed"
        );

        manager.add_tasks();

        assert_eq!(
            manager.context().pending_tasks(),
            [Task::new(Priority::High, TaskAction::Bootstrap)],
            "disconnected controller should be bootstrapped again"
        );

        bus.device_mut(1).expect("device should be attached").silent = 0;
        manager.communicate(&mut bus, None).await?;

        assert!(manager.is_connected(), "controller should reconnect");
        assert_eq!(manager.handler().connected, 2, "reconnect should be reported");
        assert_ne!(
            manager.context().session_id(),
            session_id,
            "new session should be started"
        );
        assert_eq!(manager.context().no_response_count(), 0);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_data_is_requested_again()
    -> core::result::Result<(), Box<dyn std::error::Error>> {
        init_logger();

        let mut bus = bus();
        let mut manager = manager();

        manager.communicate(&mut bus, None).await?;

        let ctx = &mut manager.context;

        // Sensor count disagrees with the addresses read
        ctx.expected_sensors_count[0] = Some(1);
        ctx.addresses[1] = None;
        ctx.temperatures[2] = None;
        ctx.addresses[3] = None;
        ctx.temperatures[3] = None;

        manager.add_tasks();

        assert_eq!(
            manager.context().pending_tasks(),
            [
                Task::new(Priority::High, TaskAction::Rescan(trunk(4))),
                Task::new(Priority::Medium, TaskAction::QueryAddresses(trunk(1))),
                Task::new(Priority::Medium, TaskAction::QueryAddresses(trunk(2))),
                Task::new(Priority::Low, TaskAction::QueryTemperatures(trunk(3))),
            ],
            "missing data should be requested by urgency"
        );

        Ok(())
    }

    #[test]
    fn session_ids() {
        for _ in 0..1000 {
            let session_id = random_session_id(Some(1));

            assert!(SESSION_IDS.contains(&session_id), "session id should be valid");
            assert_ne!(session_id, 1, "forbidden session id should be avoided");
        }
    }
}
