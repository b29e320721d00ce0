use clap::Parser;
use log::info;
use std::{error::Error, time::Duration};
use tokio::time;
use vrc_t70::{
    Communicator, DEFAULT_BAUD_RATE, Trunk, communicator,
    manager::{self, EventHandler, Manager, TrunkAddresses, TrunkTemperatures},
    port::{self, PortManager},
    serial::SerialOpener,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    speed: u32,

    /// Controller addresses, may be repeated
    #[arg(short, long, default_value = "1", num_args = 1..)]
    address: Vec<u8>,

    /// Time each round may spend talking to the controllers, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    max_time_to_talk: u64,

    /// Pause between rounds, in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval: u64,
}

/// Logs every event.
struct Printer;

impl EventHandler for Printer {
    fn controller_connected(&mut self, controller_address: u8) {
        info!("[{controller_address:#04x}] connected");
    }

    fn controller_disconnected(&mut self, controller_address: u8) {
        info!("[{controller_address:#04x}] disconnected");
    }

    fn sensors_count_received(&mut self, controller_address: u8, trunk: Trunk, count: u8) {
        info!("[{controller_address:#04x}] trunk {trunk}: {count} sensors");
    }

    fn addresses_received(
        &mut self,
        controller_address: u8,
        trunk: Trunk,
        addresses: &TrunkAddresses,
    ) {
        for (index, address) in addresses.iter().enumerate() {
            if let Some(address) = address {
                info!("[{controller_address:#04x}] trunk {trunk}, sensor {index}: {address:016x}");
            }
        }
    }

    fn temperatures_received(
        &mut self,
        controller_address: u8,
        trunk: Trunk,
        temperatures: &TrunkTemperatures,
    ) {
        let readings: Vec<String> = temperatures
            .iter()
            .map(|temp| temp.map_or_else(|| "-".to_string(), |temp| format!("{temp:.2}")))
            .collect();

        info!(
            "[{controller_address:#04x}] trunk {trunk}: {}",
            readings.join(" ")
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let managers = args
        .address
        .iter()
        .map(|&address| {
            let comm = Communicator::new(address, communicator::Options::default())?;

            Ok(Manager::new(comm, manager::Options::default(), Printer))
        })
        .collect::<Result<Vec<_>, vrc_t70::codec::Error>>()?;
    let mut ports = PortManager::new(
        SerialOpener::new(&args.port, args.speed),
        managers,
        port::Options::default(),
    );
    let max_time_to_talk = Duration::from_millis(args.max_time_to_talk);
    let interval = Duration::from_millis(args.interval);

    loop {
        ports.communicate(Some(max_time_to_talk)).await;
        time::sleep(interval).await;
    }
}
