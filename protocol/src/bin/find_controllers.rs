use clap::Parser;
use log::{info, warn};
use std::{collections::BTreeSet, error::Error, time::Instant};
use vrc_t70::{Communicator, DEFAULT_BAUD_RATE, communicator::Options, serial};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    speed: u32,

    /// First controller address to probe
    #[arg(long, default_value_t = 1)]
    min: u8,

    /// Last controller address to probe
    #[arg(long, default_value_t = 254)]
    max: u8,

    /// Number of pings sent to each address
    #[arg(short, long, default_value_t = 3)]
    retries: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut port = serial::open(&args.port, args.speed)?;
    let mut comm = Communicator::new(
        args.min,
        Options {
            retries: args.retries,
            strict_address: true,
            ..Options::default()
        },
    )?;
    let mut found = BTreeSet::new();
    let started = Instant::now();

    info!("Searching for controllers");

    for address in args.min..=args.max {
        comm.set_address(address)?;

        match comm.ping(&mut port).await {
            Ok(()) => {
                info!("Controller found at address {address}");
                found.insert(address);
            }
            // Another controller answered, probably with a corrupted request address
            Err(vrc_t70::Error::WrongAddress { received, .. }) => {
                found.insert(received);
            }
            Err(vrc_t70::Error::NoResponse) => {}
            Err(err) => return Err(err.into()),
        }
    }

    info!("Scan finished in {:.2?}", started.elapsed());

    if found.is_empty() {
        warn!("No controllers found");
        return Ok(());
    }

    println!("{:>5} | {:>4}", "dec", "hex");

    for address in found {
        println!("{address:>5} | {address:#04x}");
    }

    Ok(())
}
