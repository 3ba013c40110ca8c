//! Command-line argument parsing

use clap::Parser;
use uuid::Uuid;

use crate::uuids::parse_uuid;

#[derive(Parser, Debug, Clone)]
#[clap(name = "ble-central", version, author)]
#[clap(about = "Scan for, connect to and explore Bluetooth LE peripherals")]
pub struct CliArgs {
    /// Bluetooth adapter name (default adapter if omitted)
    #[clap(short, long)]
    pub adapter: Option<String>,

    /// Only report peripherals advertising this service (16-bit or full UUID)
    #[clap(short, long = "service", value_parser = parse_uuid)]
    pub services: Vec<Uuid>,

    /// Only discover these characteristics (16-bit or full UUID)
    #[clap(long = "characteristic", value_parser = parse_uuid)]
    pub characteristics: Vec<Uuid>,

    /// Scan duration in seconds, 0 scans until interrupted
    #[clap(short = 't', long, default_value = "30")]
    pub scan_timeout: u64,

    /// Report every advertisement instead of once per device
    #[clap(long)]
    pub allow_duplicates: bool,

    /// Peripheral to connect to, by address or advertised name
    #[clap(short, long)]
    pub connect: Option<String>,

    /// Reconnect whenever the link drops
    #[clap(long)]
    pub auto_reconnect: bool,

    /// Also discover characteristic descriptors
    #[clap(long)]
    pub descriptors: bool,

    /// Read every readable characteristic after discovery
    #[clap(short, long)]
    pub read: bool,

    /// Stream notifications of every notifying characteristic
    #[clap(long)]
    pub subscribe: bool,

    /// Print results as JSON lines
    #[clap(long)]
    pub json: bool,
}
