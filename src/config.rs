//! Command-line argument parsing and adapter configuration (§10 Ambient
//! Stack). Mirrors the teacher's `cli.rs`: a `clap` derive `Args` struct
//! with a colorized `--help`, converted into the runtime config the rest
//! of the crate consumes via `AdapterConfig::from_args`.

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};

use crate::cip::ethernetlink::EthernetLinkConfig;
use crate::cip::identity::DeviceIdentity;
use crate::cip::tcpip::TcpIpConfig;

/// Standard EtherNet/IP encapsulation port (Vol2 2-2.1).
pub const DEFAULT_PORT: u16 = 44818;

/// Replicates clap v3's colored `--help` styling.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// EtherNet/IP (ENIP) / CIP adapter endpoint — an industrial automation
/// server speaking the encapsulation protocol over TCP and UDP and the
/// CIP object model layered on top of it.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// IPv4 address the TCP and UDP listeners bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_address: Ipv4Addr,

    /// Encapsulation port for the TCP listener and all three UDP listeners.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Identity object attribute 1: vendor id.
    #[arg(long, default_value_t = 0)]
    pub vendor_id: u16,

    /// Identity object attribute 2: device type.
    #[arg(long, default_value_t = 0)]
    pub device_type: u16,

    /// Identity object attribute 3: product code.
    #[arg(long, default_value_t = 0)]
    pub product_code: u16,

    /// Identity object attribute 4: major revision (top bit reserved by
    /// the electronic key's compatibility flag, so kept out of range here).
    #[arg(long, default_value_t = 1)]
    pub major_revision: u8,

    /// Identity object attribute 4: minor revision.
    #[arg(long, default_value_t = 0)]
    pub minor_revision: u8,

    /// Identity object attribute 6: serial number.
    #[arg(long, default_value_t = 0)]
    pub serial_number: u32,

    /// Identity object attribute 7: product name.
    #[arg(long, default_value = "Generic EtherNet/IP Adapter")]
    pub product_name: String,

    /// TCP/IP Interface object attribute 6: hostname.
    #[arg(long, default_value = "")]
    pub hostname: String,

    /// TCP/IP Interface object attribute 8: default multicast TTL.
    #[arg(long, default_value_t = 1)]
    pub multicast_ttl: u8,

    /// TCP/IP Interface object attribute 13: idle-session timeout, seconds.
    #[arg(long, default_value_t = 120)]
    pub inactivity_timeout_secs: u32,

    /// Ethernet Link object attribute 1: reported link speed, Mbps.
    #[arg(long, default_value_t = 100)]
    pub link_speed_mbps: u32,

    /// Ethernet Link object attribute 3: physical (MAC) address, as six
    /// colon-separated hex octets.
    #[arg(long, default_value = "00:00:00:00:00:00")]
    pub mac_address: String,

    /// Number of Class 1 (cyclic I/O) connections the pool can hold.
    #[arg(long, default_value_t = 8)]
    pub class1_capacity: usize,

    /// Number of Class 3 (explicit) connections the pool can hold.
    #[arg(long, default_value_t = 8)]
    pub class3_capacity: usize,

    /// Coarse timer tick driving watchdog/production scans, in
    /// microseconds (§4.I, §4.J).
    #[arg(long, default_value_t = 500)]
    pub timer_tick_micros: u64,

    /// Lowest RPI this adapter will accept on a Forward-Open, in
    /// microseconds. Requests below it fail with RPIValuesNotAcceptable.
    #[arg(long, default_value_t = 1_000)]
    pub min_rpi_usecs: u32,

    /// Highest RPI this adapter will accept on a Forward-Open, in
    /// microseconds.
    #[arg(long, default_value_t = 3_600_000_000)]
    pub max_rpi_usecs: u32,

    /// Size of the shared reply buffer, in bytes. Every service response
    /// must fit within this (§3 Invariants).
    #[arg(long, default_value_t = 1400)]
    pub reply_buffer_size: usize,

    /// Increase log verbosity: unset = info, -v = debug, -vv = trace.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the colorized stdout log layer; file logging is unaffected.
    #[arg(long)]
    pub quiet: bool,

    /// Path to the detailed log file, or "stderr" to log there instead of
    /// to a rotating file.
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Parses a `xx:xx:xx:xx:xx:xx` MAC address into six octets. Returns the
/// zero address on any malformed input, matching the CLI's tolerance for
/// an unset/default value rather than failing adapter startup over a
/// cosmetic attribute.
fn parse_mac(s: &str) -> [u8; 6] {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() == 6 {
        for (i, part) in parts.iter().enumerate() {
            if let Ok(byte) = u8::from_str_radix(part, 16) {
                mac[i] = byte;
            }
        }
    }
    mac
}

/// The runtime configuration the adapter is constructed from: device
/// identity, the bindable objects' attribute seeds, and the network
/// handler's tunables. Built once from [`Args`] at startup.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub bind_address: Ipv4Addr,
    pub port: u16,
    pub identity: DeviceIdentity,
    pub tcpip: TcpIpConfig,
    pub ethernet_link: EthernetLinkConfig,
    pub class1_capacity: usize,
    pub class3_capacity: usize,
    pub timer_tick: Duration,
    pub reply_buffer_size: usize,
    pub min_rpi_usecs: u32,
    pub max_rpi_usecs: u32,
}

impl AdapterConfig {
    pub fn from_args(args: &Args) -> Self {
        AdapterConfig {
            bind_address: args.bind_address,
            port: args.port,
            identity: DeviceIdentity {
                vendor_id: args.vendor_id,
                device_type: args.device_type,
                product_code: args.product_code,
                major_revision: args.major_revision,
                minor_revision: args.minor_revision,
                serial_number: args.serial_number,
                product_name: args.product_name.clone(),
            },
            tcpip: TcpIpConfig {
                ip: args.bind_address,
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::UNSPECIFIED,
                hostname: args.hostname.clone(),
                ttl_value: args.multicast_ttl,
                inactivity_timeout_secs: args.inactivity_timeout_secs,
            },
            ethernet_link: EthernetLinkConfig {
                interface_speed_mbps: args.link_speed_mbps,
                flags: crate::cip::ethernetlink::FLAG_LINK_UP
                    | crate::cip::ethernetlink::FLAG_FULL_DUPLEX,
                mac_address: parse_mac(&args.mac_address),
            },
            class1_capacity: args.class1_capacity,
            class3_capacity: args.class3_capacity,
            timer_tick: Duration::from_micros(args.timer_tick_micros),
            reply_buffer_size: args.reply_buffer_size,
            min_rpi_usecs: args.min_rpi_usecs,
            max_rpi_usecs: args.max_rpi_usecs,
        }
    }
}
