use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::ble::DeviceScript;
use crate::mesh::{AddressError, DeviceAddress, UnicastAddress};

/// Errors returned while parsing fake mesh fixtures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FixtureError {
    #[error("the fake mesh fixture is empty")]
    EmptyFixture,
    #[error("fixture records need an `address|nodes` shape, got `{record}`")]
    InvalidRecordShape { record: String },
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("fixture node `{value}` is not a mesh address")]
    InvalidNode { value: String },
}

/// Command-line options for the mesh fleet tool.
#[derive(Debug, Parser)]
#[command(name = "meshfleet", about = "Control and update mesh devices over a BLE proxy.")]
pub struct Args {
    /// Minimum log level applied when RUST_LOG is unset.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Emits machine-readable JSON lines instead of text output.
    #[arg(long, global = true)]
    json: bool,
    /// Network key as 32 hex characters.
    #[arg(long, global = true)]
    net_key: Option<String>,
    /// Application key as 32 hex characters.
    #[arg(long, global = true)]
    app_key: Option<String>,
    /// Uses the fake loopback transport with scripted devices.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake device scripts in the form `address|unicast,unicast;...`.
    #[arg(long, global = true, requires = "fake")]
    fake_mesh: Option<MeshFixture>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Returns the requested log level, if any.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Splits parsed arguments into the command and run-wide options.
    #[must_use]
    pub fn into_parts(self) -> (Command, RunOptions) {
        let Args {
            log_level: _,
            json,
            net_key,
            app_key,
            fake,
            fake_mesh,
            command,
        } = self;

        let fake_devices = if fake {
            Some(fake_mesh.map(MeshFixture::into_scripts).unwrap_or_default())
        } else {
            None
        };

        (
            command,
            RunOptions {
                json,
                net_key,
                app_key,
                fake_devices,
            },
        )
    }
}

/// Run-wide options shared by every command.
#[derive(Debug)]
pub struct RunOptions {
    pub json: bool,
    pub net_key: Option<String>,
    pub app_key: Option<String>,
    /// `Some` selects the fake transport, pre-loaded with these scripts.
    pub fake_devices: Option<Vec<DeviceScript>>,
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Switch a group or a single device on.
    On(TargetArgs),
    /// Switch a group or a single device off.
    Off(TargetArgs),
    /// Probe a group and report which members confirm.
    Discover(DiscoverArgs),
    /// Upload firmware to a set of devices through the update queue.
    Update(UpdateArgs),
}

/// Destination and reply-collection options for on/off commands.
#[derive(Debug, clap::Args)]
pub struct TargetArgs {
    /// Proxy candidate address to connect through.
    #[arg(long)]
    pub proxy: String,
    /// Additional fallback candidate addresses.
    #[arg(long, value_delimiter = ',')]
    pub candidates: Vec<String>,
    /// Group destination, e.g. `0xC001`.
    #[arg(long, value_parser = parse_mesh_address, conflicts_with = "unicast")]
    pub group: Option<u16>,
    /// Unicast destination, e.g. `0x0005`.
    #[arg(long, value_parser = parse_mesh_address)]
    pub unicast: Option<u16>,
    /// Unicast addresses whitelisted for status replies.
    #[arg(long, value_delimiter = ',', value_parser = parse_mesh_address)]
    pub expect: Vec<u16>,
    /// How long to collect status replies, e.g. `3s`.
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    pub reply_window: Duration,
}

/// Options for group-membership discovery.
#[derive(Debug, clap::Args)]
pub struct DiscoverArgs {
    /// Proxy candidate address to connect through.
    #[arg(long)]
    pub proxy: String,
    /// Additional fallback candidate addresses.
    #[arg(long, value_delimiter = ',')]
    pub candidates: Vec<String>,
    /// Group to probe, e.g. `0xC001`.
    #[arg(long, value_parser = parse_mesh_address)]
    pub group: u16,
    /// State to probe the group with.
    #[arg(long, value_enum, default_value = "on")]
    pub probe_state: SwitchState,
    /// Unicast addresses whitelisted for status replies.
    #[arg(long, value_delimiter = ',', value_parser = parse_mesh_address)]
    pub expect: Vec<u16>,
    /// How long to collect confirmations, e.g. `3s`.
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    pub reply_window: Duration,
}

/// Options for a firmware update run.
#[derive(Debug, clap::Args)]
pub struct UpdateArgs {
    /// Firmware image file.
    #[arg(long)]
    pub firmware: PathBuf,
    /// Version label recorded for the image.
    #[arg(long, default_value = "0.0.0")]
    pub fw_version: String,
    /// Hardware id the image applies to.
    #[arg(long)]
    pub hardware_id: String,
    /// Devices as comma-separated `address=hardware_id` pairs.
    #[arg(long, value_delimiter = ',')]
    pub devices: Vec<String>,
    /// Cap on simultaneous transfers.
    #[arg(long, default_value_t = 3)]
    pub max_concurrent: usize,
}

/// On/off state argument.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    /// Returns the boolean the mesh model expects.
    #[must_use]
    pub fn as_bool(self) -> bool {
        matches!(self, Self::On)
    }
}

/// Log level override for telemetry initialisation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the `EnvFilter` directive for this level.
    #[must_use]
    pub fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Parsed `--fake-mesh` fixture records.
#[derive(Debug, Clone)]
pub struct MeshFixture {
    scripts: Vec<DeviceScript>,
}

impl MeshFixture {
    fn into_scripts(self) -> Vec<DeviceScript> {
        self.scripts
    }
}

impl FromStr for MeshFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }

        let scripts = value
            .split(';')
            .map(parse_fixture_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scripts })
    }
}

fn parse_fixture_record(record: &str) -> Result<DeviceScript, FixtureError> {
    let (address, nodes) = record
        .split_once('|')
        .ok_or_else(|| FixtureError::InvalidRecordShape {
            record: record.to_string(),
        })?;
    let address: DeviceAddress = address.trim().parse()?;

    let mut mesh_nodes = Vec::new();
    for node in nodes.split(',').map(str::trim).filter(|node| !node.is_empty()) {
        let raw = parse_mesh_address(node).map_err(|_reason| FixtureError::InvalidNode {
            value: node.to_string(),
        })?;
        let unicast =
            UnicastAddress::try_from(raw).map_err(|_range| FixtureError::InvalidNode {
                value: node.to_string(),
            })?;
        mesh_nodes.push(unicast);
    }

    Ok(DeviceScript::builder()
        .address(address)
        .mesh_nodes(mesh_nodes)
        .build())
}

fn parse_mesh_address(value: &str) -> Result<u16, String> {
    let trimmed = value.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u16::from_str_radix(hex, 16)
    } else {
        trimmed.parse()
    };
    parsed.map_err(|error| format!("invalid mesh address `{value}`: {error}"))
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
