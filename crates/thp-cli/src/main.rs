//! THP CLI
//!
//! Talks to a Trezor (or its emulator) over the Trezor Host Protocol.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;
use thp_core::{
    Channel, CodeProvider, Credential, Error, OpenOutcome, PairingController, Session,
    default_pairing_flow,
};
use thp_transport::{Transport, UdpTransport};

use config::{Config, load_credentials, store_credential};

/// THP - encrypted, paired channels to a hardware wallet
#[derive(Parser)]
#[command(name = "thp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device address, overriding the config file
    #[arg(short, long)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize with the device using a broadcast ping
    Ping,

    /// Pair with the device and store the issued credential
    Pair {
        /// Do not request a credential after pairing
        #[arg(long)]
        no_credential: bool,
    },

    /// Send one application message and print the response
    Call {
        /// Session id
        #[arg(short, long, default_value_t = 0)]
        session: u8,

        /// Protobuf message type
        #[arg(short = 't', long = "type")]
        message_type: u16,

        /// Hex-encoded protobuf payload
        #[arg(long, default_value = "")]
        hex: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;
    if let Some(device) = cli.device {
        config.device.addr = device;
    }
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    let mut transport = UdpTransport::new(config.device_addr()?);
    transport.open().context("cannot open device link")?;

    let result = match cli.command {
        Commands::Ping => ping(&mut transport, &config),
        Commands::Pair { no_credential } => pair(&mut transport, &config, !no_credential),
        Commands::Call {
            session,
            message_type,
            hex,
        } => call(&mut transport, &config, session, message_type, &hex),
    };

    if let Err(err) = transport.close() {
        tracing::warn!("Failed to close device link: {}", err);
    }
    result
}

/// Broadcast ping round-trip
fn ping(transport: &mut UdpTransport, config: &Config) -> anyhow::Result<()> {
    let start = Instant::now();
    Channel::sync_responses(transport, &config.channel)?;
    println!(
        "Device at {} answered in {:.1} ms",
        config.device.addr,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

/// Pair with the device, storing any credential it issues
fn pair(transport: &mut UdpTransport, config: &Config, with_credential: bool) -> anyhow::Result<()> {
    let credentials = load_credentials(&config.host.credential_file)?;
    let mut channel = open_channel(transport, config, &credentials)?;
    println!("Channel {:#06x} allocated", channel.channel_id());

    let credential = run_pairing(&mut channel, config, &credentials, with_credential)?;
    match credential {
        Some(credential) => {
            store_credential(&config.host.credential_file, credential)?;
            println!(
                "Paired; credential stored in {}",
                config.host.credential_file.display()
            );
        }
        None if channel.pairing_state().is_paired() => println!("Host already paired"),
        None => println!("Paired"),
    }
    Ok(())
}

/// Send one raw application message on an encrypted channel
fn call(
    transport: &mut UdpTransport,
    config: &Config,
    session: u8,
    message_type: u16,
    payload_hex: &str,
) -> anyhow::Result<()> {
    let payload = hex::decode(payload_hex).context("payload is not valid hex")?;
    let credentials = load_credentials(&config.host.credential_file)?;
    let mut channel = open_channel(transport, config, &credentials)?;
    if let Some(credential) = run_pairing(&mut channel, config, &credentials, true)? {
        store_credential(&config.host.credential_file, credential)?;
    }

    let session = Session::new(session);
    session.write_raw(&mut channel, message_type, &payload)?;
    let (response_type, response) = session.read_raw(&mut channel)?;
    println!("{} {}", response_type, hex::encode(response));
    Ok(())
}

/// Allocate a channel and run the handshake, retrying once with
/// `force_unlock` if the device is locked.
fn open_channel<'t>(
    transport: &'t mut UdpTransport,
    config: &Config,
    credentials: &[Credential],
) -> anyhow::Result<Channel<&'t mut UdpTransport>> {
    let mut channel = Channel::allocate(transport, config.channel.clone())?;
    match channel.open(credentials, false)? {
        OpenOutcome::Opened(pairing_state) => {
            tracing::debug!("Handshake done ({:?})", pairing_state);
            return Ok(channel);
        }
        OpenOutcome::DeviceLocked => {
            println!("Device is locked, unlock it to continue");
        }
    }

    let mut channel = Channel::allocate(channel.into_transport(), config.channel.clone())?;
    match channel.open(credentials, true)? {
        OpenOutcome::Opened(_) => Ok(channel),
        OpenOutcome::DeviceLocked => anyhow::bail!("Device is still locked"),
    }
}

fn run_pairing(
    channel: &mut Channel<&mut UdpTransport>,
    config: &Config,
    credentials: &[Credential],
    with_credential: bool,
) -> anyhow::Result<Option<Credential>> {
    let mut controller =
        PairingController::new(channel, &config.host.host_name, &config.host.app_name);
    let mut prompt = prompt_code;
    let provider: &mut dyn CodeProvider = &mut prompt;
    Ok(default_pairing_flow(
        &mut controller,
        credentials,
        Some(provider),
        with_credential,
    )?)
}

/// Ask the user for the code shown on the device
fn prompt_code() -> Result<u32, Error> {
    print!("Enter the code shown on the device: ");
    io::stdout()
        .flush()
        .map_err(|e| Error::protocol(format!("cannot prompt for code: {e}")))?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| Error::protocol(format!("cannot read code: {e}")))?;

    let code = line.trim();
    if code.len() != 6 {
        return Err(Error::protocol("the code has six digits"));
    }
    code.parse()
        .map_err(|_| Error::protocol(format!("invalid code: {code}")))
}
