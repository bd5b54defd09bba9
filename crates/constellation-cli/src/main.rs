//! Constellation management CLI: run a demo satellite, watch CHIRP traffic
//! or drive a remote satellite over CSCP.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use constellation_core::chirp::{BroadcastRecv, ChirpConfig, ChirpManager};
use constellation_core::heartbeat::HeartbeatConfig;
use constellation_core::satellite::{
    CommandRegistry, Satellite, SatelliteConfig, SatelliteServer,
};
use constellation_core::transport;
use constellation_protocol::chirp::{ChirpMessage, ServiceIdentifier, CHIRP_PORT};
use constellation_protocol::cscp::CscpMessage;
use constellation_protocol::{Configuration, Dictionary, Value};

#[derive(Parser, Debug)]
#[command(name = "constellation", about = "Constellation satellite toolkit")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a demo satellite until shut down remotely
    Satellite {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/satellite.toml")]
        config: PathBuf,
    },
    /// Print every CHIRP datagram seen on the local network
    Listen {
        /// Port to listen on
        #[arg(long, default_value_t = CHIRP_PORT)]
        port: u16,
    },
    /// Request OFFER replays and print the discovered services
    Request {
        /// Constellation group name
        #[arg(short, long, default_value = "edda")]
        group: String,
        /// Service class to request
        #[arg(short, long, default_value = "control")]
        service: String,
        /// How long to collect replies, in milliseconds
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Send one command to a satellite and print the reply
    Control {
        /// Satellite command endpoint, e.g. 192.168.1.17:41231
        address: SocketAddr,
        /// Command verb, e.g. get_state
        verb: String,
        /// Run number payload (for start)
        #[arg(long)]
        run_number: Option<u64>,
        /// key=value configuration entries (for initialize/reconfigure)
        #[arg(long = "set")]
        settings: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct SatelliteFileConfig {
    #[serde(default)]
    satellite: SatelliteSection,
    #[serde(default)]
    heartbeat: HeartbeatSection,
}

impl Default for SatelliteFileConfig {
    fn default() -> Self {
        SatelliteFileConfig {
            satellite: SatelliteSection::default(),
            heartbeat: HeartbeatSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SatelliteSection {
    #[serde(default = "default_type")]
    type_name: String,
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_group")]
    group: String,
}

impl Default for SatelliteSection {
    fn default() -> Self {
        SatelliteSection {
            type_name: default_type(),
            name: default_name(),
            group: default_group(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HeartbeatSection {
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    max_interval_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        HeartbeatSection {
            interval_ms: default_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

fn default_type() -> String {
    "Demo".to_owned()
}

fn default_name() -> String {
    "sat1".to_owned()
}

fn default_group() -> String {
    "edda".to_owned()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

/// Minimal satellite that logs its lifecycle and idles in RUN.
#[derive(Default)]
struct DemoSatellite {
    sample_rate: i64,
}

impl Satellite for DemoSatellite {
    fn supports_reconfigure(&self) -> bool {
        true
    }

    fn initializing(&mut self, config: &mut Configuration) -> anyhow::Result<()> {
        self.sample_rate = config.get_or("sample_rate", 1000)?;
        info!(sample_rate = self.sample_rate, "initialized");
        Ok(())
    }

    fn reconfiguring(&mut self, partial: &Configuration) -> anyhow::Result<()> {
        self.sample_rate = partial.get_or("sample_rate", self.sample_rate)?;
        info!(sample_rate = self.sample_rate, "reconfigured");
        Ok(())
    }

    fn starting(&mut self, run_id: &str) -> anyhow::Result<()> {
        info!(run_id, "starting acquisition");
        Ok(())
    }

    fn running(&mut self, token: &CancellationToken) -> anyhow::Result<()> {
        let mut samples: u64 = 0;
        while !token.is_cancelled() {
            samples = samples.wrapping_add(self.sample_rate as u64);
            std::thread::sleep(Duration::from_millis(100));
        }
        info!(samples, "acquisition finished");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Satellite { config } => run_satellite(config).await,
        Commands::Listen { port } => run_listen(port).await,
        Commands::Request {
            group,
            service,
            wait_ms,
        } => run_request(group, service, wait_ms).await,
        Commands::Control {
            address,
            verb,
            run_number,
            settings,
        } => run_control(address, verb, run_number, settings).await,
    }
}

async fn run_satellite(config_path: PathBuf) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        let raw = tokio::fs::read_to_string(&config_path).await?;
        toml::from_str(&raw)?
    } else {
        info!("no config file found, using defaults");
        SatelliteFileConfig::default()
    };

    let chirp = ChirpManager::new(ChirpConfig::new(
        &config.satellite.group,
        &config.satellite.name,
    ))?;
    chirp.start();
    ChirpManager::set_default(Arc::clone(&chirp));

    let mut commands = CommandRegistry::new();
    commands.register(
        "get_sample_count",
        "Number of samples acquired in the current run",
        Vec::new(),
        0,
        Box::new(|_args| Ok(Some(Value::UInt64(0)))),
    );

    let server = SatelliteServer::new(
        &config.satellite.type_name,
        &config.satellite.name,
        Box::<DemoSatellite>::default(),
        Arc::clone(&chirp),
        commands,
        SatelliteConfig {
            bind_address: Ipv4Addr::UNSPECIFIED,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(config.heartbeat.interval_ms),
                max_interval: Duration::from_millis(config.heartbeat.max_interval_ms),
                ..HeartbeatConfig::default()
            },
        },
    )
    .await?;

    info!(
        name = server.name(),
        port = server.port(),
        group = %config.satellite.group,
        "satellite up"
    );
    server.run().await?;
    chirp.shutdown().await;
    Ok(())
}

async fn run_listen(port: u16) -> anyhow::Result<()> {
    let receiver = BroadcastRecv::new(Ipv4Addr::UNSPECIFIED, port)?;
    info!(port, "listening for CHIRP datagrams, ctrl-c to stop");
    loop {
        let Some((bytes, source)) = receiver.recv_timeout(Duration::from_secs(1)).await? else {
            continue;
        };
        match ChirpMessage::disassemble(&bytes) {
            Ok(msg) => println!(
                "{source}  {}  group={} host={} service={} port={}",
                msg.msg_type, msg.group_id, msg.host_id, msg.service, msg.port
            ),
            Err(err) => warn!(%source, error = %err, "undecodable datagram"),
        }
    }
}

async fn run_request(group: String, service: String, wait_ms: u64) -> anyhow::Result<()> {
    let service = parse_service(&service)?;
    let chirp = ChirpManager::new(ChirpConfig::new(&group, "chirp-request-tool"))?;
    chirp.start();
    chirp.send_request(service).await?;
    tokio::time::sleep(Duration::from_millis(wait_ms)).await;

    let discovered = chirp.discovered_services_of(service);
    if discovered.is_empty() {
        println!("no {service} services discovered in group {group}");
    }
    for entry in discovered {
        println!(
            "{}  host={} service={} port={}",
            entry.address, entry.host_id, entry.identifier, entry.port
        );
    }
    chirp.shutdown().await;
    Ok(())
}

async fn run_control(
    address: SocketAddr,
    verb: String,
    run_number: Option<u64>,
    settings: Vec<String>,
) -> anyhow::Result<()> {
    let payload = if let Some(number) = run_number {
        Some(Value::UInt64(number).assemble())
    } else if !settings.is_empty() {
        let mut dict = Dictionary::new();
        for entry in &settings {
            let (key, raw) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{entry}'"))?;
            dict.insert(key, parse_value(raw));
        }
        Some(dict.assemble())
    } else {
        None
    };

    let mut msg = CscpMessage::request("constellation-cli", verb);
    if let Some(payload) = payload {
        msg = msg.with_payload(payload);
    }

    let mut stream = TcpStream::connect(address).await?;
    transport::write_message(&mut stream, &msg.to_frames()).await?;
    let frames = transport::read_message(&mut stream).await?;
    let reply = CscpMessage::from_frames(&frames)
        .map_err(|err| anyhow::anyhow!("undecodable reply: {err}"))?;

    println!("{}: {}", reply.verb.0, reply.verb.1);
    if let Some(payload) = reply.payload.as_deref() {
        match Dictionary::disassemble(payload) {
            Ok(dict) => {
                for (key, value) in dict.iter() {
                    println!("  {key} = {value}");
                }
            }
            Err(_) => match Value::disassemble(payload) {
                Ok(value) => println!("  {value}"),
                Err(_) => println!("  <{} bytes of payload>", payload.len()),
            },
        }
    }
    Ok(())
}

fn parse_service(raw: &str) -> anyhow::Result<ServiceIdentifier> {
    Ok(match raw.to_lowercase().as_str() {
        "control" => ServiceIdentifier::Control,
        "heartbeat" => ServiceIdentifier::Heartbeat,
        "monitoring" => ServiceIdentifier::Monitoring,
        "data" => ServiceIdentifier::Data,
        other => anyhow::bail!("unknown service class '{other}'"),
    })
}

/// Interpret a command-line literal as the narrowest matching value type.
fn parse_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int64(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Double(f);
    }
    Value::String(raw.to_owned())
}
