use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use padstream::backend::{self, Backend, ScriptedBackend};
use padstream::manager::{EventManager, EventManagerBuilder, KeyQuery, RelayCommand};
use padstream::{Config, DeviceSelector, Joystick, Key, KeyType};

#[derive(Parser, Debug)]
#[command(name = "padstream", about = "Gamepad event normalization and monitoring")]
struct Cli {
    /// Configuration file (defaults to the user config directory).
    #[arg(long, global = true, env = "PADSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Replay a TOML event script instead of reading real devices.
    #[arg(long, global = true)]
    script: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices.
    List,
    /// Print key events as they are dispatched.
    Monitor {
        #[command(flatten)]
        filter: FilterArgs,
        /// Read devices through a relay child process.
        #[arg(long)]
        isolated: bool,
    },
    /// Wait for one key and print it.
    Find {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Child mode: write backend events to stdout as JSON lines.
    Relay,
}

#[derive(Args, Debug, Clone)]
struct FilterArgs {
    /// Stop after this many seconds.
    #[arg(long)]
    timeout: Option<f64>,
    /// Only accept keys from these devices (id or name).
    #[arg(long = "device")]
    devices: Vec<String>,
    /// Only accept these key types.
    #[arg(long = "keytype")]
    keytypes: Vec<KeyType>,
}

impl FilterArgs {
    fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| eyre!("Invalid timeout {}: {}", secs, e))
            })
            .transpose()
    }

    fn query(&self) -> Result<KeyQuery> {
        let devices = self
            .devices
            .iter()
            .map(|device| match device.parse::<i64>() {
                Ok(id) => DeviceSelector::Id(id),
                Err(_) => DeviceSelector::Name(device.clone()),
            })
            .collect();
        Ok(KeyQuery {
            devices,
            keytypes: self.keytypes.clone(),
            timeout: self.timeout()?,
            poll_interval: None,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;
    debug!("Using configuration: {:?}", config);

    match &cli.command {
        Command::List => list(&cli),
        Command::Monitor { filter, isolated } => monitor(&cli, &config, filter, *isolated).await,
        Command::Find { filter } => find(&cli, &config, filter).await,
        Command::Relay => run_relay(&cli).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

// Logs go to stderr; stdout carries event output and the relay stream.
fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn select_backend(cli: &Cli) -> Result<Arc<dyn Backend>> {
    match &cli.script {
        Some(path) => Ok(Arc::new(ScriptedBackend::from_file(path)?)),
        None => Ok(backend::native()?),
    }
}

fn describe(device: &Joystick) -> String {
    format!(
        "[{}] {} ({} axes, {} buttons, {} hats, {} balls)",
        device.id(),
        device.name(),
        device.num_axes(),
        device.num_buttons(),
        device.num_hats(),
        device.num_balls()
    )
}

fn print_key(key: &Key) {
    let device = key
        .device()
        .map(|link| link.to_string())
        .unwrap_or_else(|| "-".to_string());
    let repeat = if key.is_repeat { " (repeat)" } else { "" };
    println!("{}: {} = {:?}{}", device, key, key.value(), repeat);
}

fn list(cli: &Cli) -> Result<()> {
    let backend = select_backend(cli)?;
    let devices = backend.list_devices()?;
    if devices.is_empty() {
        println!("No devices attached");
    }
    for device in devices.iter() {
        println!("{}", describe(device));
    }
    Ok(())
}

fn builder(config: &Config) -> EventManagerBuilder {
    EventManagerBuilder::new()
        .config(config)
        .on_add_device(|device| println!("added   {}", describe(device)))
        .on_remove_device(|device| println!("removed {}", describe(device)))
}

async fn monitor(cli: &Cli, config: &Config, filter: &FilterArgs, isolated: bool) -> Result<()> {
    let query = filter.query()?;
    let builder = builder(config).on_key_event(move |key| {
        if query.accepts(key) {
            print_key(key);
        }
    });

    let manager: Box<dyn EventManager> = if isolated {
        let mut command = RelayCommand::current_exe()?;
        if let Some(script) = &cli.script {
            command = command.arg("--script").arg(script.display().to_string());
        }
        Box::new(builder.relay_command(command).build_isolated()?)
    } else {
        Box::new(builder.shared_backend(select_backend(cli)?).build_threaded()?)
    };

    manager.start()?;
    info!("Monitoring key events, press Ctrl-C to stop");
    match filter.timeout()? {
        Some(timeout) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = tokio::time::sleep(timeout) => info!("Timeout reached"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    if let Err(e) = manager.stop() {
        info!("{}", e);
    }
    Ok(())
}

async fn find(cli: &Cli, config: &Config, filter: &FilterArgs) -> Result<()> {
    let query = filter.query()?;
    let manager = builder(config)
        .shared_backend(select_backend(cli)?)
        .build_threaded()?;

    info!("Waiting for a key");
    let found = tokio::task::spawn_blocking(move || manager.find_key(&query)).await??;
    match found {
        Some(key) => print_key(&key),
        None => println!("No key pressed"),
    }
    Ok(())
}

async fn run_relay(cli: &Cli) -> Result<()> {
    let backend = select_backend(cli)?;
    tokio::task::spawn_blocking(move || {
        padstream::relay::relay(backend.as_ref(), io::stdout(), || true)
    })
    .await??;
    Ok(())
}
