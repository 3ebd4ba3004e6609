//! CLI entry point for pvhost.
//!
//! Provides a command-line interface for:
//! - Running a host process (`serve`)
//! - Inspecting the effective configuration (`dump-config`)
//!
//! The served process wires the coordination core together the way an
//! instrument server would: settings → tracing → config tree → reactor →
//! channel registration → canary → autosave → blocking run loop. The
//! channels it hosts are the built-in server-status ones; a real deployment
//! links against `pvhost` as a library and registers its instrument cells
//! next to them.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use pvhost::cell::Cell;
use pvhost::configtree::{ConfigTree, Marker};
use pvhost::reactor::{Canary, Reactor, Schedule};
use pvhost::registry::{ChannelRegistry, ChannelSpec, Interaction, PersistEntry, PersistSink};
use pvhost::settings::Settings;
use pvhost::{logging, AppResult};

#[derive(Parser)]
#[command(name = "pvhost")]
#[command(about = "Instrument-control channel host", long_about = None)]
struct Cli {
    /// Path to the settings file.
    #[arg(long, default_value = "pvhost.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host until stopped.
    Serve,

    /// Print one config-tree marker kind as JSON and exit.
    DumpConfig {
        /// Which marker to export.
        #[arg(long, value_enum, default_value = "value")]
        marker: MarkerArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MarkerArg {
    Value,
    Config,
    Default,
    About,
    Classification,
}

impl From<MarkerArg> for Marker {
    fn from(arg: MarkerArg) -> Self {
        match arg {
            MarkerArg::Value => Marker::Value,
            MarkerArg::Config => Marker::Config,
            MarkerArg::Default => Marker::Default,
            MarkerArg::About => Marker::About,
            MarkerArg::Classification => Marker::Classification,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)?;
    settings.validate()?;

    match cli.command {
        Commands::Serve => serve(settings),
        Commands::DumpConfig { marker } => dump_config(settings, marker.into()),
    }
}

/// Snapshot sink writing persisted channel values as a JSON object. Sink
/// failures are logged, never propagated: losing one snapshot must not take
/// the host down.
struct JsonSnapshotSink {
    path: PathBuf,
}

impl JsonSnapshotSink {
    fn write(&self, entries: &[PersistEntry]) {
        let mut snapshot = serde_json::Map::new();
        for entry in entries.iter().filter(|e| e.persist) {
            snapshot.insert(entry.name.clone(), entry.value.clone());
        }
        match serde_json::to_string_pretty(&serde_json::Value::Object(snapshot)) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.path, body) {
                    error!(path = %self.path.display(), "snapshot write failed: {e}");
                }
            }
            Err(e) => error!("snapshot serialization failed: {e}"),
        }
    }
}

impl PersistSink for JsonSnapshotSink {
    fn persist_all(&self, entries: Vec<PersistEntry>) {
        self.write(&entries);
    }

    fn persist_urgent(&self, entry: PersistEntry, window_secs: f64) {
        // The built-in sink has no batching to wait out; honor the window
        // by snapshotting immediately.
        info!(channel = %entry.name, window_secs, "urgent persist requested");
        self.write(&[entry]);
    }
}

/// Wire the core together: config tree seeded with overrides, reactor, and
/// the built-in server-status channels.
fn build_host(settings: &Settings) -> AppResult<(Reactor, ChannelRegistry, ConfigTree)> {
    let config = ConfigTree::new();
    config.load_external(settings.channel_overrides()?);

    let reactor = Reactor::with_max_poll(settings.reactor.max_poll);
    let registry = ChannelRegistry::new(config.clone());

    let prefix = vec!["server".to_string()];

    let uptime = Arc::new(
        Cell::new("uptime", 0.0)
            .with_units("s")
            .with_description("seconds since host start"),
    );
    registry.register(
        uptime.clone(),
        "uptime",
        &prefix,
        ChannelSpec::new(Interaction::Report),
    )?;

    let started = std::time::Instant::now();
    reactor.schedule("server/uptime", Schedule::every(1.0), move || {
        uptime.assign(started.elapsed().as_secs_f64());
    });

    Ok((reactor, registry, config))
}

fn serve(settings: Settings) -> Result<()> {
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;
    info!(host = %settings.application.name, "starting channel host");

    let (reactor, registry, _config) = build_host(&settings)?;

    registry.set_persist_sink(Arc::new(JsonSnapshotSink {
        path: settings.autosave.snapshot_path.clone(),
    }));
    registry.start_autosave(
        &reactor,
        settings.autosave.period.as_secs_f64(),
        settings.autosave.skip_fraction,
    );

    let canary = Canary::watch(
        &reactor,
        settings.reactor.canary_interval,
        settings.reactor.canary_timeout,
        || {},
        || {},
    )?;

    info!(channels = registry.len(), "host running");
    // Blocks until stop(); a panicking task propagates here and the process
    // exits for the supervisor to restart.
    reactor.run();

    canary.stop();
    registry.persist_now();
    info!("host stopped");
    Ok(())
}

fn dump_config(settings: Settings, marker: Marker) -> Result<()> {
    // Registration is what populates the value/default/about markers, so
    // wire the host without running it.
    let (_reactor, _registry, config) = build_host(&settings)?;
    println!("{}", serde_json::to_string_pretty(&config.export_all(marker))?);
    Ok(())
}
