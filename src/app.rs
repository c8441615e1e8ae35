use crate::admission::{self, CapabilityProbe, NvidiaSmiProbe};
use crate::cli::{Cli, Commands, RunArgs};
use crate::config::{Config, ConfigStore};
use crate::detector::CompletionDetector;
use crate::ledger::Ledger;
use crate::logging;
use crate::orchestrator::{Watcher, WatcherSettings};
use crate::signal;
use crate::storage;
use crate::watch;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossbeam_channel::never;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = match cli.config {
        Some(path) => ConfigStore::at(path),
        None => ConfigStore::new()?,
    };
    let mut config = store.load()?;
    logging::init(config.log_file.as_deref());
    tracing::debug!(path = %store.path().display(), exists = store.exists(), "config loaded");

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            if let Some(secs) = args.interval {
                config.poll_interval_secs = secs;
            }
            run_watcher(&config, args.once)
        }
        Commands::Status => run_status(&config),
        Commands::Prune => run_prune(&config),
        Commands::Release => run_release(&config),
        Commands::Reset => run_reset(&config),
        Commands::InitConfig => run_init_config(&store),
    }
}

fn open_ledger(config: &Config) -> Result<Ledger> {
    let path = config.resolved_ledger_path()?;
    Ledger::open(&path).with_context(|| format!("open ledger {}", path.display()))
}

fn resolve_ceiling(config: &Config) -> admission::Ceiling {
    let probe = NvidiaSmiProbe::new();
    let probe: Option<&dyn CapabilityProbe> = if config.detect_capability {
        Some(&probe)
    } else {
        None
    };
    admission::resolve_ceiling(&config.capability_tier, &config.tier_ceilings, probe)
}

fn run_watcher(config: &Config, once: bool) -> Result<()> {
    tracing::info!("starting subtitle watcher");
    for issue in config.validate() {
        tracing::warn!(issue = %issue, "config problem");
    }
    if let Err(err) = storage::ensure_dir(&config.output_dir) {
        tracing::warn!(error = %format!("{err:#}"), "cannot create output directory");
    }

    let ledger = open_ledger(config)?;
    let ceiling = resolve_ceiling(config);
    let mut watcher = Watcher::from_config(config, ledger, ceiling.max_in_flight);

    if once {
        let report = watcher.tick();
        tracing::info!(
            admitted = report.admitted.len(),
            completed = report.completed.len(),
            discarded = report.discarded.len(),
            pending = report.pending.len(),
            "single tick finished"
        );
        return Ok(());
    }

    let stop = signal::install();
    let (_waker, wake) = if config.wake_on_change {
        match watch::watch_directory(&config.watch_dir, config.video_extensions.clone()) {
            Ok((waker, rx)) => (Some(waker), rx),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "directory watch unavailable, polling only");
                (None, never())
            }
        }
    } else {
        (None, never())
    };
    watcher.run(&stop, wake)
}

fn run_status(config: &Config) -> Result<()> {
    let ledger = open_ledger(config)?;
    let ceiling = resolve_ceiling(config);
    let detector = CompletionDetector::new(WatcherSettings::from_config(config).detector);
    let doc = ledger.snapshot();
    let now = Utc::now();

    println!("ledger: {}", ledger.path().display());
    println!(
        "ceiling: {} (declared {}, detected {})",
        ceiling.max_in_flight,
        ceiling.declared_tier,
        ceiling.detected_tier.as_deref().unwrap_or("unknown")
    );
    println!(
        "in flight: {}/{}",
        ledger.count_in_flight(),
        ceiling.max_in_flight
    );
    for name in ledger.list_in_flight() {
        let Some(entry) = doc.in_flight.get(&name) else {
            continue;
        };
        let age = entry
            .elapsed(now)
            .map(|age| format!("{}m", age.as_secs() / 60))
            .unwrap_or_else(|| "unknown".to_string());
        let source = if entry.source_path.exists() {
            "present"
        } else {
            "missing"
        };
        let artifact = match std::fs::metadata(detector.artifact_path(&name)) {
            Ok(meta) => format!("{} bytes", meta.len()),
            Err(_) => "none".to_string(),
        };
        println!("  {name}: age {age}, source {source}, subtitle {artifact}");
    }
    println!("completed: {}", doc.completed.len());
    if !doc.failures.is_empty() {
        println!("failures:");
        for (name, count) in &doc.failures {
            println!("  {name}: {count}");
        }
    }
    Ok(())
}

fn run_prune(config: &Config) -> Result<()> {
    let ledger = open_ledger(config)?;
    let mut pruned = 0usize;
    for name in ledger.list_in_flight() {
        let Some(entry) = ledger.in_flight_entry(&name) else {
            continue;
        };
        if !entry.source_path.exists() && ledger.discard(&name)? {
            tracing::info!(name = %name, path = %entry.source_path.display(), "pruned missing source");
            pruned += 1;
        }
    }
    println!("pruned {pruned} in-flight task(s)");
    Ok(())
}

fn run_release(config: &Config) -> Result<()> {
    let ledger = open_ledger(config)?;
    let released = ledger.release_all()?;
    println!("released {} in-flight task(s)", released.len());
    Ok(())
}

fn run_reset(config: &Config) -> Result<()> {
    let ledger = open_ledger(config)?;
    ledger.reset()?;
    println!("ledger reset: {}", ledger.path().display());
    Ok(())
}

fn run_init_config(store: &ConfigStore) -> Result<()> {
    if store.exists() {
        println!("config already exists: {}", store.path().display());
        return Ok(());
    }
    store.save(&Config::default())?;
    println!("wrote default config: {}", store.path().display());
    Ok(())
}
