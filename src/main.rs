mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use series_cli::app::Runtime;
use series_cli::records::export_to_path;
use series_cli::utils::format_local;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let runtime = Runtime::load(&cli.root, cli.data_dir.clone())
        .with_context(|| format!("Failed to load configuration from {}", cli.root.display()))?;

    match cli.command {
        Commands::Sources => list_sources(&runtime),
        Commands::Fetch { ref names, all } => fetch(&runtime, names, all).await,
        Commands::Status => show_status(&runtime),
        Commands::Backups { ref name } => list_backups(&runtime, name),
        Commands::Restore {
            ref name,
            ref version,
        } => restore(&runtime, name, version).await,
        Commands::Export {
            ref name,
            ref path,
            format,
        } => {
            let dataset = runtime.store.get(name)?;
            export_to_path(&dataset, format.into(), path)?;
            println!("Exported {} points of {} to {}", dataset.len(), name, path.display());
            Ok(())
        }
        Commands::Stats => show_stats(&runtime),
        Commands::Watch => watch(&runtime).await,
    }
}

fn list_sources(runtime: &Runtime) -> Result<()> {
    let sources = runtime.registry.snapshot();
    if sources.is_empty() {
        println!("No sources configured under {}", cli_sources_hint(runtime));
        return Ok(());
    }

    for source in sources.iter() {
        println!(
            "{:<24} {:<10} path={:<20} group={} {}",
            source.name,
            source.unit,
            source.data_path.as_str(),
            source.rate_group,
            source.url_template
        );
    }
    Ok(())
}

fn cli_sources_hint(runtime: &Runtime) -> String {
    runtime
        .registry
        .root()
        .map(|root| root.join("config").join("sources").display().to_string())
        .unwrap_or_else(|| "config/sources".to_string())
}

async fn fetch(runtime: &Runtime, names: &[String], all: bool) -> Result<()> {
    let names = if all { runtime.registry.names() } else { names.to_vec() };
    if names.is_empty() {
        bail!("Nothing to fetch: pass source names or --all");
    }

    let outcomes = runtime.orchestrator.run_sources(&names).await;
    let mut failed = 0;
    for (name, outcome) in &outcomes {
        match outcome {
            Ok(report) => println!(
                "{:<24} ok      {} new / {} total points, quality {}, version {}{}",
                name,
                report.batch_points,
                report.total_points,
                report.quality_score,
                report.version,
                if report.from_cache { " (cached)" } else { "" }
            ),
            Err(err) => {
                failed += 1;
                println!("{:<24} failed  [{}] {}", name, err.category(), err);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} fetch cycles failed", failed, outcomes.len());
    }
    Ok(())
}

fn show_status(runtime: &Runtime) -> Result<()> {
    for name in runtime.registry.names() {
        let status = runtime.orchestrator.status(&name)?;
        match runtime.store.try_get(&name) {
            Some(dataset) => println!(
                "{:<24} {:<11} {} points, quality {}, updated {}",
                name,
                status.state,
                dataset.len(),
                dataset.metadata.quality_score,
                format_local(dataset.metadata.last_updated)
            ),
            None => println!("{:<24} {:<11} never fetched", name, status.state),
        }
    }
    Ok(())
}

fn list_backups(runtime: &Runtime, name: &str) -> Result<()> {
    let backups = runtime.storage.list_backups(name)?;
    if backups.is_empty() {
        println!("No stored versions for {}", name);
        return Ok(());
    }

    for record in backups {
        println!(
            "{} {}  {}  {} bytes",
            if record.is_current { "*" } else { " " },
            record.version,
            format_local(record.created_at),
            record.size_bytes
        );
    }
    Ok(())
}

async fn restore(runtime: &Runtime, name: &str, version: &str) -> Result<()> {
    let dataset = runtime.orchestrator.restore(name, version).await?;
    println!(
        "Restored {} to version {} ({} points, quality {})",
        name,
        version,
        dataset.len(),
        dataset.metadata.quality_score
    );
    Ok(())
}

fn show_stats(runtime: &Runtime) -> Result<()> {
    let stats = runtime.storage.stats()?;
    println!("Data directory: {}", runtime.storage.data_dir().display());
    for source in &stats.sources {
        println!(
            "{:<24} {} versions, {} bytes, current {}",
            source.source,
            source.versions,
            source.bytes,
            source.current.as_deref().unwrap_or("-")
        );
    }
    println!(
        "Total: {} sources, {} versions, {} bytes",
        stats.sources.len(),
        stats.total_versions,
        stats.total_bytes
    );
    Ok(())
}

async fn watch(runtime: &Runtime) -> Result<()> {
    runtime
        .registry
        .start_watching()
        .context("Failed to watch source definitions")?;
    let mut events = runtime.orchestrator.subscribe_events();
    let mut sources = runtime.registry.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!(
        "Watching {}. Enter a source name, `all` or `status`; Ctrl-D quits.",
        cli_sources_hint(runtime)
    );
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                run_watch_command(runtime, line.trim())?;
            }
            event = events.recv() => match event {
                Ok(event) => match event.error {
                    Some(error) => println!(
                        "{:<24} cycle {}: {} -> {} [{}] {}",
                        event.source, event.cycle, event.from, event.state, error.category, error.message
                    ),
                    None => println!(
                        "{:<24} cycle {}: {} -> {}",
                        event.source, event.cycle, event.from, event.state
                    ),
                },
                Err(RecvError::Lagged(skipped)) => warn!("skipped {} status events", skipped),
                Err(RecvError::Closed) => break,
            },
            changed = sources.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = sources.borrow_and_update().len();
                println!("Source definitions reloaded: {} registered", count);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn run_watch_command(runtime: &Runtime, command: &str) -> Result<()> {
    match command {
        "" => Ok(()),
        "status" => show_status(runtime),
        "all" => {
            for (name, accepted) in runtime.orchestrator.trigger_all() {
                if let Err(err) = accepted {
                    println!("{:<24} not started: {}", name, err);
                }
            }
            Ok(())
        }
        name => {
            if let Err(err) = runtime.orchestrator.trigger(name) {
                println!("{:<24} not started: {}", name, err);
            }
            Ok(())
        }
    }
}
