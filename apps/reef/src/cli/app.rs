use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::config::ReefConfig;
use crate::connection::Connection;
use crate::events::EventBus;
use crate::registry::SessionRegistry;
use crate::save::{self, FixedAnswer, OverwritePrompt, SaveOutcome};
use crate::search::{self, Reconciliation};
use crate::service::SearchQuery;
use crate::service::memory::MemoryEditService;
use crate::session::Session;
use crate::telemetry::logging::hexdump;

use super::error::CliError;
use super::{Backend, Cli, Command, EditArgs, ReplaceArgs, SaveArgs, SearchArgs, ViewArgs, parse_bytes};

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = ReefConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    debug!(target: "reef::cli", ?config, backend = ?cli.backend, "configuration resolved");

    let connection = match cli.backend {
        Backend::Http => Connection::http(config.host.clone(), config.port)?,
        Backend::Memory => Connection::new(config.host.clone(), config.port, MemoryEditService::new()),
    };
    let info = connection
        .wait_until_ready(config.startup_attempts, config.startup_retry())
        .await?;

    if let Command::Info = cli.command {
        return print_info(&connection, &info.version, &config).await;
    }

    let registry = SessionRegistry::new(connection, EventBus::new(), config.heartbeat_interval());
    let result = match cli.command {
        Command::Info => Ok(()),
        Command::View(args) => view(&registry, &config, args).await,
        Command::Search(args) => search_file(&registry, &config, args).await,
        Command::Replace(args) => replace(&registry, &config, args).await,
        Command::Edit(args) => edit(&registry, &config, args).await,
    };
    let closed = registry.close_all().await;
    result?;
    closed?;
    Ok(())
}

async fn print_info(connection: &Connection, version: &str, config: &ReefConfig) -> Result<(), CliError> {
    let started = Instant::now();
    let beat = connection
        .service()
        .heartbeat(&[], config.heartbeat_interval_ms)
        .await?;
    let latency = started.elapsed();
    println!("service      {}:{}", connection.host(), connection.port());
    println!("version      {version}");
    println!("latency      {} ms", latency.as_millis());
    println!("uptime       {} s", beat.uptime_ms / 1000);
    println!("cpu load     {:.2}", beat.cpu_load_average);
    println!("memory       {} bytes", beat.used_memory);
    println!("sessions     {}", beat.session_count);
    Ok(())
}

async fn open(
    registry: &SessionRegistry,
    config: &ReefConfig,
    path: &Path,
) -> Result<Arc<Session>, CliError> {
    let session = registry.open(path, config.checkpoint_dir.as_deref()).await?;
    Ok(session)
}

async fn view(registry: &SessionRegistry, config: &ReefConfig, args: ViewArgs) -> Result<(), CliError> {
    let session = open(registry, config, &args.file).await?;
    let length = args.length.unwrap_or(config.viewport_capacity);
    let viewport = session.create_viewport(args.offset, length).await?;
    let window = viewport.read().await?;
    let meta = session.snapshot();

    println!(
        "{}  {} bytes  {}",
        meta.file_name, meta.computed_file_size, meta.content_type
    );
    print!("{}", hexdump(window.offset, &window.data));
    println!(
        "window {}..{} ({} bytes, {} following)",
        window.offset,
        window.end(),
        window.length(),
        window.following_byte_count
    );
    Ok(())
}

async fn search_file(
    registry: &SessionRegistry,
    config: &ReefConfig,
    args: SearchArgs,
) -> Result<(), CliError> {
    let pattern = parse_bytes(&args.pattern, args.pattern_args.hex)?;
    if pattern.is_empty() {
        return Err(CliError::InvalidArgument("pattern must not be empty".into()));
    }
    let session = open(registry, config, &args.file).await?;
    let query = SearchQuery::new(pattern)
        .case_insensitive(args.pattern_args.ignore_case)
        .within(args.offset, args.length)
        .limit(args.limit);
    let matches = search::search(&session, &query).await?;
    for offset in &matches {
        println!("{offset:#010x}  {offset}");
    }
    println!("{} match(es)", matches.len());
    Ok(())
}

async fn replace(
    registry: &SessionRegistry,
    config: &ReefConfig,
    args: ReplaceArgs,
) -> Result<(), CliError> {
    let pattern = parse_bytes(&args.pattern, args.pattern_args.hex)?;
    let replacement = parse_bytes(&args.replacement, args.pattern_args.hex)?;
    if pattern.is_empty() {
        return Err(CliError::InvalidArgument("pattern must not be empty".into()));
    }
    let session = open(registry, config, &args.file).await?;
    // A live viewport gives a failed notify something to fall back on.
    session.create_viewport(0, config.viewport_capacity).await?;

    let query = SearchQuery::new(pattern).case_insensitive(args.pattern_args.ignore_case);
    let report = search::replace_all(&session, &query, replacement).await?;
    match &report.reconciliation {
        Reconciliation::Notified => {}
        Reconciliation::FallbackRefresh { cause } | Reconciliation::Unresolved { cause } => {
            warn!(target: "reef::cli", %cause, "viewport notification degraded");
        }
    }
    println!(
        "replaced {} match(es); size {} bytes",
        report.replaced, report.metadata.computed_file_size
    );
    if report.replaced == 0 {
        return Ok(());
    }
    persist(&session, &args.save).await
}

async fn edit(registry: &SessionRegistry, config: &ReefConfig, args: EditArgs) -> Result<(), CliError> {
    let replacement = parse_bytes(&args.bytes, true)?;
    if replacement.is_empty() {
        return Err(CliError::InvalidArgument("no bytes to write".into()));
    }
    let session = open(registry, config, &args.file).await?;
    let size = session.counts().computed_file_size;
    if args.offset > size {
        return Err(CliError::InvalidArgument(format!(
            "offset {} is past the end of the file ({size} bytes)",
            args.offset
        )));
    }

    // Overwrite in place; anything past the end of the file is appended.
    let viewport = session
        .create_viewport(args.offset, replacement.len() as u64)
        .await?;
    let original = viewport.read().await?.data;
    let serial = session.edit(args.offset, original, replacement).await?;
    let meta = session.snapshot();
    println!(
        "change {serial} applied; {} change(s), size {} bytes",
        meta.change_count, meta.computed_file_size
    );
    persist(&session, &args.save).await
}

async fn persist(session: &Session, args: &SaveArgs) -> Result<(), CliError> {
    let prompt: Box<dyn OverwritePrompt> = if args.yes {
        Box::new(FixedAnswer(true))
    } else {
        Box::new(StdinPrompt)
    };
    let outcome = match &args.save_as {
        Some(path) => save::save_as(session, path, true, prompt.as_ref()).await?,
        None => save::save(session, prompt.as_ref()).await?,
    };
    match outcome {
        SaveOutcome::Saved { path, forced, .. } => {
            let note = if forced { " (overwrote external changes)" } else { "" };
            println!("saved {}{note}", path.display());
        }
        SaveOutcome::Cancelled { path } => {
            println!("not saved: {} changed on disk", path.display());
        }
    }
    Ok(())
}

/// Asks on the terminal; anything other than "y"/"yes" declines.
struct StdinPrompt;

#[async_trait]
impl OverwritePrompt for StdinPrompt {
    async fn confirm_overwrite(&self, path: &Path) -> bool {
        let mut stderr = tokio::io::stderr();
        let question = format!(
            "{} changed on disk since it was opened. Overwrite? [y/N] ",
            path.display()
        );
        if stderr.write_all(question.as_bytes()).await.is_err() {
            return false;
        }
        let _ = stderr.flush().await;

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(err) => {
                warn!(target: "reef::cli", error = %err, "could not read overwrite answer");
                false
            }
        }
    }
}
