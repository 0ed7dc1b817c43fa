//! Chunkline CLI

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chunkline::config::Config;
use chunkline::request::HookResult;
use chunkline::storage::ChunkFileReader;
use chunkline::stream::{FileStreamWriter, StreamWriter};
use chunkline::Recorder;

/// Built-in periodic event emitted by the `run` command
const HEARTBEAT_EVENT: &str = "chunkline.Heartbeat";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Chunkline v{}", env!("CARGO_PKG_VERSION"));
        eprintln!();
        eprintln!("Usage: chunkline <command> <path>");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  run <config.toml>       Record until Ctrl-C");
        eprintln!("  inspect <chunk-file>    Print the records of a chunk file or dump");
        process::exit(1);
    }

    let command = &args[1];
    let path = PathBuf::from(&args[2]);

    let result = match command.as_str() {
        "run" => run(&path),
        "inspect" => inspect(&path),
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'chunkline' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    runtime.block_on(record(config))
}

async fn record(config: Config) -> anyhow::Result<()> {
    let writer = Arc::new(FileStreamWriter::new(config.stream.limits()));
    let recorder = Recorder::new(&config, Arc::clone(&writer) as Arc<dyn StreamWriter>)
        .context("Failed to initialize recorder")?;

    let started = Instant::now();
    let heartbeat_writer = Arc::clone(&writer);
    recorder.register_periodic_event(
        HEARTBEAT_EVENT,
        Arc::new(move || -> HookResult {
            let uptime_ms = started.elapsed().as_millis() as u64;
            heartbeat_writer.write_event(HEARTBEAT_EVENT, &uptime_ms.to_le_bytes())?;
            Ok(())
        }),
    );

    for recording_config in &config.recordings {
        let recording = recorder.create_recording(recording_config.options())?;
        let started = match recording_config.delay() {
            Some(delay) => recording.schedule_start(delay),
            None => recording.start(),
        };
        if let Err(e) = started {
            warn!("Recording {} not started: {}", recording_config.name, e);
        }
    }

    info!(
        "Recording {} configured recordings, press Ctrl-C to stop",
        config.recordings.len()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!(
        "Stopping after {} events ({} dropped from memory)",
        writer.events_written(),
        writer.events_dropped()
    );
    recorder.shutdown().context("Shutdown failed")?;
    Ok(())
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let reader = ChunkFileReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let sections = reader
        .sections()
        .with_context(|| format!("Failed to decode {}", path.display()))?;

    println!("File: {} ({} bytes)", path.display(), reader.len());
    for (i, section) in sections.iter().enumerate() {
        println!();
        println!(
            "Chunk {i}: version {}, pid {}, start {} ns, {} records",
            section.header.version,
            section.header.pid,
            section.header.start_nanos,
            section.records.len()
        );
        for record in &section.records {
            println!(
                "  {} {} ({} bytes)",
                record.timestamp,
                record.name,
                record.payload.len()
            );
        }
    }

    Ok(())
}
