mod capture;
mod cli;
mod config;
mod encode;
mod pipeline;
mod protocol;
mod rest;
mod session;
mod sse;
mod viewer;

use anyhow::{Context, Result};
use capture::{LiveFrameSource, ReadFailure, ReconnectPolicy, SourceAddress};
use cli::{CameraArgs, Cli, Commands, StreamArgs};
use futures_util::{pin_mut, StreamExt};
use session::{ServerEvent, StreamSession};
use std::io::Write;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse_args();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Stream(args) => run_stream(args, stop_on_ctrl_c()).await,
        Commands::Text { prompt, model, api_key } => run_text(prompt, &model, api_key.as_deref()).await,
        Commands::Watch {
            camera,
            frame_log_interval,
        } => run_watch(camera, frame_log_interval, stop_on_ctrl_c()).await,
        Commands::Probe { camera, attempts } => run_probe(camera, attempts).await,
    }
}

/// RUST_LOG takes precedence over `--log-level`. Logs go to stderr so model
/// output on stdout stays clean.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn stop_on_ctrl_c() -> CancellationToken {
    let stop = CancellationToken::new();
    let token = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            token.cancel();
        }
    });
    stop
}

fn api_key(explicit: Option<&str>) -> Result<String> {
    let key = cli::resolve_api_key(explicit, |name| std::env::var(name).ok())?;
    Ok(key)
}

async fn run_stream(args: StreamArgs, stop: CancellationToken) -> Result<ExitCode> {
    let api_key = api_key(args.api_key.as_deref())?;
    let config = args.session_config()?;
    let delay = config::seconds("reconnect delay", args.reconnect_delay)?;

    // Finite inputs end the stream; --reconnect keeps a live camera going
    let (policy, on_failure) = if args.reconnect {
        (ReconnectPolicy::forever(delay), ReadFailure::Reconnect)
    } else {
        (ReconnectPolicy::bounded(delay, 1), ReadFailure::EndOfStream)
    };
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let status_printer = viewer::spawn_status_printer(status_rx);
    let mut source = LiveFrameSource::from_address(SourceAddress::parse(&args.source), policy)
        .on_read_failure(on_failure)
        .with_status(status_tx);

    println!("🔌 Connecting to {}...", config.model);
    let mut session = StreamSession::connect(&session::live_url(&api_key), &config)
        .await
        .context("Failed to open live session")?;

    let event_printer = session.receive().map(|events| tokio::spawn(print_events(events)));

    let report = pipeline::run_send_loop(&session, &mut source, &config, &stop).await;
    drop(source);
    if report.is_err() {
        // The transport is gone, no point waiting out the grace period
        session.cancel();
    }

    let summary = session.close().await;
    if let Some(printer) = event_printer {
        let _ = printer.await;
    }
    let _ = status_printer.await;

    let report = report?;
    let summary = summary?;
    info!(
        "sent {} frame(s), skipped {}, received {} message(s)",
        report.frames_sent, report.frames_skipped, summary.messages
    );

    if report.stopped {
        eprintln!("⏹️  Streaming stopped by user");
        return Ok(ExitCode::FAILURE);
    }
    if let Some(err) = report.source_error {
        eprintln!("❌ {}", err);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::SetupAcknowledged => println!("✅ Gemini is ready"),
            ServerEvent::TextDelta(text) => println!("\n🤖 Gemini: {}", text),
            ServerEvent::UsageReport {
                prompt_tokens,
                response_tokens,
            } => println!(
                "\n📊 Token usage → prompt: {}, response: {}",
                prompt_tokens, response_tokens
            ),
        }
    }
}

async fn run_text(prompt: Option<String>, model: &str, explicit_key: Option<&str>) -> Result<ExitCode> {
    let api_key = api_key(explicit_key)?;
    let prompt = prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| config::DEFAULT_TEXT_PROMPT.to_string());

    let client = reqwest::Client::new();
    let chunks = match rest::stream_generate_content(&client, &api_key, model, &prompt).await {
        Ok(chunks) => chunks,
        Err(e) => {
            eprintln!("❌ {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    pin_mut!(chunks);

    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(text) => {
                print!("{}", text);
                stdout.flush()?;
            }
            Err(e) => {
                println!();
                eprintln!("❌ Stream interrupted: {}", e);
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

async fn run_watch(camera: CameraArgs, frame_log_interval: u64, stop: CancellationToken) -> Result<ExitCode> {
    let config = camera.viewer_config(frame_log_interval)?;
    let address = SourceAddress::parse(&config.source);
    println!("📹 Watching {} (Ctrl-C to quit)", address);

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let status_printer = viewer::spawn_status_printer(status_rx);
    let source = LiveFrameSource::from_address(address, ReconnectPolicy::forever(config.reconnect_delay))
        .with_status(status_tx);

    let mut viewer = viewer::Viewer::new(source, &config);
    let result = viewer.run(&stop).await;
    let frames = viewer.frames();
    let last_size = viewer.last_size();
    let last_error = viewer.last_open_error().map(str::to_string);
    drop(viewer);
    let _ = status_printer.await;

    result?;
    match last_size {
        Some((width, height)) => println!("👋 Viewer closed after {} frame(s), last {}x{}", frames, width, height),
        None => println!("👋 Viewer closed after {} frame(s)", frames),
    }
    if let Some(err) = last_error {
        eprintln!("⚠️  Source was still down: {}", err);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_probe(camera: CameraArgs, attempts: u32) -> Result<ExitCode> {
    let config = camera.viewer_config(config::DEFAULT_FRAME_LOG_INTERVAL)?;
    let address = SourceAddress::parse(&config.source);
    println!("🔎 Probing {}", address);

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let status_printer = viewer::spawn_status_printer(status_rx);
    let mut source = LiveFrameSource::from_address(address, viewer::probe_policy(&config, attempts))
        .on_read_failure(ReadFailure::EndOfStream)
        .with_status(status_tx);

    let result = viewer::probe(&mut source).await;
    drop(source);
    let _ = status_printer.await;

    match result {
        Ok(Some((width, height))) => {
            println!("✅ Source is up, frame size {}x{}", width, height);
            Ok(ExitCode::SUCCESS)
        }
        Ok(None) => {
            eprintln!("⚠️  Source opened but returned no frame");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
