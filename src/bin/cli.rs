//! CLI binary for sori.

use clap::{Parser, Subcommand};
use sori::audio::capture::MicCapture;
use sori::audio::playback::CpalPlayer;
use sori::contracts::{Memory, Player};
use sori::llm::HttpLlmClient;
use sori::memory::{ExtractionMemory, NullMemory};
use sori::persona::load_persona;
use sori::pipeline::messages::SttEvent;
use sori::stt::WsSttClient;
use sori::tts::HttpTtsClient;
use sori::vad::EnergyVad;
use sori::{Collaborators, Orchestrator, Settings};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Sori: real-time voice conversation orchestrator.
#[derive(Parser)]
#[command(name = "sori", version, about)]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start the voice conversation loop.
    Run,

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG wins; SORI_LOG_LEVEL tunes just this crate.
    let default_level = std::env::var("SORI_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("sori={default_level}"))),
        )
        .init();

    match Cli::parse().command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Devices => list_devices(),
    }
}

async fn run() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let capture = match MicCapture::new(&settings.audio) {
        Ok(capture) => capture,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let persona = load_persona(settings.llm.persona_path.as_deref());
    let (stt_tx, stt_rx) = mpsc::unbounded_channel::<SttEvent>();

    let player: Arc<tokio::sync::Mutex<dyn Player>> =
        Arc::new(tokio::sync::Mutex::new(CpalPlayer::new(settings.audio.clone())));
    let memory: Arc<dyn Memory> = if settings.memory.enabled {
        Arc::new(ExtractionMemory::new(
            settings.llm.clone(),
            settings.memory.clone(),
        ))
    } else {
        Arc::new(NullMemory)
    };

    let collaborators = Collaborators {
        vad: Box::new(EnergyVad::new(&settings.vad)),
        stt: Box::new(WsSttClient::new(settings.stt.clone(), stt_tx)),
        llm: Arc::new(HttpLlmClient::new(settings.llm.clone())),
        tts: Arc::new(HttpTtsClient::new(settings.tts.clone())),
        player,
        memory,
    };

    let orchestrator = Orchestrator::new(
        settings.clone(),
        collaborators,
        stt_rx,
        persona,
        HttpLlmClient::default_tools(),
    );

    let shutdown = orchestrator.shutdown_token();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            ctrl_c_shutdown.cancel();
        }
    });

    let diag = orchestrator.diagnostics_handle();
    let server_config = settings.server.clone();
    orchestrator
        .registry()
        .spawn("http-server", move |token| async move {
            if let Err(e) = sori::server::run_server(server_config, diag, token).await {
                error!("control surface failed: {e}");
            }
        });

    println!("sori v{}", env!("CARGO_PKG_VERSION"));
    println!("Ready! Speak into your microphone. Press Ctrl+C to stop.\n");

    match orchestrator.run(Some(capture)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn list_devices() -> ExitCode {
    match MicCapture::list_input_devices() {
        Ok(devices) => {
            println!("Input devices:");
            for (index, name) in devices.iter().enumerate() {
                println!("  [{index}] {name}");
            }
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    }
    match CpalPlayer::list_output_devices() {
        Ok(devices) => {
            println!("Output devices:");
            for name in devices {
                println!("  {name}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}
