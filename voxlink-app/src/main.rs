//! Voxlink terminal host.
//!
//! Runs one live call: prints transcript and speaking events as they
//! arrive, and tears the session down on Ctrl-C or when the remote side
//! hangs up.

mod cli;
mod settings;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voxlink_core::{
    audio::device::{list_input_devices, list_output_devices, DeviceInfo},
    AudioBackend, CpalBackend, LiveSession, SessionState, TranscriptKind, WavInputBackend,
    WsConnector,
};

use cli::{Cli, Commands};
use settings::{default_settings_path, load_settings, save_settings, AppSettings, ENV_API_KEY};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxlink=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);

    match cli.command {
        Commands::Devices { json } => print_devices(json),
        Commands::Call {
            endpoint,
            voice,
            instructions,
            input_device,
            output_device,
            input_wav,
            save,
        } => {
            let mut settings = load_settings(&settings_path);
            settings.apply_env_overrides(|key| std::env::var(key).ok());
            override_with(&mut settings.endpoint, endpoint);
            override_with(&mut settings.voice, voice);
            override_with(&mut settings.instructions, instructions);
            if input_device.is_some() {
                settings.preferred_input_device = input_device;
            }
            if output_device.is_some() {
                settings.preferred_output_device = output_device;
            }
            settings.normalize();

            if save {
                save_settings(&settings_path, &settings)
                    .with_context(|| format!("saving {}", settings_path.display()))?;
                info!(path = %settings_path.display(), "settings saved");
            }

            let backend: Box<dyn AudioBackend> = match input_wav {
                Some(path) => Box::new(WavInputBackend {
                    path,
                    preferred_output: settings.preferred_output_device.clone(),
                }),
                None => Box::new(CpalBackend {
                    preferred_input: settings.preferred_input_device.clone(),
                    preferred_output: settings.preferred_output_device.clone(),
                }),
            };
            run_call(&settings, backend.as_ref()).await
        }
    }
}

fn override_with(slot: &mut String, value: Option<String>) {
    if let Some(value) = value {
        *slot = value;
    }
}

async fn run_call(settings: &AppSettings, backend: &dyn AudioBackend) -> anyhow::Result<()> {
    if settings.api_key.is_none() {
        warn!("no API key configured; set {ENV_API_KEY}");
    }

    let session = LiveSession::new(settings.session_config());
    let mut speaking = session.subscribe_speaking();
    let mut transcripts = session.subscribe_transcripts();
    let mut status = session.subscribe_status();

    let handle = session
        .start(backend, &WsConnector)
        .await
        .context("starting live session")?;
    println!("Connected. Speak now; Ctrl-C hangs up.");

    let mut close_detail = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("hanging up");
                break;
            }
            event = speaking.recv() => match event {
                Ok(event) => println!("{}", if event.speaking { "[agent speaking]" } else { "[agent listening]" }),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "speaking events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = transcripts.recv() => match event {
                Ok(event) if event.kind == TranscriptKind::TurnComplete => println!("[turn complete]"),
                Ok(event) => println!("agent: {}", event.text),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "transcript events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = status.recv() => match event {
                Ok(event) if event.state == SessionState::Closed => {
                    close_detail = event.detail;
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.cleanup();

    let snap = session.diagnostics_snapshot();
    println!(
        "Call ended{}. frames sent: {}, agent chunks played: {}, interruptions: {}",
        close_detail.map(|d| format!(" ({d})")).unwrap_or_default(),
        snap.frames_sent,
        snap.chunks_scheduled,
        snap.interruptions,
    );
    Ok(())
}

fn print_devices(json: bool) -> anyhow::Result<()> {
    let inputs = list_input_devices();
    let outputs = list_output_devices();
    if json {
        let all: Vec<&DeviceInfo> = inputs.iter().chain(outputs.iter()).collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }

    for (title, list) in [("Input devices", &inputs), ("Output devices", &outputs)] {
        println!("{title}:");
        if list.is_empty() {
            println!("  (none)");
        }
        for device in list.iter() {
            let mut tags = Vec::new();
            if device.is_default {
                tags.push("default");
            }
            if device.is_loopback_like {
                tags.push("loopback?");
            }
            let suffix = if tags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", tags.join(", "))
            };
            println!("  {}{suffix}", device.name);
        }
    }
    Ok(())
}
