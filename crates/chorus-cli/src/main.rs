//! # chorus
//!
//! Headless terminal client: joins a session, prints the conversation and
//! reads messages from stdin.

#![deny(unsafe_code)]

mod input;
mod render;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chorus_core::{PersonaId, SessionId};
use chorus_runtime::{RuntimeDeps, SessionRuntime, SessionSeed};
use chorus_settings::ChorusSettings;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::input::Input;

/// Chorus terminal client.
#[derive(Parser, Debug)]
#[command(name = "chorus", about = "Join a Chorus conversation from the terminal")]
struct Cli {
    /// Push-channel endpoint (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Session to join (a new id when omitted).
    #[arg(long)]
    session: Option<String>,

    /// Persona taking part; repeat for several.
    #[arg(long = "persona")]
    personas: Vec<String>,

    /// Turn voice mode on.
    #[arg(long, overrides_with = "no_voice")]
    voice: bool,

    /// Turn voice mode off.
    #[arg(long, overrides_with = "voice")]
    no_voice: bool,

    /// Settings file (defaults to `~/.chorus/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn voice_override(&self) -> Option<bool> {
        match (self.voice, self.no_voice) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

fn load_settings(cli: &Cli) -> Result<ChorusSettings> {
    let mut settings = match &cli.settings {
        Some(path) => chorus_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => chorus_settings::load_settings().context("Failed to load settings")?,
    };
    if let Some(url) = &cli.url {
        settings.connection.url.clone_from(url);
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    if settings.logging.json {
        chorus_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        chorus_core::logging::init_subscriber(&settings.logging.level);
    }

    let session_id = cli.session.clone().map_or_else(SessionId::new, SessionId::from);
    let personas: Vec<PersonaId> = cli.personas.iter().map(|p| PersonaId::from(p.as_str())).collect();
    let mut seed = SessionSeed::new(session_id.clone(), personas);
    if let Some(voice) = cli.voice_override() {
        seed = seed.with_voice(voice);
    }

    let deps = RuntimeDeps::native(&settings).context("Failed to set up audio")?;
    let runtime = SessionRuntime::new(seed, deps);
    let mut events = runtime.subscribe();
    println!("* joining session {session_id} at {}", settings.connection.url);
    if let Err(e) = runtime.connect().await {
        if !e.is_recoverable() {
            runtime.shutdown().await;
            return Err(e).context("Failed to connect");
        }
        tracing::warn!(error = %e, "first connect failed, retrying");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = render::line(&event) {
                        println!("{text}");
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!(lagged = n, "terminal fell behind"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if !handle_input(&runtime, input::parse(&line)).await {
                    break;
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                break;
            }
        }
    }

    tracing::info!("Shutting down...");
    runtime.shutdown().await;
    println!("* bye");
    Ok(())
}

/// Apply one input line. Returns `false` when the user wants to leave.
async fn handle_input(runtime: &SessionRuntime, input: Input) -> bool {
    match input {
        Input::Quit => return false,
        Input::Help => println!("{}", input::HELP),
        Input::Say { content, direct } => {
            if !runtime.send_user_message(&content, direct, None) {
                println!("* not connected, message not sent");
            }
        }
        Input::Play(id) => {
            if !runtime.play(&id).await {
                println!("* cannot play {id}");
            }
        }
        Input::Stop => runtime.stop_all(),
        Input::Voice(on) => {
            runtime.set_voice_enabled(on);
            println!("* voice {}", if on { "on" } else { "off" });
        }
        Input::Volume(v) => {
            let s = runtime.update_audio_settings(v, runtime.audio_settings().speed);
            println!("* volume {:.2}", s.volume);
        }
        Input::Speed(v) => {
            let s = runtime.update_audio_settings(runtime.audio_settings().volume, v);
            println!("* speed {:.2}", s.speed);
        }
        Input::Reconnect => {
            if let Err(e) = runtime.connect().await {
                println!("* reconnect failed: {e}");
            }
        }
        Input::Empty => {}
        Input::Unknown(line) => println!("* unknown input {line:?}, try /help"),
    }
    true
}
