//! Omni Call: hands-free voice conversation from the terminal.
//!
//! Usage:
//!   cargo run -p omni-call -- [--url ws://host:8000/ws/conversation] [--config path] [--json]
//!   cargo run -p omni-call -- --list-devices
//!
//! The microphone is armed as soon as the conversation channel opens. Commands on stdin:
//! `m` mute/unmute, `r` retry after an error, `s` status, `q` hang up (Ctrl-C also hangs up).

use anyhow::Context;
use omni_voice::{
    open_conversation, ConnectionState, Conversation, ConversationSnapshot, HostNotice,
    MicrophoneGate, SessionHandle, VoiceConfig,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[omni-call] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let mut url: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut list_devices = false;
    let mut json = false;

    while let Some(a) = args.next() {
        match a.as_str() {
            "--url" => url = args.next(),
            "--config" => config_path = args.next().map(PathBuf::from),
            "--list-devices" => list_devices = true,
            "--json" => json = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => warn!(arg = other, "Unknown argument ignored"),
        }
    }

    if list_devices {
        for name in MicrophoneGate::list_input_devices().context("listing input devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut config = match &config_path {
        Some(path) => VoiceConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => VoiceConfig::load().context("loading config")?,
    };
    if let Some(url) = url {
        config.transport.url = url;
    }

    let Conversation {
        session,
        handle,
        mut notices,
        mut connection,
    } = open_conversation(&config).context("opening conversation")?;
    let session_task = tokio::spawn(session.run());

    info!(url = %config.transport.url, "Omni call started; waiting for the channel to open");
    println!("Commands: m = mute/unmute, r = retry, s = status, q = hang up");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut watching = true;
    let mut started = false;

    loop {
        tokio::select! {
            changed = connection.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let state = *connection.borrow_and_update();
                println!("[ws] {}", state);
                if state == ConnectionState::Open && !started {
                    started = handle.start();
                }
            }
            notice = notices.recv() => match notice {
                Some(HostNotice::CallEnded) | None => break,
                Some(notice) => print_notice(&notice, json),
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => command(line.trim(), &handle, json).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin read failed; keyboard commands disabled");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("CTRL-C received; hanging up");
                handle.end_call();
            }
        }
    }

    let last = session_task.await.context("session task")?;
    print_snapshot(&last, json);
    info!(turns = last.turn, "Omni call ended");
    Ok(())
}

async fn command(input: &str, handle: &SessionHandle, json: bool) {
    match input {
        "" => {}
        "m" => {
            handle.toggle_mute();
        }
        "r" => {
            handle.retry();
        }
        "s" => {
            if let Some(snapshot) = handle.snapshot().await {
                print_snapshot(&snapshot, json);
            }
        }
        "q" => {
            handle.end_call();
        }
        other => eprintln!("Unknown command {:?} (m, r, s, q)", other),
    }
}

fn print_notice(notice: &HostNotice, json: bool) {
    if json {
        let value = match notice {
            HostNotice::StateChanged { from, to } => {
                serde_json::json!({ "event": "state_changed", "from": from, "to": to })
            }
            HostNotice::Error { error, fatal } => serde_json::json!({
                "event": "error",
                "error": error.to_string(),
                "fatal": fatal,
                "restart_required": error.requires_restart(),
            }),
            HostNotice::CallEnded => serde_json::json!({ "event": "call_ended" }),
        };
        println!("{}", value);
        return;
    }

    match notice {
        HostNotice::StateChanged { to, .. } => println!("[turn] {}", to),
        HostNotice::Error { error, fatal: true } if error.requires_restart() => {
            eprintln!("[error] {} (restart omni-call to reconnect, q to hang up)", error)
        }
        HostNotice::Error { error, fatal: true } => {
            eprintln!("[error] {} (press r to retry, q to hang up)", error)
        }
        HostNotice::Error { error, fatal: false } => eprintln!("[warn] {}", error),
        HostNotice::CallEnded => println!("[call] ended"),
    }
}

fn print_snapshot(snapshot: &ConversationSnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Snapshot not serializable"),
        }
    } else {
        println!("{}", snapshot);
    }
}

fn print_usage() {
    eprintln!("Omni Call — hands-free voice conversation");
    eprintln!("  --url URL          Conversation endpoint (default from config, ws://localhost:8000/ws/conversation)");
    eprintln!("  --config PATH      Config file (default OMNI_CONFIG or config/conversation.toml)");
    eprintln!("  --list-devices     Print input devices and exit");
    eprintln!("  --json             Print notices and status as JSON lines");
    eprintln!();
    eprintln!("Environment overrides: OMNI_TRANSPORT__URL, OMNI_CAPTURE__HOLD_MS, ...");
}
