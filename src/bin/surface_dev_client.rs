//! Interactive development client: drives a running host endpoint from the
//! terminal, printing every envelope and link-status change it sees.

use cart_surface_bridge::{BridgeConfig, ClientConfig, LinkStatus, SurfaceClient};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let url = match std::env::args().nth(1) {
        Some(url) => url,
        None => BridgeConfig::load()
            .unwrap_or_default()
            .surface_url(),
    };
    println!("surface-dev-client: connecting to {url}");
    let handle = SurfaceClient::connect(ClientConfig::new(&url));

    let mut status = handle.status();
    tokio::spawn(async move {
        loop {
            let line = match &*status.borrow_and_update() {
                LinkStatus::Connecting => "link: connecting...".to_string(),
                LinkStatus::Connected => "link: connected".to_string(),
                LinkStatus::Retrying { attempt, limit } => {
                    format!("link: retrying ({attempt}/{limit})...")
                }
                LinkStatus::SlowPolling => "link: retrying (slow polling)...".to_string(),
                LinkStatus::Closed => "link: closed".to_string(),
            };
            println!("{line}");
            if status.changed().await.is_err() {
                break;
            }
        }
    });

    let mut updates = handle.updates();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(envelope) => println!("<- {} {}", envelope.action, envelope.payload),
                Err(RecvError::Lagged(skipped)) => {
                    println!("(skipped {skipped} updates)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { continue };
        let arg = parts.next();
        let sent = match cmd {
            "play" => {
                let payload = match arg.and_then(|s| s.parse::<i64>().ok()) {
                    Some(id) => serde_json::json!({ "songId": id }),
                    None => Value::Null,
                };
                handle.send_action("playTrack", payload).await
            }
            "pause" => handle.send_action("pauseTrack", Value::Null).await,
            "stop" => handle.send_action("stopTrack", Value::Null).await,
            "vol" => match arg.and_then(|s| s.parse::<f64>().ok()) {
                Some(volume) => {
                    handle
                        .send_action("setVolume", serde_json::json!({ "volume": volume }))
                        .await
                }
                None => {
                    println!("usage: vol <0..1>");
                    continue;
                }
            },
            "seek" => match arg.and_then(|s| s.parse::<f64>().ok()) {
                Some(position) => {
                    handle
                        .send_action("seekToPosition", serde_json::json!({ "position": position }))
                        .await
                }
                None => {
                    println!("usage: seek <seconds>");
                    continue;
                }
            },
            "loop" => handle.send_action("toggleLoop", Value::Null).await,
            "mute" => handle.send_action("toggleMute", Value::Null).await,
            "tab" => match arg.and_then(|s| s.parse::<u8>().ok()) {
                Some(tab) => {
                    handle
                        .send_action("setHotkeyTab", serde_json::json!({ "tab": tab }))
                        .await
                }
                None => {
                    println!("usage: tab <1..5>");
                    continue;
                }
            },
            "state" => handle.send_action("getState", Value::Null).await,
            "reconnect" => handle.force_reconnect().await,
            "quit" | "exit" => break,
            "help" => {
                print_help();
                continue;
            }
            other => {
                println!("unknown command: {other} (try 'help')");
                continue;
            }
        };
        if let Err(err) = sent {
            eprintln!("engine gone: {err}");
            break;
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  play [songId] | pause | stop");
    println!("  vol <0..1> | seek <seconds> | loop | mute | tab <1..5>");
    println!("  state | reconnect | quit");
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
