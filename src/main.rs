use std::collections::HashSet;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomsync::{BackendConfig, RoomSession, SessionConfig};

const USAGE: &str = "usage: roomsync create | roomsync join <CODE>";

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let backend = match BackendConfig::from_env().build_backend() {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    let session = RoomSession::spawn(backend, SessionConfig::default());

    let joined = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["create"] => session.create_room().await,
        ["join", code] => session.join_room(code).await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let room = match joined {
        Ok(room) => room,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    println!("Room code: {}  (share it with your partner)", room.code);

    // Print messages as they arrive
    let mut updates = session.watch();
    let printer = tokio::spawn(async move {
        let mut shown = HashSet::new();
        loop {
            let fresh: Vec<_> = updates
                .borrow_and_update()
                .messages
                .iter()
                .filter(|m| !shown.contains(&m.id))
                .cloned()
                .collect();
            for message in fresh {
                println!("[{}] {}", message.sender_type, message.text);
                shown.insert(message.id);
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = session.send_message(&line).await {
                    eprintln!("{}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    session.close().await;
    printer.abort();
}
