use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use meshroom::config::{SessionConfig, ice_servers_from_env};
use meshroom::mesh::{ReceivedFile, Session, SessionHandle};
use meshroom::peer::RtcConnector;
use serde_json::json;
use tokio::io::{self, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(relay_url), Some(room)) = (args.next(), args.next()) else {
        eprintln!("usage: mesh_cli <relay-url> <room>");
        std::process::exit(2);
    };

    // 1. Join the room through the relay
    let connector = Arc::new(RtcConnector::new(ice_servers_from_env())?);
    let session = Session::join_room(SessionConfig::new(relay_url, room), connector).await?;
    println!("Joined room {} as {}", session.room_id(), session.local_id());

    // 2. Print whatever the peers send us
    session
        .on_chat(|msg| println!("\n> {}: {}", msg.from, msg.text))
        .await?;
    session
        .on_draw(|msg| println!("\n> {} drew {}", msg.from, msg.event))
        .await?;

    // handlers run inside the session; files are written from here
    let (file_tx, mut file_rx) = mpsc::unbounded_channel::<ReceivedFile>();
    session
        .on_file(move |file| {
            let _ = file_tx.send(file);
        })
        .await?;

    println!("Type a message, /file <path>, /draw <x> <y>, /peers or /quit");

    // 3. Read stdin until EOF or /quit
    let mut stdin = io::BufReader::new(io::stdin()).lines();
    let mut joined = session.joined();
    loop {
        tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&session, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
            Some(file) = file_rx.recv() => save_file(file).await,
            Ok(()) = joined.changed() => {
                if !*joined.borrow() {
                    println!("Relay connection lost; existing peers still work");
                }
            }
        }
    }

    session.leave().await?;
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_line(session: &SessionHandle, line: &str) -> Result<bool, Box<dyn Error>> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return Ok(false),
        "/peers" => {
            let peers = session.peers().await?;
            if peers.is_empty() {
                println!("No peers yet");
            }
            for peer in peers {
                let labels: Vec<&str> = peer.open_channels.iter().map(|l| l.as_str()).collect();
                println!("{} {:?} [{}]", peer.id, peer.state, labels.join(", "));
            }
        }
        "/file" => {
            let path = Path::new(rest.trim());
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => {
                    println!("usage: /file <path>");
                    return Ok(true);
                }
            };
            match tokio::fs::read(path).await {
                Ok(data) => {
                    let sent = session.send_file(name, data).await?;
                    println!("Sent {} to {} peers", path.display(), sent);
                }
                Err(e) => println!("Could not read {}: {}", path.display(), e),
            }
        }
        "/draw" => {
            let coords: Vec<f64> = rest
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            if let [x, y] = coords[..] {
                session.broadcast_draw(&json!({ "x": x, "y": y })).await?;
            } else {
                println!("usage: /draw <x> <y>");
            }
        }
        _ => {
            let sent = session.send_chat(line).await?;
            if sent == 0 {
                println!("(no connected peers)");
            }
        }
    }
    Ok(true)
}

async fn save_file(file: ReceivedFile) {
    // written into the current directory, never a path the peer chose
    let Some(name) = Path::new(&file.name).file_name() else {
        eprintln!("Ignoring file with unusable name {:?}", file.name);
        return;
    };
    match tokio::fs::write(name, &file.data).await {
        Ok(()) => println!(
            "\n> {} sent {} ({} bytes)",
            file.from,
            name.to_string_lossy(),
            file.data.len()
        ),
        Err(e) => eprintln!("Could not save {:?}: {}", name, e),
    }
}
