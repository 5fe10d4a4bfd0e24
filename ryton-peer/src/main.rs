//! ryton-peer — headless collaboration peer.
//!
//! Runs one [`CollaborationHub`] and drives it from stdin, printing every
//! hub event. Configuration comes from the `RYTON_*` environment variables.
//!
//! ```text
//! /connect <addr>        connect to ip, ip:port or host[:port]
//! /close <addr>          close a connection
//! /send <addr> <text>    send a chat message
//! /call <addr>           start a voice call
//! /hangup                end the current call
//! /peers                 list known peers
//! /quit                  shut down and exit
//! ```

use log::{error, info};
use ryton_collab::hub::CollabEvent;
use ryton_collab::{CollabConfig, CollaborationHub};
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};

enum Command<'a> {
    Connect(&'a str),
    Close(&'a str),
    Send(&'a str, &'a str),
    Call(&'a str),
    Hangup,
    Peers,
    Quit,
}

fn parse(line: &str) -> Result<Command<'_>, String> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match verb {
        "/connect" if !rest.is_empty() => Ok(Command::Connect(rest)),
        "/close" if !rest.is_empty() => Ok(Command::Close(rest)),
        "/send" => match rest.split_once(char::is_whitespace) {
            Some((addr, text)) => Ok(Command::Send(addr, text.trim_start())),
            None => Err("usage: /send <addr> <text>".into()),
        },
        "/call" if !rest.is_empty() => Ok(Command::Call(rest)),
        "/hangup" => Ok(Command::Hangup),
        "/peers" => Ok(Command::Peers),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/connect" | "/close" | "/call" => Err(format!("usage: {verb} <addr>")),
        _ => Err(format!("unknown command: {verb}")),
    }
}

fn print_event(event: &CollabEvent) {
    match event {
        CollabEvent::PeerFound { name, address } => println!("+ {name} ({address})"),
        CollabEvent::PeerLost { address } => println!("- {address}"),
        CollabEvent::ConnectionStatus { address: Some(address), status } => println!("[{address}] {status}"),
        CollabEvent::ConnectionStatus { address: None, status } => println!("[hub] {status}"),
        CollabEvent::MessageReceived { address, text } => println!("<{address}> {text}"),
        CollabEvent::CallStateChanged { address, state } => println!("[call {address}] {state}"),
    }
}

/// Returns false on `/quit`.
async fn run_command(hub: &CollaborationHub, line: &str) -> bool {
    let command = match parse(line) {
        Ok(command) => command,
        Err(usage) => {
            println!("{usage}");
            return true;
        }
    };
    match command {
        Command::Connect(input) => {
            hub.connect(input).await;
        }
        Command::Close(input) => match hub.resolve(input).await {
            Ok(peer) => hub.disconnect(peer).await,
            Err(e) => println!("{e}"),
        },
        Command::Send(input, text) => match hub.resolve(input).await {
            Ok(peer) => {
                if let Err(e) = hub.send_message(peer, text).await {
                    println!("{e}");
                }
            }
            Err(e) => println!("{e}"),
        },
        Command::Call(input) => match hub.resolve(input).await {
            Ok(peer) => {
                if let Err(e) = hub.start_call(peer).await {
                    println!("{e}");
                }
            }
            Err(e) => println!("{e}"),
        },
        Command::Hangup => hub.end_call().await,
        Command::Peers => {
            for peer in hub.known_peers().await {
                let state = hub
                    .connection_state(&peer.address)
                    .await
                    .map_or_else(|| "advertised".to_string(), |s| s.to_string());
                println!("{} {} {state}", peer.name, peer.address);
            }
        }
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match CollabConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut hub = CollaborationHub::start(config).await;
    info!(
        "Peer {} listening on port {}",
        hub.identity().name(),
        hub.identity().listen_port()
    );

    if let Some(mut events) = hub.take_event_rx() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if !run_command(&hub, &line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    hub.shutdown().await;
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert!(matches!(parse("/connect 10.0.0.2"), Ok(Command::Connect("10.0.0.2"))));
        assert!(matches!(
            parse("/send 10.0.0.2:9090 hello there"),
            Ok(Command::Send("10.0.0.2:9090", "hello there"))
        ));
        assert!(matches!(parse("/call bob.local"), Ok(Command::Call("bob.local"))));
        assert!(matches!(parse("  /hangup "), Ok(Command::Hangup)));
        assert!(matches!(parse("/quit"), Ok(Command::Quit)));
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert!(parse("/connect").is_err());
        assert!(parse("/send 10.0.0.2").is_err());
        assert!(parse("/dance").is_err());
    }
}
