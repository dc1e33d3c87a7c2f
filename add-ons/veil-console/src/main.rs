//! Veil console: chat with the gateway from a terminal.
//!
//! Answers arrive with `$N` placeholders and are shown masked; `/reveal N` shows one value
//! locally. The gateway never sees reveal state.

mod client;
mod command;

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use veil_core::{ChatSession, Role, SessionHost, DEFAULT_MASK};

use crate::client::{answer_turn, ConsoleError, GatewayClient};
use crate::command::{Command, HELP};

const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8010";

struct Args {
    url: String,
    conversation: Option<Uuid>,
}

fn usage() -> ! {
    eprintln!("Usage: veil-console [--url <GATEWAY_URL>] [--conversation <UUID>]");
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut args = Args {
        url: std::env::var("VEIL_GATEWAY_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string()),
        conversation: None,
    };
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--url" => {
                args.url = raw.get(i + 1).cloned().unwrap_or_else(|| usage());
                i += 1;
            }
            "--conversation" => {
                let id = raw
                    .get(i + 1)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .unwrap_or_else(|| usage());
                args.conversation = Some(id);
                i += 1;
            }
            "-h" | "--help" => usage(),
            other => {
                eprintln!("Unknown argument: {}", other);
                usage();
            }
        }
        i += 1;
    }
    args
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[veil-console] .env not loaded: {} (using system environment)", e);
    }

    // Diagnostics go to stderr so they never interleave with the transcript.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args();
    let client = GatewayClient::new(args.url);
    let mut host = SessionHost::new(DEFAULT_MASK);

    match args.conversation {
        Some(id) => open_conversation(&client, &mut host, id).await,
        None => {
            let session = host.start_new();
            println!("New conversation {}", session.conversation_id());
        }
    }
    println!("Connected to {}. /help for commands.", client.base());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(target: "veil::session", error = %e, "stdin read failed");
                break;
            }
        };
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Message(text) => send(&client, &mut host, &text).await,
            Command::Reveal(n) => set_revealed(&mut host, n, true),
            Command::Hide(n) => set_revealed(&mut host, n, false),
            Command::New => {
                let session = host.start_new();
                println!("New conversation {}", session.conversation_id());
            }
            Command::List => list(&client).await,
            Command::Open(id) => open_conversation(&client, &mut host, id).await,
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
            Command::Invalid(msg) => println!("{}", msg),
        }
    }
    host.close();
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn send(client: &GatewayClient, host: &mut SessionHost, text: &str) {
    let session = host.ensure_active();
    let (question, body) = session.compose(text);

    // Raw deltas hold only placeholders, so they are safe to echo as they arrive.
    print!("… ");
    let streamed = client
        .chat(&body, |delta| {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        })
        .await;
    println!();

    match streamed {
        Ok(assembler) => {
            if let Some(id) = assembler.conversation_id() {
                if id != session.conversation_id() {
                    tracing::warn!(
                        target: "veil::session",
                        expected = %session.conversation_id(),
                        received = %id,
                        "Answer belongs to a different conversation"
                    );
                }
            }
            session.push(question);
            session.push(answer_turn(&assembler));
            print_last_answer(session);
        }
        Err(ConsoleError::Status { status, body }) if status.is_client_error() => {
            println!("Rejected ({}): {}", status, body);
        }
        Err(e) => println!("Error: {}", e),
    }
}

fn set_revealed(host: &mut SessionHost, index: usize, revealed: bool) {
    let Some(session) = host.active_mut() else {
        println!("No active conversation.");
        return;
    };
    let Some(answer) = session.last_answer_mut() else {
        println!("No answer to reveal yet.");
        return;
    };
    let found = if revealed {
        answer.reveal(index)
    } else {
        answer.conceal(index)
    };
    if found {
        print_last_answer(session);
    } else {
        println!("The last answer has no ${}.", index);
    }
}

fn print_last_answer(session: &ChatSession) {
    if let Some(answer) = session.last_answer() {
        let indices = answer.indices();
        println!("veil: {}", answer.display());
        if !indices.is_empty() {
            let listed: Vec<String> = indices.iter().map(|i| format!("${}", i)).collect();
            println!("      hidden: {} (/reveal N)", listed.join(" "));
        }
    }
}

async fn list(client: &GatewayClient) {
    match client.list().await {
        Ok(records) if records.is_empty() => println!("No stored conversations."),
        Ok(records) => {
            for record in records {
                let preview = record
                    .turns()
                    .iter()
                    .find(|t| t.role == Role::Question)
                    .map(|t| t.message.chars().take(48).collect::<String>())
                    .unwrap_or_default();
                println!(
                    "{}  {}  {:>3} turns  {}",
                    record.id,
                    record.date.format("%Y-%m-%d %H:%M"),
                    record.turns().len(),
                    preview
                );
            }
        }
        Err(e) => println!("Error: {}", e),
    }
}

async fn open_conversation(client: &GatewayClient, host: &mut SessionHost, id: Uuid) {
    let seed = match client.fetch(id).await {
        Ok(Some(record)) => record.into_turns(),
        Ok(None) => {
            println!("Conversation {} not found; starting it empty.", id);
            Vec::new()
        }
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };
    let session = host.open(id, seed);
    println!("Opened conversation {}", id);
    for (role, line) in session.transcript() {
        match role {
            Role::Question => println!("you:  {}", line),
            Role::Answer => println!("veil: {}", line),
        }
    }
}
