//! Console input: slash commands or a chat message.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Message(String),
    Reveal(usize),
    Hide(usize),
    New,
    List,
    Open(Uuid),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Message(line.to_string());
        };
        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or("");
        let arg = words.next();
        match (name, arg) {
            ("reveal", Some(n)) => parse_index(n).map_or_else(Command::Invalid, Command::Reveal),
            ("hide", Some(n)) => parse_index(n).map_or_else(Command::Invalid, Command::Hide),
            ("reveal" | "hide", None) => {
                Command::Invalid(format!("/{} needs a placeholder number", name))
            }
            ("open", Some(id)) => Uuid::parse_str(id)
                .map(Command::Open)
                .unwrap_or_else(|_| Command::Invalid(format!("not a conversation id: {}", id))),
            ("open", None) => Command::Invalid("/open needs a conversation id".to_string()),
            ("new", _) => Command::New,
            ("list", _) => Command::List,
            ("help", _) => Command::Help,
            ("quit" | "exit", _) => Command::Quit,
            _ => Command::Invalid(format!("unknown command: /{}", name)),
        }
    }
}

/// Accepts `2` or `$2`; placeholders start at 1.
fn parse_index(raw: &str) -> Result<usize, String> {
    match raw.trim_start_matches('$').parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(format!("not a placeholder number: {}", raw)),
    }
}

pub const HELP: &str = "\
Type a message to chat. Commands:
  /reveal N   show the value behind placeholder N in the last answer
  /hide N     mask it again
  /new        start a new conversation
  /list       recent conversations
  /open ID    switch to a stored conversation
  /quit       exit";
