//! Parsing of admin console and chat client input lines.
//!
//! Parsing is pure: it turns a line into a command or a usage error and
//! leaves execution to the caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::file_transfer::TransferTarget;
use crate::utils::strip_quotes;

pub const ADMIN_HELP: &str = "\
Admin commands:
  /msg <text>              broadcast a message to every user
  /msg @user <text>        send a private message
  /send <path>             send a file to every user
  /send @user <path>       send a file to one user
  /list                    list online users
  /user <name>             show details for one user
  /find <pattern>          search users by name
  /help                    show this help
  /quit                    shut the relay down";

pub const CLIENT_HELP: &str = "\
Chat commands:
  /send <path>             send a file to the room
  /help                    show this help
  /quit                    leave the chat
  anything else is sent as a chat message";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0} (type /help for a list)")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Commands start with '/' (type /help for a list)")]
    NotACommand,

    #[error("Nothing to do")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Broadcast(String),
    Direct { name: String, body: String },
    SendFile { target: TransferTarget, path: PathBuf },
    List,
    User(String),
    Find(String),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Chat(String),
    SendFile(PathBuf),
    Help,
    Quit,
}

/// Split `/verb rest` into a lowercased verb and the trimmed remainder
fn split_verb(line: &str) -> (String, &str) {
    match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_lowercase(), rest.trim()),
        None => (line.to_lowercase(), ""),
    }
}

/// `@name rest` into `(name, rest)`
fn split_target(params: &str) -> Option<(&str, &str)> {
    let rest = params.strip_prefix('@')?;
    let (name, tail) = rest.split_once(char::is_whitespace)?;
    let tail = tail.trim();
    if name.is_empty() || tail.is_empty() {
        return None;
    }
    Some((name, tail))
}

fn parse_path(raw: &str) -> Option<PathBuf> {
    let path = strip_quotes(raw);
    (!path.is_empty()).then(|| PathBuf::from(path))
}

pub fn parse_admin(line: &str) -> Result<AdminCommand, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }
    if !line.starts_with('/') {
        return Err(CommandError::NotACommand);
    }

    let (verb, params) = split_verb(line);
    match verb.as_str() {
        "/quit" => Ok(AdminCommand::Quit),
        "/help" => Ok(AdminCommand::Help),
        "/list" => Ok(AdminCommand::List),
        "/user" if !params.is_empty() => Ok(AdminCommand::User(params.to_string())),
        "/user" => Err(CommandError::Usage("/user <name>")),
        "/find" if !params.is_empty() => Ok(AdminCommand::Find(params.to_string())),
        "/find" => Err(CommandError::Usage("/find <pattern>")),
        "/msg" if params.starts_with('@') => split_target(params)
            .map(|(name, body)| AdminCommand::Direct {
                name: name.to_string(),
                body: body.to_string(),
            })
            .ok_or(CommandError::Usage("/msg @user <text>")),
        "/msg" if !params.is_empty() => Ok(AdminCommand::Broadcast(params.to_string())),
        "/msg" => Err(CommandError::Usage("/msg <text> | /msg @user <text>")),
        "/send" if params.starts_with('@') => split_target(params)
            .and_then(|(name, raw)| {
                parse_path(raw).map(|path| AdminCommand::SendFile {
                    target: TransferTarget::User(name.to_string()),
                    path,
                })
            })
            .ok_or(CommandError::Usage("/send @user <path>")),
        "/send" => parse_path(params)
            .map(|path| AdminCommand::SendFile {
                target: TransferTarget::All,
                path,
            })
            .ok_or(CommandError::Usage("/send <path> | /send @user <path>")),
        _ => Err(CommandError::Unknown(line.to_string())),
    }
}

pub fn parse_client(line: &str) -> Result<ClientCommand, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }
    if !line.starts_with('/') {
        return Ok(ClientCommand::Chat(line.to_string()));
    }

    let (verb, params) = split_verb(line);
    match verb.as_str() {
        "/quit" => Ok(ClientCommand::Quit),
        "/help" => Ok(ClientCommand::Help),
        "/send" => parse_path(params)
            .map(ClientCommand::SendFile)
            .ok_or(CommandError::Usage("/send <path>")),
        _ => Err(CommandError::Unknown(line.to_string())),
    }
}
