//! Slash command parsing
//!
//! Turns `/join rust`-style lines into the same intents the JSON
//! protocol carries.

use crate::error::AppError;
use crate::message::ClientMessage;

/// Command reference sent for `/help`
pub const HELP_TEXT: &str = "\
Available commands:
  /register <username> <password>  Register a new account
  /login <username> <password>     Login to your account
  /logout                          Logout from your account
  /whoami                          Display your username
  /users                           Show online users
  /join <room>                     Join a chat room
  /leave <room>                    Leave a chat room
  /create <room>                   Create a new room
  /delete <room>                   Delete an empty room
  /list                            List available rooms
  /msg <username> <message>        Send a direct message
  /room <room> <message>           Send to a specific room
  /transfers                       Show your file transfers
  /help                            Show this help message";

pub fn is_command(line: &str) -> bool {
    line.starts_with('/')
}

/// Parse one command line
pub fn parse(line: &str) -> Result<ClientMessage, AppError> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Err(AppError::Invalid("Empty command".to_string()));
    };
    let args: Vec<&str> = parts.collect();

    let msg = match command {
        "/register" => {
            let [username, secret] = exactly::<2>(&args, "Usage: /register <username> <password>")?;
            ClientMessage::Register { username, secret }
        }
        "/login" => {
            let [username, secret] = exactly::<2>(&args, "Usage: /login <username> <password>")?;
            ClientMessage::Login { username, secret }
        }
        "/logout" => ClientMessage::Logout,
        "/whoami" => ClientMessage::WhoAmI,
        "/users" => ClientMessage::ListUsers,
        "/help" => ClientMessage::Help,
        "/join" => {
            let [room] = exactly::<1>(&args, "Usage: /join <room>")?;
            ClientMessage::JoinRoom { room }
        }
        "/leave" => {
            let [room] = exactly::<1>(&args, "Usage: /leave <room>")?;
            ClientMessage::LeaveRoom { room }
        }
        "/create" => {
            let [room] = exactly::<1>(&args, "Usage: /create <room>")?;
            ClientMessage::CreateRoom { room }
        }
        "/delete" => {
            let [room] = exactly::<1>(&args, "Usage: /delete <room>")?;
            ClientMessage::DeleteRoom { room }
        }
        "/list" => ClientMessage::ListRooms,
        "/transfers" => ClientMessage::ListTransfers,
        "/msg" => {
            let (recipient, content) = head_and_rest(&args, "Usage: /msg <username> <message>")?;
            ClientMessage::Direct { recipient, content }
        }
        "/room" => {
            let (room, content) = head_and_rest(&args, "Usage: /room <roomname> <message>")?;
            ClientMessage::Text {
                content,
                room: Some(room),
                recipient: None,
            }
        }
        other => {
            return Err(AppError::Invalid(format!(
                "Unknown command: {}. Type /help for available commands.",
                other
            )))
        }
    };
    Ok(msg)
}

/// The first N arguments; extra trailing words are ignored
fn exactly<const N: usize>(args: &[&str], usage: &str) -> Result<[String; N], AppError> {
    if args.len() < N {
        return Err(AppError::Invalid(usage.to_string()));
    }
    Ok(std::array::from_fn(|i| args[i].to_string()))
}

/// First argument plus the remaining words re-joined with single spaces
fn head_and_rest(args: &[&str], usage: &str) -> Result<(String, String), AppError> {
    match args {
        [head, rest @ ..] if !rest.is_empty() => Ok((head.to_string(), rest.join(" "))),
        _ => Err(AppError::Invalid(usage.to_string())),
    }
}
