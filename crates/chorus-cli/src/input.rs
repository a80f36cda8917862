//! Parsing of lines typed at the prompt.

use chorus_core::{MessageId, PersonaId};

/// One line of user input.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    /// Leave the session.
    Quit,
    /// Print the command list.
    Help,
    /// Send a message, optionally addressed to one persona.
    Say {
        /// Message text.
        content: String,
        /// Persona asked directly.
        direct: Option<PersonaId>,
    },
    /// Play a queued clip.
    Play(MessageId),
    /// Stop playback.
    Stop,
    /// Turn voice mode on or off.
    Voice(bool),
    /// Set output volume.
    Volume(f64),
    /// Set playback speed.
    Speed(f64),
    /// Connect again.
    Reconnect,
    /// Blank line.
    Empty,
    /// Unrecognized slash command.
    Unknown(String),
}

/// Help text for the slash commands.
pub const HELP: &str = "\
commands:
  <text>            send a message to every persona
  @<persona> <text> ask one persona directly
  /play <id>        play a queued clip
  /stop             stop playback
  /voice on|off     toggle voice mode
  /volume <0-1>     set volume
  /speed <0.5-2>    set playback speed
  /reconnect        connect again
  /quit             leave";

/// Parse one input line.
pub fn parse(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    if let Some(rest) = line.strip_prefix('@') {
        let (persona, content) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let content = content.trim();
        if persona.is_empty() || content.is_empty() {
            return Input::Unknown(line.to_owned());
        }
        return Input::Say {
            content: content.to_owned(),
            direct: Some(persona.into()),
        };
    }

    let Some(command) = line.strip_prefix('/') else {
        return Input::Say {
            content: line.to_owned(),
            direct: None,
        };
    };
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();
    match (name, arg) {
        ("quit" | "exit", _) => Input::Quit,
        ("help", _) => Input::Help,
        ("play", Some(id)) => Input::Play(id.into()),
        ("stop", _) => Input::Stop,
        ("voice", Some("on")) => Input::Voice(true),
        ("voice", Some("off")) => Input::Voice(false),
        ("volume", Some(v)) => v.parse().map_or_else(|_| Input::Unknown(line.to_owned()), Input::Volume),
        ("speed", Some(v)) => v.parse().map_or_else(|_| Input::Unknown(line.to_owned()), Input::Speed),
        ("reconnect", _) => Input::Reconnect,
        _ => Input::Unknown(line.to_owned()),
    }
}
