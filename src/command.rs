use std::str::FromStr;

use strum_macros::EnumString;

pub const COMMAND_PREFIX: char = '!';

pub const HELP_TEXT: &str = "**Commands:**\n\
`!new` - start a new session (kill + respawn)\n\
`!model <name>` - restart with a different model (sonnet, opus, haiku)\n\
`!abort` - abort current task\n\
`!help` - this message\n\
\n\
Any other message is sent to the worker as a prompt.";

pub const MODEL_USAGE: &str = "Usage: `!model <name>` (sonnet, opus, haiku)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
enum CommandName {
    New,
    Model,
    Abort,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    /// `None` when no model name was given.
    Model(Option<String>),
    Abort,
    Help,
    /// Lowercased name of a command nobody knows.
    Unknown(String),
}

/// A classified incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    Prompt(String),
    /// Nothing but whitespace.
    Empty,
}

impl Input {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Input::Empty;
        }
        let Some(body) = text.strip_prefix(COMMAND_PREFIX) else {
            return Input::Prompt(text.to_string());
        };

        let (name, args) = match body.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (body, ""),
        };

        let command = match CommandName::from_str(name) {
            Ok(CommandName::New) => Command::New,
            Ok(CommandName::Model) => {
                Command::Model(Some(args).filter(|a| !a.is_empty()).map(str::to_string))
            }
            Ok(CommandName::Abort) => Command::Abort,
            Ok(CommandName::Help) => Command::Help,
            Err(_) => Command::Unknown(name.to_lowercase()),
        };
        Input::Command(command)
    }
}
