//! Line commands read from stdin.

use anyhow::{bail, Result};

use replay_ipc::RecorderCommand;

/// A command typed by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliCommand {
    Save,
    Start,
    Stop,
    Status,
    Devices,
    Help,
    Quit,
}

impl CliCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let word = line.trim().to_ascii_lowercase();
        let command = match word.as_str() {
            "" => return Ok(None),
            "save" | "s" | "clip" => Self::Save,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "status" => Self::Status,
            "devices" => Self::Devices,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => bail!("Unknown command '{}', type 'help' for a list", other),
        };
        Ok(Some(command))
    }

    /// The recorder command this maps to, if it is forwarded to the loop.
    pub fn to_recorder_command(self) -> Option<RecorderCommand> {
        match self {
            Self::Save => Some(RecorderCommand::SaveReplay),
            Self::Start => Some(RecorderCommand::Start),
            Self::Stop => Some(RecorderCommand::Stop),
            Self::Devices => Some(RecorderCommand::GetAudioDevices),
            Self::Quit => Some(RecorderCommand::Shutdown),
            Self::Status | Self::Help => None,
        }
    }
}

pub const HELP: &str = "\
Commands:
  save     save the last window to a replay file
  start    start recording
  stop     stop recording
  status   show recorder and buffer state
  devices  list known audio devices
  quit     stop and exit";
