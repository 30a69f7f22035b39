//! Line-oriented command syntax for the interactive binary.

use crate::audio::device::DeviceKind;

pub const HELP: &str = "\
commands:
  preview            show who is in the channel before joining
  join               join the channel
  cancel             dismiss the preview
  mute | deafen      toggle microphone / speakers
  video | share      toggle camera / screen share
  volume <0-100>     set playback volume
  input <id>         switch microphone
  output <id>        switch speakers
  devices            list audio devices
  status             print the session snapshot
  navigate <path>    simulate a route change
  leave              leave the channel
  quit               leave and exit";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Preview,
    Join,
    Cancel,
    Mute,
    Deafen,
    Video,
    Share,
    Volume(u8),
    Device(DeviceKind, String),
    Devices,
    Status,
    Navigate(String),
    Leave,
    Quit,
    Help,
}

/// Parse a line. `Ok(None)` for blank input.
pub fn parse(line: &str) -> Result<Option<CliCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "preview" => CliCommand::Preview,
        "join" => CliCommand::Join,
        "cancel" => CliCommand::Cancel,
        "mute" => CliCommand::Mute,
        "deafen" => CliCommand::Deafen,
        "video" => CliCommand::Video,
        "share" => CliCommand::Share,
        "volume" => {
            let value: u32 = rest
                .parse()
                .map_err(|_| format!("volume expects a number, got '{}'", rest))?;
            CliCommand::Volume(value.min(100) as u8)
        }
        "input" | "output" => {
            if rest.is_empty() {
                return Err(format!("{} expects a device id", word));
            }
            let kind = word.parse::<DeviceKind>()?;
            CliCommand::Device(kind, rest.to_string())
        }
        "devices" => CliCommand::Devices,
        "status" => CliCommand::Status,
        "navigate" => {
            if rest.is_empty() {
                return Err("navigate expects a path".to_string());
            }
            CliCommand::Navigate(rest.to_string())
        }
        "leave" => CliCommand::Leave,
        "quit" | "exit" => CliCommand::Quit,
        "help" | "?" => CliCommand::Help,
        other => return Err(format!("unknown command '{}' (try 'help')", other)),
    };
    Ok(Some(command))
}
