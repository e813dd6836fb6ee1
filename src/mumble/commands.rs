use crate::mumble::capture::InputMode;
use crate::mumble::config::{parse_base64, parse_bool, parse_int, parse_number};
use crate::mumble::varint::Vec3;
use crate::transport::errors::TransportError;

/// Longest accepted `key<TAB>value` command, in bytes.
pub const MAX_COMMAND_LEN: usize = 256;

/// Host requests applied on the next tick.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    ForceTcp(bool),
    Loopback(bool),
    SendMessage(String),
    ConfigureUser { external_id: i32, volume: f32 },
    CreateChannel(String),
    DestroyChannel(String),
    JoinChannel(String),
    SetComment(String),
    SetPluginContext(Vec<u8>),
    SetPluginIdentity(String),
    SetSelfMute(bool),
    SetTexture(Vec<u8>),
    SetBitrate(i32),
    SetInputMode(InputMode),
    SetMinAmplitude(f32),
    PushToTalk(bool),
    /// Listener-relative source position attached to outgoing voice.
    SetPosition(Vec3),
}

fn parse_position(key: &str, value: &str) -> Result<Vec3, TransportError> {
    let mut axes = value.split('\t').map(|axis| parse_number(key, axis));
    match (axes.next(), axes.next(), axes.next(), axes.next()) {
        (Some(x), Some(y), Some(z), None) => Ok(Vec3::new(x? as f32, y? as f32, z? as f32)),
        _ => Err(TransportError::InvalidConfig(format!(
            "{key}: expected x<TAB>y<TAB>z"
        ))),
    }
}

impl Command {
    /// `Ok(None)` for keys that are not commands.
    pub fn parse(key: &str, value: Option<&str>) -> Result<Option<Command>, TransportError> {
        let text = || value.unwrap_or_default();
        let command = match key {
            "system.forceTCP" => Command::ForceTcp(parse_bool(key, text())?),
            "system.loopback" => Command::Loopback(parse_bool(key, text())?),
            "action.sendMessage" => Command::SendMessage(text().to_string()),
            "action.configureUser" => {
                let (id, volume) = text().split_once('\t').ok_or_else(|| {
                    TransportError::InvalidConfig(format!("{key}: expected userID<TAB>volume"))
                })?;
                Command::ConfigureUser {
                    external_id: parse_int(key, id)? as i32,
                    volume: parse_number(key, volume)? as f32,
                }
            }
            "action.createChannel" => Command::CreateChannel(text().to_string()),
            "action.destroyChannel" => Command::DestroyChannel(text().to_string()),
            "user.channel" => Command::JoinChannel(text().to_string()),
            "user.comment" => Command::SetComment(text().to_string()),
            "user.pluginContext" => Command::SetPluginContext(parse_base64(key, text())?),
            "user.pluginIdentity" => Command::SetPluginIdentity(text().to_string()),
            "user.selfMute" => Command::SetSelfMute(parse_bool(key, text())?),
            "user.texture" => Command::SetTexture(parse_base64(key, text())?),
            "audio.inputBitrate" => Command::SetBitrate(parse_int(key, text())? as i32),
            "audio.inputMode" => Command::SetInputMode(
                text()
                    .parse()
                    .map_err(|err| TransportError::InvalidConfig(format!("{key}: {err}")))?,
            ),
            "audio.inputMode.amplitude.minValue" => {
                Command::SetMinAmplitude(parse_number(key, text())? as f32)
            }
            "audio.pushToTalk" => Command::PushToTalk(parse_bool(key, text())?),
            "data.position" => Command::SetPosition(parse_position(key, text())?),
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// Parses one `key<TAB>value` line from the host.
    pub fn parse_line(line: &str) -> Result<Option<Command>, TransportError> {
        if line.len() > MAX_COMMAND_LEN {
            return Err(TransportError::InvalidConfig(format!(
                "command longer than {MAX_COMMAND_LEN} bytes"
            )));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        match line.split_once('\t') {
            Some((key, value)) => Self::parse(key, Some(value)),
            None => Self::parse(line, None),
        }
    }
}
