use crate::mumble::capture::{InputMode, DEFAULT_MIN_AMPLITUDE};
use crate::mumble::codec::DEFAULT_BITRATE;
use crate::mumble::commands::Command;
use crate::transport::errors::TransportError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{error, warn};

pub const DEFAULT_USER_AGENT: &str = "mumble-bridge";
pub const ADMIN_USERNAME: &str = "SuperUser";
pub const DEFAULT_OUTPUT_CHANNELS: usize = 2;

fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> TransportError {
    TransportError::InvalidConfig(format!("{key}={value}: {reason}"))
}

/// Numbers are read as floats and truncated, so `"24000.0"` is a valid int.
pub fn parse_number(key: &str, value: &str) -> Result<f64, TransportError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|err| invalid(key, value, err))
}

pub fn parse_int(key: &str, value: &str) -> Result<i64, TransportError> {
    Ok(parse_number(key, value)?.trunc() as i64)
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool, TransportError> {
    Ok(parse_int(key, value)? != 0)
}

pub fn parse_base64(key: &str, value: &str) -> Result<Vec<u8>, TransportError> {
    STANDARD
        .decode(value.trim())
        .map_err(|err| invalid(key, value, err))
}

pub fn parse_multiline(key: &str, value: &str) -> Result<String, TransportError> {
    String::from_utf8(parse_base64(key, value)?).map_err(|err| invalid(key, value, err))
}

/// Startup settings: one `key<TAB>value` pair per line, value optional.
#[derive(Clone, Debug, Default)]
pub struct ConfigBlob {
    entries: Vec<(String, Option<String>)>,
}

impl ConfigBlob {
    pub fn parse(data: &str) -> Self {
        let mut blob = Self::default();
        for line in data.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('\t') {
                Some((key, value)) => (key, Some(value.to_string())),
                None => (line, None),
            };
            match blob.entries.iter_mut().find(|(existing, _)| existing == key) {
                Some(entry) => entry.1 = value,
                None => blob.entries.push((key.to_string(), value)),
            }
        }
        blob
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_deref()))
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn multiline(&self, key: &str) -> Result<Option<String>, TransportError> {
        self.string(key)
            .map(|value| parse_multiline(key, value))
            .transpose()
    }

    pub fn bytes(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.string(key)
            .map(|value| parse_base64(key, value))
            .transpose()
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>, TransportError> {
        self.string(key).map(|value| parse_int(key, value)).transpose()
    }

    pub fn float(&self, key: &str) -> Result<Option<f32>, TransportError> {
        self.string(key)
            .map(|value| parse_number(key, value).map(|number| number as f32))
            .transpose()
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>, TransportError> {
        self.string(key).map(|value| parse_bool(key, value)).transpose()
    }
}

#[derive(Clone, Debug)]
pub struct MumbleConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub user_agent: String,
    /// Published as our comment when connecting as the admin account.
    pub admin_comment: Option<String>,
    pub bitrate: i32,
    pub input_mode: InputMode,
    pub input_device: Option<String>,
    pub min_amplitude: f32,
    pub output_channels: usize,
    pub send_position: bool,
    pub force_tcp: bool,
    pub loopback: bool,
    /// Runtime commands found in the blob, applied once after connecting.
    pub commands: Vec<Command>,
}

impl MumbleConfig {
    pub fn new(server: String, port: u16, username: String) -> Self {
        Self {
            server,
            port,
            username,
            password: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            admin_comment: None,
            bitrate: DEFAULT_BITRATE,
            input_mode: InputMode::default(),
            input_device: None,
            min_amplitude: DEFAULT_MIN_AMPLITUDE,
            output_channels: DEFAULT_OUTPUT_CHANNELS,
            send_position: false,
            force_tcp: false,
            loopback: false,
            commands: Vec::new(),
        }
    }

    pub fn from_blob(blob: &ConfigBlob) -> Result<Self, TransportError> {
        let server = blob
            .string("server.host")
            .ok_or_else(|| TransportError::InvalidConfig("server.host is missing".to_string()))?;
        let port = blob
            .int("server.port")?
            .ok_or_else(|| TransportError::InvalidConfig("server.port is missing".to_string()))?;
        let port = u16::try_from(port)
            .map_err(|_| TransportError::InvalidConfig(format!("server.port out of range: {port}")))?;

        let admin = blob.bool("server.admin")?.unwrap_or(false);
        let user_id = blob.int("server.userID")?;
        let username = match (admin, user_id) {
            (true, _) => ADMIN_USERNAME.to_string(),
            (false, Some(id)) => id.to_string(),
            (false, None) => {
                return Err(TransportError::InvalidConfig(
                    "server.userID is missing".to_string(),
                ))
            }
        };

        let mut config = Self::new(server.to_string(), port, username);
        config.password = blob.string("server.password").map(str::to_string);
        if admin {
            config.admin_comment = user_id.map(|id| id.to_string());
        }
        if let Some(agent) = blob.string("server.userAgent") {
            config.user_agent = agent.to_string();
        }
        if let Some(bitrate) = blob.int("audio.inputBitrate")? {
            config.bitrate = bitrate as i32;
        }
        if let Some(mode) = blob.string("audio.inputMode") {
            config.input_mode = mode.parse().unwrap_or_else(|err| {
                warn!("{err}");
                InputMode::None
            });
        }
        config.input_device = blob.string("audio.inputDevice").map(str::to_string);
        if let Some(min_amplitude) = blob.float("audio.inputMode.amplitude.minValue")? {
            config.min_amplitude = min_amplitude;
        }
        if let Some(channels) = blob.int("audio.outputChannels")? {
            config.output_channels = channels.clamp(1, 2) as usize;
        }
        config.send_position = blob.bool("data.sendPosition")?.unwrap_or(false);
        config.force_tcp = blob.bool("system.forceTCP")?.unwrap_or(false);
        config.loopback = blob.bool("system.loopback")?.unwrap_or(false);

        for (key, value) in blob.entries() {
            match Command::parse(key, value) {
                Ok(Some(command)) => config.commands.push(command),
                Ok(None) => {}
                Err(err) => error!("failed to apply {key}: {err}"),
            }
        }
        Ok(config)
    }

    pub fn parse(data: &str) -> Result<Self, TransportError> {
        Self::from_blob(&ConfigBlob::parse(data))
    }
}
