pub mod capture;
pub mod channels;
pub mod codec;
pub mod commands;
pub mod config;
pub mod control;
pub mod crypt;
pub mod decode;
pub mod encode;
pub mod events;
pub mod playback;
pub mod pool;
pub mod session;
pub mod state;
pub mod transport;
pub mod udp;
pub mod varint;
pub mod voice;

pub use commands::Command;
pub use config::MumbleConfig;
pub use control::{tls_connect, ControlMessage, ControlRequest, ControlSink, UserStateCommand};
pub use events::{SessionEvent, TextMessage};
pub use playback::{AudioSink, SpeakerBuffer};
pub use session::Session;
pub use transport::{Codecs, HostWatchdog, MumbleTransport};
