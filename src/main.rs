use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use log::{error, info, warn};
use mumble_bridge::mumble::{Command, MumbleConfig, MumbleTransport, SessionEvent};
use mumble_bridge::transport::errors::{SessionOutcome, TransportError};
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(20);
/// Host liveness line: `host.frame<TAB>index`.
const HOST_FRAME_KEY: &str = "host.frame";

/// What one stdin line asks of the bridge.
#[derive(Debug, PartialEq)]
enum HostLine {
    Frame(u64),
    Command(Command),
    Ignored,
}

fn parse_host_line(line: &str) -> HostLine {
    if let Some(index) = line
        .strip_prefix(HOST_FRAME_KEY)
        .and_then(|rest| rest.strip_prefix('\t'))
    {
        return match index.trim().parse() {
            Ok(index) => HostLine::Frame(index),
            Err(err) => {
                warn!("bad host frame index {index:?}: {err}");
                HostLine::Ignored
            }
        };
    }
    match Command::parse_line(line) {
        Ok(Some(command)) => HostLine::Command(command),
        Ok(None) => {
            warn!("unknown command: {line}");
            HostLine::Ignored
        }
        Err(err) => {
            error!("failed to parse command: {err}");
            HostLine::Ignored
        }
    }
}

/// Config comes from the file named on the command line, or from stdin up to
/// the first blank line.
fn read_config() -> Result<String, TransportError> {
    if let Some(path) = std::env::args().nth(1) {
        return Ok(std::fs::read_to_string(path)?);
    }
    let mut config = String::new();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            break;
        }
        config.push_str(&line);
        config.push('\n');
    }
    Ok(config)
}

fn spawn_stdin_reader() -> Result<Receiver<String>, TransportError> {
    let (sender, receiver) = unbounded();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("stdin read failed: {err}");
                        break;
                    }
                }
            }
        })?;
    Ok(receiver)
}

fn publish(events: Vec<SessionEvent>) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in events {
        match serde_json::to_string(&event) {
            Ok(json) => {
                if let Err(err) = writeln!(out, "{json}") {
                    warn!("failed to write event: {err}");
                }
            }
            Err(err) => error!("failed to serialise event: {err}"),
        }
    }
    if let Err(err) = out.flush() {
        warn!("failed to flush events: {err}");
    }
}

fn run() -> Result<SessionOutcome, TransportError> {
    let config = MumbleConfig::parse(&read_config()?)?;
    let mut transport = MumbleTransport::connect(config)?;
    let lines = spawn_stdin_reader()?;

    let mut host_frame = None;
    let mut last_tick = Instant::now();
    let outcome = loop {
        let host_gone = loop {
            match lines.try_recv() {
                Ok(line) => match parse_host_line(&line) {
                    HostLine::Frame(index) => host_frame = Some(index),
                    HostLine::Command(command) => transport.apply_command(command),
                    HostLine::Ignored => {}
                },
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };
        if host_gone {
            info!("host closed stdin");
            break SessionOutcome::Closed;
        }

        let now = Instant::now();
        let outcome = transport.tick(now.duration_since(last_tick), host_frame);
        last_tick = now;
        publish(transport.take_events());
        if let Some(outcome) = outcome {
            break outcome;
        }
        std::thread::sleep(TICK);
    };

    transport.close();
    publish(transport.take_events());
    Ok(outcome)
}

fn app_main() -> i32 {
    mumble_bridge::init_logging();
    let outcome = run().unwrap_or_else(|err| {
        error!("{err}");
        SessionOutcome::from(&err)
    });
    info!("exiting: {outcome:?}");
    outcome.exit_code().code()
}

fn main() {
    std::process::exit(app_main());
}

#[cfg(test)]
mod tests {
    use super::{parse_host_line, HostLine};
    use mumble_bridge::mumble::Command;

    /// Frame index lines feed the watchdog rather than the command parser.
    #[test]
    fn host_frame_lines_are_recognised() {
        // Arrange
        let line = "host.frame\t1234";

        // Act
        let parsed = parse_host_line(line);

        // Assert
        assert_eq!(parsed, HostLine::Frame(1234));
    }

    #[test]
    fn command_lines_are_parsed() {
        assert_eq!(
            parse_host_line("user.selfMute\t1"),
            HostLine::Command(Command::SetSelfMute(true))
        );
    }

    #[test]
    fn unknown_and_malformed_lines_are_ignored() {
        assert_eq!(parse_host_line("nonsense"), HostLine::Ignored);
        assert_eq!(parse_host_line("host.frame\tabc"), HostLine::Ignored);
        assert_eq!(parse_host_line("user.selfMute\tmaybe"), HostLine::Ignored);
    }
}
