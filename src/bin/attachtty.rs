//! Attacher executable: connect to a host's rendezvous socket (locally or
//! through ssh) and relay the terminal.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use detachtty::attach::{self, AttachMode};
use detachtty::logging::{self, LogSink};
use detachtty::signals;

#[derive(Parser, Debug)]
#[command(
    name = "attachtty",
    version,
    about = "Attach the current terminal to a detachtty session"
)]
struct Args {
    /// SOCKET-PATH, or user@host:SOCKET-PATH to attach over ssh
    socket: String,

    /// Text to send to the session (scripted mode)
    text: Option<String>,

    /// Scripted-mode wall-clock budget in seconds (default 1)
    timeout: Option<String>,
}

/// Values that don't parse, and non-positive ones, fall back to 1 second.
fn effective_timeout(arg: Option<&str>) -> Duration {
    let seconds = arg
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|&t| t > 0)
        .unwrap_or(1);
    Duration::from_secs(seconds as u64)
}

/// `user@host:PATH` (or `host:PATH`) splits at the first colon.
fn split_remote(socket: &str) -> Option<(&str, &str)> {
    socket.split_once(':')
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let sink = LogSink::stderr();
    logging::init(&sink);

    if let Some((host, path)) = split_remote(&args.socket) {
        // One attacher per machine; the network leg belongs to ssh. -t
        // forces a remote pty, which the remote attacher's raw mode and
        // SIGINT forwarding need.
        info!("connecting through ssh to {} on {}", path, host);
        let mut cmd = Command::new("ssh");
        cmd.arg("-t").arg(host).arg("attachtty").arg(path);
        if let Some(text) = &args.text {
            cmd.arg(text);
            if let Some(timeout) = &args.timeout {
                cmd.arg(timeout);
            }
        }
        let err = cmd.exec();
        logging::fatal(&format!("exec ssh failed ({err})"));
        std::process::exit(1);
    }

    if let Err(e) = signals::install_attacher_handlers() {
        logging::fatal(&format!("installing signal handlers ({e})"));
        std::process::exit(1);
    }

    info!("connecting directly to {}", args.socket);

    let mode = match args.text {
        Some(text) => AttachMode::Scripted {
            text,
            timeout: effective_timeout(args.timeout.as_deref()),
        },
        None => AttachMode::Interactive,
    };

    if let Err(e) = attach::run(Path::new(&args.socket), mode) {
        // Raises SIGTERM; our own handler turns that into the fatal flag,
        // so we fall through to the diagnostic below and exit 0.
        logging::fatal(&format!("{e:#}"));
    }

    if let Some(sig) = signals::take_fatal() {
        info!("got signal {}, exiting", sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_prefix_splits_at_first_colon() {
        assert_eq!(
            split_remote("user@example.org:/tmp/repl"),
            Some(("user@example.org", "/tmp/repl"))
        );
        assert_eq!(split_remote("box:/tmp/repl"), Some(("box", "/tmp/repl")));
        assert_eq!(split_remote("/tmp/repl"), None);
    }

    #[test]
    fn timeout_defaults_and_clamps() {
        assert_eq!(effective_timeout(None), Duration::from_secs(1));
        assert_eq!(effective_timeout(Some("30")), Duration::from_secs(30));
        assert_eq!(effective_timeout(Some("0")), Duration::from_secs(1));
        assert_eq!(effective_timeout(Some("-5")), Duration::from_secs(1));
        assert_eq!(effective_timeout(Some("junk")), Duration::from_secs(1));
    }

    #[test]
    fn text_switches_to_scripted_mode() {
        let args = Args::try_parse_from(["attachtty", "/tmp/repl", "(+ 1 2)", "2"]).expect("parse");
        assert_eq!(args.text.as_deref(), Some("(+ 1 2)"));
        assert_eq!(args.timeout.as_deref(), Some("2"));

        let args = Args::try_parse_from(["attachtty", "/tmp/repl"]).expect("parse");
        assert!(args.text.is_none());
    }
}
