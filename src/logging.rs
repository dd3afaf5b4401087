//! Diagnostics for both executables.
//!
//! One `tracing` subscriber per process, writing through a reopenable sink:
//! stderr by default, an append-mode file when `--log-file` is given. The
//! host closes and reopens the file sink on SIGHUP so external rotation
//! works. Line endings are forced to `\r\n` because the sink often shares a
//! terminal that is currently in raw mode.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::getpid;
use tracing::error;
use tracing_subscriber::fmt::MakeWriter;

enum Target {
    Stderr,
    File { path: PathBuf, file: Option<File> },
}

/// Destination for all diagnostics; cheap to clone, reopenable in place.
#[derive(Clone)]
pub struct LogSink(Arc<Mutex<Target>>);

impl LogSink {
    pub fn stderr() -> Self {
        Self(Arc::new(Mutex::new(Target::Stderr)))
    }

    /// Append-mode file sink. If the file cannot be opened, diagnostics fall
    /// back to stderr until a reopen succeeds.
    pub fn file(path: PathBuf) -> Self {
        let file = open_log_file(&path);
        Self(Arc::new(Mutex::new(Target::File { path, file })))
    }

    /// Close and reopen the file target (no-op for stderr).
    pub fn reopen(&self) {
        let mut inner = self.0.lock().expect("log sink lock");
        if let Target::File { path, file } = &mut *inner {
            *file = open_log_file(path);
        }
    }
}

fn open_log_file(path: &PathBuf) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // \n -> \r\n so output stays columnar on a raw terminal.
        let mut out = Vec::with_capacity(buf.len() + 2);
        for &b in buf {
            if b == b'\n' {
                out.push(b'\r');
            }
            out.push(b);
        }
        let mut inner = self.0.lock().expect("log sink lock");
        match &mut *inner {
            Target::File { file: Some(f), .. } => f.write_all(&out)?,
            _ => io::stderr().write_all(&out)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.0.lock().expect("log sink lock");
        match &mut *inner {
            Target::File { file: Some(f), .. } => f.flush(),
            _ => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the process-wide subscriber writing to `sink`.
pub fn init(sink: &LogSink) {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_target(false)
        .with_writer(sink.clone())
        .init();
}

/// Unrecoverable error: log it and deliver SIGTERM to ourselves.
///
/// Before the signal handlers are installed the default disposition kills
/// the process outright; afterwards the fatal flag is set and the main loop
/// performs its orderly teardown. Either way control does not continue past
/// the caller's error path.
pub fn fatal(msg: &str) {
    error!("FATAL {msg}");
    let _ = kill(getpid(), Signal::SIGTERM);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_translates_line_endings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log");
        let mut sink = LogSink::file(path.clone());

        sink.write_all(b"first line\nsecond\n").expect("write");
        assert_eq!(
            std::fs::read(&path).expect("read log"),
            b"first line\r\nsecond\r\n"
        );
    }

    #[test]
    fn reopen_follows_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log");
        let mut sink = LogSink::file(path.clone());

        sink.write_all(b"before\n").expect("write");
        let rotated = dir.path().join("log.1");
        std::fs::rename(&path, &rotated).expect("rotate");

        sink.reopen();
        sink.write_all(b"after\n").expect("write");

        assert_eq!(std::fs::read(&rotated).expect("read"), b"before\r\n");
        assert_eq!(std::fs::read(&path).expect("read"), b"after\r\n");
    }
}
