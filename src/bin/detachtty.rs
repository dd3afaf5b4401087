//! Host executable: bind the rendezvous socket, detach, spawn the command
//! on a pty, and serve attachers.

use std::ffi::OsString;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;

use clap::Parser;
use nix::libc::STDIN_FILENO;
use nix::sys::termios::tcgetattr;
use nix::unistd::getpid;
use tracing::warn;

use detachtty::host::{Host, HostOptions};
use detachtty::logging::{self, LogSink};
use detachtty::pty;
use detachtty::rendezvous;
use detachtty::signals;
use detachtty::term;

#[derive(Parser, Debug)]
#[command(name = "detachtty", version, about = "Run a command on a detached pty, reachable through a rendezvous socket")]
struct Args {
    /// Stay in the foreground instead of daemonising
    #[arg(long)]
    no_detach: bool,

    /// Append every byte read from the child to this transcript file
    #[arg(long, value_name = "PATH")]
    dribble_file: Option<PathBuf>,

    /// Append diagnostics to this file instead of stderr (SIGHUP reopens it)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Record the daemon pid here; also enables stale-socket recovery
    #[arg(long, value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Rendezvous socket path
    socket_path: PathBuf,

    /// Absolute path of the command to run
    command: PathBuf,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
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

    if !args.command.is_absolute() {
        eprintln!(
            "detachtty: \"{}\" is not an absolute path",
            args.command.display()
        );
        std::process::exit(1);
    }

    let log_sink = match &args.log_file {
        Some(path) => LogSink::file(path.clone()),
        None => LogSink::stderr(),
    };
    logging::init(&log_sink);

    // The invoking terminal's settings seed the pty; absent when started
    // from something that isn't one.
    let termios = tcgetattr(unsafe { BorrowedFd::borrow_raw(STDIN_FILENO) }).ok();
    let winsize = term::window_size(STDIN_FILENO);

    let socket_path = rendezvous::truncated_socket_path(&args.socket_path);
    let listen = match rendezvous::bind_and_listen(&socket_path, args.pid_file.as_deref()) {
        Ok(fd) => fd,
        Err(e) => {
            logging::fatal(&format!("{e:#}"));
            std::process::exit(1);
        }
    };

    if !args.no_detach {
        if let Err(e) = pty::daemonize() {
            logging::fatal(&format!("{e:#}"));
            std::process::exit(1);
        }
    }

    if let Some(pid_file) = &args.pid_file {
        if let Err(e) = std::fs::write(pid_file, format!("{}\n", getpid())) {
            warn!("cannot write pid file {}: {}", pid_file.display(), e);
        }
    }

    let child = match pty::spawn_on_pty(&args.command, &args.args, termios.as_ref(), winsize.as_ref())
    {
        Ok(child) => child,
        Err(e) => {
            logging::fatal(&format!("{e:#}"));
            std::process::exit(1);
        }
    };

    if let Err(e) = signals::install_host_handlers() {
        logging::fatal(&format!("installing signal handlers ({e})"));
        std::process::exit(1);
    }

    Host::new(
        listen,
        child,
        HostOptions {
            socket_path,
            pid_file: args.pid_file,
            dribble_path: args.dribble_file,
            log_sink,
        },
    )
    .run()
}
