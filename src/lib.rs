//! detachtty: run a long-lived interactive process detached from any
//! terminal, and attach to it from later terminal sessions.
//!
//!   detachtty  — host daemon: child on a pty, published through a
//!                Unix-domain rendezvous socket (one client at a time)
//!   attachtty  — attacher: raw-mode terminal relay against that socket
//!
//! Both executables are single-threaded poll loops; everything they share
//! lives here.

pub mod attach;
pub mod fdpass;
pub mod host;
pub mod logging;
pub mod pty;
pub mod relay;
pub mod rendezvous;
pub mod signals;
pub mod term;
