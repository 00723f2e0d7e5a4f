//! Subprocess plumbing for keybroker.
//!
//! - [`invocation`] -- [`ProcessInvocation`] (command, arguments, stdin, with
//!   secret arguments masked on display) and [`ProcessOutcome`].
//! - [`runner`] -- the [`CommandRunner`] trait and [`ProcessRunner`], which
//!   pumps stdin, stdout and stderr concurrently so a chatty child can never
//!   deadlock against its parent.
//! - [`error`] -- [`ProcessError`].

pub mod error;
pub mod invocation;
pub mod runner;

pub use error::{ProcessError, Result};
pub use invocation::{ProcessInvocation, ProcessOutcome};
pub use runner::{CommandRunner, ProcessRunner};
