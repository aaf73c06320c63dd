//! # sandbox-remote
//!
//! Access to the remote execution host.
//!
//! - [`RemoteTransport`]: one multiplexed connection to the host
//!   ([`SshConnection`] in production, [`MockTransport`] in tests)
//! - [`RemoteSession`]: foreground commands, serialized and run from the
//!   working root with a timeout
//! - [`SessionRegistry`]: named tmux sessions for long-running processes
//! - [`CommandHistory`]: bounded log of executed commands
//! - Submission loading into the working root

mod history;
mod process;
mod registry;
mod session;
mod submission;
mod transport;

pub use history::CommandHistory;
pub use process::{ensure_success, run_process, shell_quote, ProcessOutput};
pub use registry::{validate_session_name, SessionRegistry};
pub use session::RemoteSession;
pub use submission::{load_submission, DirectorySubmissionStore, SubmissionKey, SubmissionStore};
pub use transport::{MockTransport, RemoteTransport, SshConnection, SshTarget};

pub use tokio_util::sync::CancellationToken;
