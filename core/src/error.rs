use std::io;
use std::time::Duration;

use relay_protocol::ProviderKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayErr>;

/// Turn-fatal failures surfaced by the orchestrator.
///
/// Protocol parse failures and per-attachment staging failures are
/// recovered locally and never reach this type.
#[derive(Debug, Error)]
pub enum RelayErr {
    #[error("unknown provider `{tag}`")]
    UnknownProvider { tag: String },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{provider} produced no output within {}ms", waited.as_millis())]
    Timeout {
        provider: ProviderKind,
        waited: Duration,
    },

    #[error("{provider} exited with code {code}")]
    ProcessExit {
        code: i32,
        provider: ProviderKind,
        stderr: String,
    },

    #[error("a turn is already active for session {session_id}")]
    TurnAlreadyActive { session_id: String },

    #[error("session store: {message}")]
    Store { message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayErr {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// The exit code reported in the terminal `complete` event. Spawn
    /// failures have no process to report on; timeouts use the
    /// conventional 124.
    pub fn synthetic_exit_code(&self) -> i32 {
        match self {
            RelayErr::Timeout { .. } => 124,
            RelayErr::ProcessExit { code, .. } => *code,
            _ => -1,
        }
    }
}
