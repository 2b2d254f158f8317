use thiserror::Error;

/// Typed failures that callers need to tell apart. Everything else travels
/// as `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// A remote command exited non-zero. The local process exits with the
    /// same code.
    #[error("remote command exited {code}")]
    Passthrough { code: i32 },

    #[error("unsupported model type for migration {0:?}")]
    UnsupportedCloud(String),

    #[error("machine {0} missing parent")]
    MissingParent(String),

    #[error("missing {kind} for application {application:?}")]
    MissingSettings {
        kind: &'static str,
        application: String,
    },

    #[error("saved rollback information found on machine {0}")]
    RollbackExists(String),

    #[error("no machines found")]
    NoMachines,

    #[error("too many options: {0:?}")]
    TooManyMachines(Vec<String>),

    #[error("environment {0:?} not initialized")]
    NotInitialized(String),

    /// Unexpected HTTP status or an RPC error envelope.
    #[error("{context}: {body}")]
    Protocol { context: String, body: String },

    /// One or more hosts failed during a fan-out phase.
    #[error("{op} failed on machine{} {}", plural(.ids), .ids.join(", "))]
    HostFailures { op: String, ids: Vec<String> },
}

fn plural(ids: &[String]) -> &'static str {
    if ids.len() == 1 {
        ""
    } else {
        "s"
    }
}

impl UpgradeError {
    /// Exit code for the process when this error reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeError::Passthrough { code } => *code,
            _ => 1,
        }
    }
}

/// Find the exit code carried by an error chain, if a pass-through is
/// anywhere in it.
pub fn passthrough_code(err: &anyhow::Error) -> Option<i32> {
    err.chain().find_map(|cause| match cause.downcast_ref::<UpgradeError>() {
        Some(UpgradeError::Passthrough { code }) => Some(*code),
        _ => None,
    })
}
