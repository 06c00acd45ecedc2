use thiserror::Error;

/// Errors surfaced by simulator operations.
///
/// Fault-injected errors are deliberately indistinguishable from "real"
/// ones: a caller that receives [`SimulationError::IoError`] cannot tell
/// whether the underlying OS call failed or the fault controller fired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    /// The simulation world has been dropped and is no longer accessible.
    #[error("simulation has been shut down")]
    SimulationShutdown,

    /// A connection endpoint was closed, either by the peer or by the
    /// random connection-failure dice.
    #[error("connection failed")]
    ConnectionFailed,

    /// A connection endpoint outlived its peer past the leak watchdog.
    #[error("connection leaked")]
    ConnectionLeaked,

    /// A continuation was cancelled before its completion was delivered.
    #[error("broken promise")]
    BrokenPromise,

    /// An I/O operation failed (real or injected).
    #[error("io error: {0}")]
    IoError(String),

    /// An I/O operation timed out (injected).
    #[error("io timeout")]
    IoTimeout,

    /// Open failed because the file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Collaborator-domain error, propagated through the simulator.
    #[error("past version")]
    PastVersion,

    /// Collaborator-domain error, propagated through the simulator.
    #[error("future version")]
    FutureVersion,

    /// Collaborator-domain error, propagated through the simulator.
    #[error("wrong shard server")]
    WrongShardServer,

    /// The simulation is in an invalid state.
    #[error("invalid simulation state: {0}")]
    InvalidState(String),
}

/// A type alias for `Result<T, SimulationError>`.
pub type SimulationResult<T> = Result<T, SimulationError>;

impl From<std::io::Error> for SimulationError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SimulationError::FileNotFound(err.to_string())
        } else {
            SimulationError::IoError(err.to_string())
        }
    }
}
