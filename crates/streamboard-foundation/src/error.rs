use thiserror::Error;

/// Missing/duplicate configuration, or a result shape that is not legal
/// output (e.g. an empty 2-D array on the last axis).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),
    #[error("duplicate processor name: {0}")]
    DuplicateProcessorName(String),
    #[error("unknown subscription key: {0}")]
    UnknownSubscriptionKey(String),
    #[error("processor '{processor}' produced an empty 2-D result on key '{key}'")]
    EmptyResult { processor: String, key: String },
    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Violations of the chunk-numbering / alignment / identifier contract
/// between sibling inputs.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("chunk number went backward: producer '{producer}' emitted {got} after {last}")]
    NumberWentBackward {
        producer: String,
        last: u64,
        got: u64,
    },
    #[error("alignment mismatch: {0}")]
    AlignmentMismatch(String),
    #[error("conflicting identifier between sibling inputs: '{a}' vs '{b}'")]
    ConflictingIdentifier { a: String, b: String },
    #[error("incompatible merge scenario while joining patches: {0}")]
    IncompatiblePatchMerge(String),
}

/// Failures tied to an external resource: sockets, files, device handles.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("socket closed: {0}")]
    SocketClosed(String),
    #[error("file unwritable: {0}")]
    FileUnwritable(String),
    #[error("filter length {filter_len} is not a multiple of decimation {decimation}")]
    FilterLengthNotMultiple { filter_len: usize, decimation: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Recoverable locally: the processor demotes its next emitted continuity to
/// `Discontinuous` and carries on, rather than reporting upstream.
#[derive(Error, Debug)]
pub enum TransientError {
    #[error("input overflow on capture device: {0}")]
    CaptureOverflow(String),
    #[error("socket send buffer full: {0}")]
    SocketBufferFull(String),
}

/// Top-level error type a processor task can produce. Wraps the specific
/// taxonomies with `#[error(transparent)]` so call sites can use `?`
/// regardless of which layer raised, while `recovery_strategy` still
/// dispatches on the concrete variant.
#[derive(Error, Debug)]
pub enum BoardError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error("fatal error in processor: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for BoardError {
    fn from(e: std::io::Error) -> Self {
        BoardError::Resource(ResourceError::Io(e))
    }
}

impl From<tokio::task::JoinError> for BoardError {
    fn from(e: tokio::task::JoinError) -> Self {
        BoardError::Fatal(format!("task join failed: {e}"))
    }
}

/// What a processor's main loop should do in response to a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Demote the next emitted continuity to `Discontinuous` and continue.
    DemoteAndContinue,
    /// Report `Error(kind, message, name)` to the Board and exit the task.
    ReportAndExit,
}

impl BoardError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            BoardError::Transient(_) => RecoveryStrategy::DemoteAndContinue,
            BoardError::Config(_)
            | BoardError::Protocol(_)
            | BoardError::Resource(_)
            | BoardError::Fatal(_) => RecoveryStrategy::ReportAndExit,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BoardError::Config(_) => "ConfigError",
            BoardError::Protocol(_) => "ProtocolError",
            BoardError::Resource(_) => "ResourceError",
            BoardError::Transient(_) => "Transient",
            BoardError::Fatal(_) => "Fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_recover_locally() {
        let e = BoardError::Transient(TransientError::CaptureOverflow("ring full".into()));
        assert_eq!(e.recovery_strategy(), RecoveryStrategy::DemoteAndContinue);
        assert_eq!(e.kind(), "Transient");
    }

    #[test]
    fn config_errors_report_upstream() {
        let e = BoardError::Config(ConfigError::MissingParameter("SampleRate".into()));
        assert_eq!(e.recovery_strategy(), RecoveryStrategy::ReportAndExit);
        assert_eq!(e.kind(), "ConfigError");
    }

    #[test]
    fn protocol_backward_number_reports_upstream() {
        let e = BoardError::Protocol(ProtocolError::NumberWentBackward {
            producer: "mic".into(),
            last: 5,
            got: 3,
        });
        assert_eq!(e.recovery_strategy(), RecoveryStrategy::ReportAndExit);
    }
}
