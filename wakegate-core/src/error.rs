use thiserror::Error;

/// All errors produced by wakegate-core.
#[derive(Debug, Error)]
pub enum WakegateError {
    #[error("invalid sound model: {0}")]
    InvalidModel(String),

    #[error("sound model merge failed: {0}")]
    MergeFailed(String),

    #[error("composite model size invariant violated (previous {previous} bytes, produced {produced} bytes)")]
    MergeSizeInvariantViolation { previous: usize, produced: usize },

    #[error("capture session open failed: {0}")]
    SessionOpenFailed(String),

    #[error("capture session start failed: {0}")]
    SessionStartFailed(String),

    #[error("audio subsystem restarted")]
    SubsystemRestart,

    #[error("invalid keyword index (start {start_us} us, end {end_us} us, ftrt start {ftrt_start_us} us)")]
    InvalidKeywordIndex {
        start_us: u64,
        end_us: u64,
        ftrt_start_us: u64,
    },

    #[error("invalid detection payload: {0}")]
    InvalidPayload(String),

    #[error("unknown detection payload key {0:#x}")]
    UnknownPayloadKey(u32),

    #[error("operation `{op}` not allowed in state {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("ring buffer reader is disabled")]
    ReaderDisabled,

    #[error("not enough unread data (requested {requested} bytes, available {available} bytes)")]
    InsufficientUnread { requested: usize, available: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no recognition config has been set")]
    NoRecognitionConfig,

    #[error("capture error: {0}")]
    Capture(String),

    #[error("verifier error: {0}")]
    Verifier(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WakegateError {
    /// True when the audio/DSP subsystem restarted underneath the call.
    pub fn is_subsystem_restart(&self) -> bool {
        matches!(self, WakegateError::SubsystemRestart)
    }

    pub(crate) fn invalid_state(op: &'static str, state: impl std::fmt::Debug) -> Self {
        WakegateError::InvalidState {
            op,
            state: format!("{state:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, WakegateError>;

/// Treats a subsystem restart as recovered: resident state is rebuilt on the
/// next start, so callers see success.
pub fn recover_subsystem_restart(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_subsystem_restart() => {
            tracing::info!("subsystem restart observed, status normalized to success");
            Ok(())
        }
        other => other,
    }
}
