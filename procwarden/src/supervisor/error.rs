use thiserror::Error;

/// Failures of the synchronous part of supervisor start. Encountering one
/// during the first fleet start aborts the boot; later on it transitions the
/// supervisor to `Failed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error("spawning child: {0}")]
    Spawn(String),

    #[error("pre_start hook failed: {0}")]
    HookPreStart(String),

    #[error("post_start hook failed: {0}")]
    HookPostStart(String),

    #[error("the process did not become healthy in time")]
    ReadinessTimeout,
}

/// Failures while stopping. None of these block shutdown progress; they are
/// logged and surfaced to the caller for reporting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StopError {
    #[error("pre_stop hook failed: {0}")]
    HookPreStop(String),

    #[error("post_stop hook failed: {0}")]
    HookPostStop(String),

    #[error("children outlived the deadline and were killed")]
    HardKilled,

    #[error("the supervisor runtime is gone: {0}")]
    Channel(String),
}

/// Synchronous errors returned to callers of supervisor requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("the supervisor is stopping")]
    ShuttingDown,

    #[error("the supervisor runtime is gone: {0}")]
    ChannelClosed(String),

    #[error("scale {requested} is outside 1..={max_scale}")]
    InvalidScale { requested: usize, max_scale: usize },
}
