use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("malformed patch {commit}: {reason}")]
    MalformedPatch { commit: String, reason: String },

    #[error("comparison cache corrupt: {0}")]
    CacheCorruption(String),

    #[error("unknown patch id: {0}")]
    UnknownPatch(String),

    #[error("ambiguous patch id prefix: {0}")]
    AmbiguousPatch(String),

    #[error("unknown stack: {0}")]
    UnknownStack(String),

    #[error("no upstream range configured")]
    NoUpstream,
}
