#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown container runtime `{0}`")]
    UnknownRuntime(String),
    #[error("{runtime}: request failed: {source}")]
    Request {
        runtime: String,
        #[source]
        source: Box<tonic::Status>,
    },
    #[error("{runtime}: container `{id}` not found")]
    NotFound { runtime: String, id: String },
    #[error("{runtime}: invalid verbose info for container `{id}`: {reason}")]
    InvalidInfo {
        runtime: String,
        id: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
