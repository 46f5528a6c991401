use crate::bpf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tracer `{0}` already exists")]
    AlreadyExists(String),
    #[error("tracer `{0}` not found")]
    NotFound(String),
    #[error("filter pin {pin} of tracer `{id}` is owned by tracer `{owner}`")]
    PinInUse {
        id: String,
        owner: String,
        pin: std::path::PathBuf,
    },
    #[error("invalid tracer id `{0}`")]
    InvalidId(String),
    #[error(transparent)]
    Bpf(#[from] bpf::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
