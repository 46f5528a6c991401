use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("map `{map}`: expected {expected} byte keys, got {got}")]
    KeySize {
        map: String,
        expected: u32,
        got: usize,
    },
    #[error("map `{map}`: expected {expected} byte values, got {got}")]
    ValueSize {
        map: String,
        expected: u32,
        got: usize,
    },
    #[error("map `{map}` is full ({max_entries} entries)")]
    Full { map: String, max_entries: u32 },
    #[error("failed to create directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to pin map at `{path}`: {source}")]
    Pin {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("built without the `bpf` feature, kernel tables would not be visible to BPF programs")]
    Unsupported,
    #[error("failed to remove pinned map `{path}`: {source}")]
    Unpin {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "bpf")]
    #[error("bpf map operation on `{map}` failed: {source}")]
    Libbpf {
        map: String,
        #[source]
        source: libbpf_rs::Error,
    },
    #[cfg(feature = "bpf")]
    #[error("failed to stat `{path}`: {source}")]
    Statfs {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[cfg(feature = "bpf")]
    #[error("failed to mount bpffs at `{path}`: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[cfg(feature = "bpf")]
    #[error("failed to raise the memlock rlimit: {0}")]
    Memlock(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
