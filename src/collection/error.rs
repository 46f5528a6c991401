use crate::container::ContainerID;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("container `{0}` has no mount namespace id")]
    MissingMntNs(ContainerID),
    #[error("mount namespace {mntns} of container `{id}` already belongs to container `{existing}`")]
    MntNsConflict {
        mntns: u64,
        id: ContainerID,
        existing: ContainerID,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
