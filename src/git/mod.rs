//! Git bridging between a host directory and its sandbox clone.

pub mod command;
pub mod compare;
pub mod lock;
pub mod remote;

pub use compare::GitCompare;
pub use lock::{CompareLock, COMPARE_LOCK_FILE};
pub use remote::{
    host_remote_name, RemoteDirection, RemoteLink, RemotePair, CLONE_REMOTE, HOST_REMOTE_PREFIX,
};
