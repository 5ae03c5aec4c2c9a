//! Sandboxes: copy-on-write clones of a working directory paired with a
//! container and git remotes back to the host.

mod clone;
mod id;
pub mod record;
mod registry;
mod state;

pub use clone::{clone_path, sandbox_dir, CloneManager, ClonePrimitive, CloneRecord, ReflinkClone, APP_DIR};
pub use id::{SandboxId, MAX_ID_LEN};
pub use record::Sandbox;
pub use registry::{container_name, Registry, IN_CONTAINER_GIT_NOTE, MAX_ID_ATTEMPTS};
pub use state::SandboxState;
