//! Kernel filesystem binding

mod filesystem;
mod mount;

pub use filesystem::DriveFs;
pub use mount::{resolve_mount_path, set_mount_flag, should_mount, MountController, MountState};
