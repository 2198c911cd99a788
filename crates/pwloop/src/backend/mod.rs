//! Daemon implementations behind [`crate::daemon::Daemon`].

pub mod memory;
#[cfg(feature = "pipewire")]
pub mod pipewire;
