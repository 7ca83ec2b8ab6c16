//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! discover removable block devices and the partitions of a device that are
//! currently mounted.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS. Each submodule exposes the same public API. Targets
//! without an implementation report no devices rather than failing.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod other;
#[cfg(not(target_os = "linux"))]
pub use self::other::*;
