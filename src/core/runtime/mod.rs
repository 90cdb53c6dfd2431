mod host;
mod requirement;
mod resolver;

pub use host::{scan_drm_vendors, Arch, GpuVendor, HostProfile, OsKind};
pub use requirement::{Requirement, VersionConstraint};
pub use resolver::{select_candidate, Resolution, RuntimeResolver};
