// ─── Host Profile ───
// What the current machine is: operating system, CPU architecture and the
// GPU vendors present. Components declare which of these they support.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Linux,
    Windows,
    Macos,
    /// Anything else; never supported.
    #[serde(other)]
    Other,
}

impl OsKind {
    pub fn current() -> Self {
        Self::from_name(std::env::consts::OS)
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "linux" => OsKind::Linux,
            "windows" => OsKind::Windows,
            "macos" => OsKind::Macos,
            _ => OsKind::Other,
        }
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsKind::Linux => write!(f, "linux"),
            OsKind::Windows => write!(f, "windows"),
            OsKind::Macos => write!(f, "macos"),
            OsKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[serde(alias = "x64", alias = "amd64")]
    X86_64,
    #[serde(alias = "i386", alias = "i686")]
    X86,
    #[serde(alias = "arm64")]
    Aarch64,
    /// Anything else; never supported.
    #[serde(other)]
    Other,
}

impl Arch {
    pub fn current() -> Self {
        Self::from_name(std::env::consts::ARCH)
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "x86_64" => Arch::X86_64,
            "x86" => Arch::X86,
            "aarch64" => Arch::Aarch64,
            _ => Arch::Other,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::X86 => write!(f, "x86"),
            Arch::Aarch64 => write!(f, "aarch64"),
            Arch::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
}

impl GpuVendor {
    /// Map a PCI vendor id (as found in sysfs, e.g. `0x10de`).
    pub fn from_pci_id(raw: &str) -> Option<Self> {
        let id = raw.trim().trim_start_matches("0x");
        match u16::from_str_radix(id, 16).ok()? {
            0x10de => Some(GpuVendor::Nvidia),
            0x1002 | 0x1022 => Some(GpuVendor::Amd),
            0x8086 => Some(GpuVendor::Intel),
            _ => None,
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "nvidia"),
            GpuVendor::Amd => write!(f, "amd"),
            GpuVendor::Intel => write!(f, "intel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub os: OsKind,
    pub arch: Arch,
    pub gpu_vendors: Vec<GpuVendor>,
}

impl HostProfile {
    pub fn new(os: OsKind, arch: Arch, gpu_vendors: Vec<GpuVendor>) -> Self {
        Self {
            os,
            arch,
            gpu_vendors,
        }
    }

    /// Detect the running machine.
    pub fn detect() -> Self {
        let gpu_vendors = if cfg!(target_os = "linux") {
            scan_drm_vendors(Path::new("/sys/class/drm"))
        } else {
            Vec::new()
        };
        let profile = Self::new(OsKind::current(), Arch::current(), gpu_vendors);
        debug!(
            "Detected host {} / {} with GPUs {:?}",
            profile.os, profile.arch, profile.gpu_vendors
        );
        profile
    }

    /// False on an OS or CPU no component or recipe can target.
    pub fn is_recognized(&self) -> bool {
        self.os != OsKind::Other && self.arch != Arch::Other
    }

    pub fn has_gpu(&self, vendor: GpuVendor) -> bool {
        self.gpu_vendors.contains(&vendor)
    }
}

/// Collect vendors from `<drm_root>/card*/device/vendor`.
pub fn scan_drm_vendors(drm_root: &Path) -> Vec<GpuVendor> {
    let entries = match std::fs::read_dir(drm_root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut vendors: Vec<GpuVendor> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with("card") && !name.contains('-')
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("device/vendor")).ok())
        .filter_map(|raw| GpuVendor::from_pci_id(&raw))
        .collect();
    vendors.sort();
    vendors.dedup();
    vendors
}
