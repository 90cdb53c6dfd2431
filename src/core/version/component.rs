use serde::{Deserialize, Serialize};

use crate::core::assets::AssetIdentity;
use crate::core::downloader::Checksum;
use crate::core::runtime::{Arch, GpuVendor, HostProfile, OsKind};

/// A published runtime artifact (compatibility layer build, graphics
/// translation layer, emulator core...).
///
/// Empty `os`, `arch` or `gpu_vendors` lists mean "any".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub family: String,
    pub version: String,
    #[serde(default)]
    pub os: Vec<OsKind>,
    #[serde(default)]
    pub arch: Vec<Arch>,
    #[serde(default)]
    pub gpu_vendors: Vec<GpuVendor>,
    pub url: String,
    pub checksum: Checksum,
    #[serde(default)]
    pub size: Option<u64>,
}

impl Component {
    pub fn identity(&self) -> AssetIdentity {
        AssetIdentity::new(&self.name, &self.version)
    }

    pub fn supports(&self, host: &HostProfile) -> bool {
        if !host.is_recognized() {
            return false;
        }
        let os_ok = self.os.is_empty() || self.os.contains(&host.os);
        let arch_ok = self.arch.is_empty() || self.arch.contains(&host.arch);
        let gpu_ok = self.gpu_vendors.is_empty()
            || self.gpu_vendors.iter().any(|v| host.has_gpu(*v));
        os_ok && arch_ok && gpu_ok
    }
}
