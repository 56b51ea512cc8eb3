//! Guest OS profiles for OS-specific virtual hardware.
//!
//! Create requests carry an osinfo-style identifier such as `linux2022`,
//! `debian12`, `rocky9` or `win11`. The identifier is folded into a
//! [`GuestOSFamily`], which selects the disk bus, NIC model, video device and
//! timer setup written into the domain definition.
//!
//! ```rust
//! use virtpilot_hypervisor::guest_os::{GuestOSFamily, GuestOSProfile};
//!
//! let profile = GuestOSProfile::for_family(GuestOSFamily::from_variant("win11"));
//! assert!(profile.hyperv);
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{DiskBus, NicModel};

/// Guest OS family - major categories with distinct hardware requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuestOSFamily {
    /// Any Linux without special needs
    #[default]
    GenericLinux,
    /// RHEL, Rocky, AlmaLinux, CentOS, Fedora - sensitive to HPET
    Rhel,
    /// Debian, Ubuntu and derivatives
    Debian,
    /// Windows 10/11 and Server 2016+
    Windows,
    /// Windows 7/8 - no inbox virtio drivers
    WindowsLegacy,
    /// FreeBSD, OpenBSD, NetBSD
    Bsd,
}

impl GuestOSFamily {
    /// Map an osinfo identifier to its family. Unknown identifiers fall back
    /// to [`GuestOSFamily::GenericLinux`].
    pub fn from_variant(variant: &str) -> Self {
        let v = variant.trim().to_lowercase();
        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| v.starts_with(p));

        if starts(&["win7", "win8", "winxp", "winvista", "win2k8", "win2k3"]) {
            Self::WindowsLegacy
        } else if starts(&["win"]) {
            Self::Windows
        } else if starts(&["rhel", "rocky", "alma", "centos", "fedora", "ol"]) {
            Self::Rhel
        } else if starts(&["debian", "ubuntu", "mint", "pop"]) {
            Self::Debian
        } else if starts(&["freebsd", "openbsd", "netbsd"]) {
            Self::Bsd
        } else {
            Self::GenericLinux
        }
    }

    /// Is this a Windows OS family?
    pub fn is_windows(&self) -> bool {
        matches!(self, Self::Windows | Self::WindowsLegacy)
    }
}

/// Virtual hardware choices for one guest OS family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestOSProfile {
    pub family: GuestOSFamily,
    /// Boot disk bus
    pub disk_bus: DiskBus,
    /// NIC model
    pub nic_model: NicModel,
    /// Video model ("vga", "virtio", "qxl")
    pub video_model: String,
    /// Expose an HPET timer
    pub hpet: bool,
    /// Enable Hyper-V enlightenments
    pub hyperv: bool,
}

impl GuestOSProfile {
    /// Get the default profile for an OS family.
    pub fn for_family(family: GuestOSFamily) -> Self {
        match family {
            GuestOSFamily::GenericLinux => Self::linux(family, false, "vga"),
            // RHEL 9 kernels panic with HPET exposed
            GuestOSFamily::Rhel => Self::linux(family, false, "vga"),
            GuestOSFamily::Debian => Self::linux(family, true, "virtio"),
            GuestOSFamily::Bsd => Self::linux(family, true, "vga"),
            GuestOSFamily::Windows => Self {
                family,
                // Sata and e1000e have inbox drivers during install
                disk_bus: DiskBus::Sata,
                nic_model: NicModel::E1000e,
                video_model: "qxl".to_string(),
                hpet: true,
                hyperv: true,
            },
            GuestOSFamily::WindowsLegacy => Self {
                family,
                disk_bus: DiskBus::Ide,
                nic_model: NicModel::E1000e,
                video_model: "vga".to_string(),
                hpet: true,
                hyperv: false,
            },
        }
    }

    fn linux(family: GuestOSFamily, hpet: bool, video: &str) -> Self {
        Self {
            family,
            disk_bus: DiskBus::Virtio,
            nic_model: NicModel::Virtio,
            video_model: video.to_string(),
            hpet,
            hyperv: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_variant() {
        assert_eq!(GuestOSFamily::from_variant("linux2022"), GuestOSFamily::GenericLinux);
        assert_eq!(GuestOSFamily::from_variant("debian12"), GuestOSFamily::Debian);
        assert_eq!(GuestOSFamily::from_variant("Ubuntu22.04"), GuestOSFamily::Debian);
        assert_eq!(GuestOSFamily::from_variant("rocky9"), GuestOSFamily::Rhel);
        assert_eq!(GuestOSFamily::from_variant("win11"), GuestOSFamily::Windows);
        assert_eq!(GuestOSFamily::from_variant("win2k22"), GuestOSFamily::Windows);
        assert_eq!(GuestOSFamily::from_variant("win7"), GuestOSFamily::WindowsLegacy);
        assert_eq!(GuestOSFamily::from_variant("freebsd14.0"), GuestOSFamily::Bsd);
        assert_eq!(GuestOSFamily::from_variant(""), GuestOSFamily::GenericLinux);
    }

    #[test]
    fn test_rhel_hpet_disabled() {
        let profile = GuestOSProfile::for_family(GuestOSFamily::Rhel);
        assert!(!profile.hpet, "RHEL should have HPET disabled");
        assert_eq!(profile.disk_bus, DiskBus::Virtio);
    }

    #[test]
    fn test_windows_uses_emulated_devices() {
        let profile = GuestOSProfile::for_family(GuestOSFamily::Windows);
        assert!(profile.hyperv);
        assert_eq!(profile.disk_bus, DiskBus::Sata);
        assert_eq!(profile.nic_model, NicModel::E1000e);
        assert!(GuestOSFamily::Windows.is_windows());
    }
}
