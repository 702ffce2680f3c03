//! Platform capability probing.
//!
//! Test cases declare the capabilities they need; the orchestrator asks a
//! [`CapabilityProbe`] what the current session offers and skips the cases
//! it cannot run.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::traits::{Control, DeviceDescriptor};

/// Optional platform or device feature a test case may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Running on Linux (V4L2 available).
    Linux,
    /// Low-level control channel to the device (V4L2 controls).
    ControlChannel,
    /// The device can be told to run an autofocus step.
    Autofocus,
    /// The device exposes an auto-exposure switch.
    ExposureControl,
    /// The lens can be driven to absolute focus positions.
    ManualFocus,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linux => "linux",
            Self::ControlChannel => "control channel",
            Self::Autofocus => "autofocus",
            Self::ExposureControl => "exposure control",
            Self::ManualFocus => "manual focus",
        };
        f.write_str(name)
    }
}

/// Set of available capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability.
    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    /// Whether the capability is present.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// First capability in `required` that is missing from this set.
    #[must_use]
    pub fn first_missing(&self, required: &[Capability]) -> Option<Capability> {
        required.iter().copied().find(|cap| !self.contains(*cap))
    }

    /// Iterate over the capabilities in order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Answers which optional features are usable for a device on this platform.
pub trait CapabilityProbe: Send + Sync {
    /// Capabilities available for `device`.
    fn probe(&self, device: &DeviceDescriptor) -> CapabilitySet;
}

/// Probe that combines the host OS with the controls a device advertises.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl CapabilityProbe for SystemProbe {
    fn probe(&self, device: &DeviceDescriptor) -> CapabilitySet {
        let mut caps = CapabilitySet::new();
        if !cfg!(target_os = "linux") {
            return caps;
        }
        caps.insert(Capability::Linux);
        if device.controls.is_empty() {
            return caps;
        }
        caps.insert(Capability::ControlChannel);
        if device.supports(Control::AutofocusTrigger) {
            caps.insert(Capability::Autofocus);
        }
        if device.supports(Control::AutoExposure) {
            caps.insert(Capability::ExposureControl);
        }
        if device.supports(Control::FocusAbsolute) {
            caps.insert(Capability::ManualFocus);
        }
        caps
    }
}

/// Probe returning a fixed set, for synthetic devices and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub CapabilitySet);

impl CapabilityProbe for StaticProbe {
    fn probe(&self, _device: &DeviceDescriptor) -> CapabilitySet {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_missing() {
        let set: CapabilitySet = [Capability::Linux].into_iter().collect();
        assert_eq!(set.first_missing(&[Capability::Linux]), None);
        assert_eq!(
            set.first_missing(&[Capability::Linux, Capability::Autofocus]),
            Some(Capability::Autofocus)
        );
    }

    #[test]
    fn test_system_probe_without_controls() {
        let device = DeviceDescriptor::new("0", "Plain Camera");
        let caps = SystemProbe.probe(&device);
        assert!(!caps.contains(Capability::ControlChannel));
        assert_eq!(caps.contains(Capability::Linux), cfg!(target_os = "linux"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_probe_maps_controls() {
        let mut device = DeviceDescriptor::new("0", "AF Camera");
        device.controls = vec![Control::AutofocusTrigger, Control::AutoExposure];
        let caps = SystemProbe.probe(&device);
        assert!(caps.contains(Capability::ControlChannel));
        assert!(caps.contains(Capability::Autofocus));
        assert!(caps.contains(Capability::ExposureControl));
        assert!(!caps.contains(Capability::ManualFocus));

        device.controls.push(Control::FocusAbsolute);
        assert!(SystemProbe.probe(&device).contains(Capability::ManualFocus));
    }

    #[test]
    fn test_static_probe_ignores_device() {
        let probe = StaticProbe([Capability::Autofocus].into_iter().collect());
        let caps = probe.probe(&DeviceDescriptor::new("9", "x"));
        assert_eq!(caps.iter().collect::<Vec<_>>(), vec![Capability::Autofocus]);
    }
}
