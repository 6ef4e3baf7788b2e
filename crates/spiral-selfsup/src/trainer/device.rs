// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use spiral_config::Device;
use tracing::warn;

/// Trait implemented by devices capable of running self-supervised training.
pub trait TrainingDevice: Send + Sync {
    /// Device the encoder math runs on.
    fn device(&self) -> &Device;
}

/// In-process CPU device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuDevice {
    device: Device,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
        }
    }

    /// Takes a device already resolved from the runtime preference. There are
    /// no training kernels for anything but the CPU, so other devices fall
    /// back to it with a warning.
    pub fn for_resolved(resolved: &Device) -> Self {
        if *resolved != Device::Cpu {
            warn!(device = %resolved, "no training kernels for this device; using cpu");
        }
        Self::new()
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingDevice for CpuDevice {
    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accelerators_fall_back_to_cpu() {
        let accelerator = Device::Accelerator {
            name: "metal".to_string(),
        };
        assert_eq!(CpuDevice::for_resolved(&accelerator).device(), &Device::Cpu);
        assert_eq!(CpuDevice::for_resolved(&Device::Cpu), CpuDevice::new());
    }
}
