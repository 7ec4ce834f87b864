use candle_core::Device;

use crate::select_best_device;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Which side of the memory hierarchy a placement call targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    /// Fast device memory (CUDA/Metal when available).
    Accelerator,
    /// Host memory used as the offload target.
    Host,
}

/// The two resolved devices every placement call picks between.
#[derive(Clone, Debug)]
pub struct Tiers {
    pub accelerator: Device,
    pub host: Device,
}

impl Tiers {
    pub fn resolve(device_map: DeviceMap) -> anyhow::Result<Self> {
        Ok(Self {
            accelerator: select_best_device(device_map)?,
            host: Device::Cpu,
        })
    }

    pub fn device(&self, tier: Tier) -> &Device {
        match tier {
            Tier::Accelerator => &self.accelerator,
            Tier::Host => &self.host,
        }
    }
}
