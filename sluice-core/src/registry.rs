use std::sync::Arc;

use anyhow::Result;
use candle_core::Device;

/// An opaque handle to one relocatable group of weights.
///
/// Units carry no metadata beyond their registry position: no size, no name,
/// no current device. The only source of truth for residency is the sequence
/// of placement calls made against the registry (tracked by
/// [`crate::placement::StagedModule`]).
pub trait PlacementUnit: Send + Sync {
    fn move_to(&self, device: &Device) -> Result<()>;
}

/// A large-parameter assembly whose sub-units can be staged between devices.
pub trait StagedAssembly: Send + Sync {
    /// Enumerates the assembly's placement units in root-first structural
    /// order. Called once at load time; must be deterministic.
    fn traverse(&self) -> Vec<Arc<dyn PlacementUnit>>;

    /// Coarse whole-assembly move, covering parts outside the registry too
    /// (for the generator this includes the VAE weights).
    fn move_all(&self, device: &Device) -> Result<()>;
}

/// Order-stable inventory of one assembly's placement units.
///
/// The traversal is captured once at load time and reversed, so index 0 is
/// the structurally deepest unit and the final index the whole-assembly root.
/// Moving "the first K units" therefore relocates the deepest, typically
/// smallest pieces first, which gives fine-grained partial offload without
/// per-unit size accounting.
pub struct ModuleRegistry {
    units: Vec<Arc<dyn PlacementUnit>>,
}

impl ModuleRegistry {
    pub fn build(assembly: &dyn StagedAssembly) -> Self {
        let mut units = assembly.traverse();
        units.reverse();
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, index: usize) -> Option<&Arc<dyn PlacementUnit>> {
        self.units.get(index)
    }
}
