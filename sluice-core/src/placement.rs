use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::{ModuleRegistry, Reclaimer, StagedAssembly, Tier, Tiers};

/// How much of a staged module one placement call covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extent {
    /// The whole owning assembly, including parts outside the registry.
    All,
    /// The leading `K` registry units; saturates at the registry length.
    Units(usize),
}

/// Last explicitly requested tier per registry unit, plus whether the last
/// whole-assembly move is still undisturbed. `None` means "never moved":
/// wherever load left it.
#[derive(Debug)]
struct PlacementState {
    units: Vec<Option<Tier>>,
    whole: Option<Tier>,
}

/// One assembly paired with its registry and tracked placement state.
pub struct StagedModule {
    assembly: Arc<dyn StagedAssembly>,
    registry: ModuleRegistry,
    state: Mutex<PlacementState>,
}

impl StagedModule {
    pub fn new(assembly: Arc<dyn StagedAssembly>) -> Self {
        let registry = ModuleRegistry::build(assembly.as_ref());
        let state = PlacementState {
            units: vec![None; registry.len()],
            whole: None,
        };
        Self {
            assembly,
            registry,
            state: Mutex::new(state),
        }
    }

    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the tracked per-unit tiers, deepest unit first. Used to
    /// assert resting-state invariants.
    pub fn unit_tiers(&self) -> Vec<Option<Tier>> {
        self.state.lock().expect("placement state poisoned").units.clone()
    }

    fn place(&self, tiers: &Tiers, tier: Tier, extent: Extent) -> Result<()> {
        let mut state = self.state.lock().expect("placement state poisoned");
        let device = tiers.device(tier);
        match extent {
            Extent::All => {
                if state.whole == Some(tier) {
                    return Ok(());
                }
                self.assembly.move_all(device)?;
                state.units.fill(Some(tier));
                state.whole = Some(tier);
            }
            Extent::Units(count) => {
                let count = count.min(self.registry.len());
                for index in 0..count {
                    if state.units[index] == Some(tier) {
                        continue;
                    }
                    let Some(unit) = self.registry.unit(index) else {
                        break;
                    };
                    unit.move_to(device)?;
                    state.units[index] = Some(tier);
                    if state.whole != Some(tier) {
                        state.whole = None;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Moves leading registry units (or whole assemblies) onto a target tier,
/// reclaiming after every call. Units past the requested count keep whatever
/// device they were last explicitly moved to.
pub struct PlacementController {
    tiers: Tiers,
    reclaimer: Reclaimer,
}

impl PlacementController {
    pub fn new(tiers: Tiers) -> Self {
        let reclaimer = Reclaimer::new(tiers.accelerator.clone());
        Self { tiers, reclaimer }
    }

    pub fn place(&self, module: &StagedModule, tier: Tier, extent: Extent) -> Result<()> {
        module.place(&self.tiers, tier, extent)?;
        self.reclaimer.reclaim();
        Ok(())
    }

    pub fn reclaim(&self) {
        self.reclaimer.reclaim();
    }

    pub fn tiers(&self) -> &Tiers {
        &self.tiers
    }
}
