use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::PlacementUnit;

struct Slot {
    name: String,
    tensor: RwLock<Tensor>,
}

/// Ordered, relocatable weight slots backing one assembly.
///
/// candle models cannot move individual submodules once built, so staging
/// happens here instead: each slot holds one named tensor, moving a slot
/// re-materializes the tensor on the target device and drops the old copy,
/// and the forward-pass models are rebuilt from the current slots at each use
/// site (cheap when the slots already sit on the right device).
///
/// Slot order is the sorted tensor-name order of the checkpoint; dotted
/// weight paths sort depth-first, which stands in for the root-first
/// structural traversal the registry reverses.
#[derive(Clone)]
pub struct WeightSet {
    slots: Arc<Vec<Slot>>,
}

impl WeightSet {
    /// Loads every tensor under `prefix` (or all of them) from a safetensors
    /// file onto `device`, converted to `dtype`.
    pub fn load(
        path: impl AsRef<Path>,
        prefix: Option<&str>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        let mut converted = HashMap::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            converted.insert(name, tensor.to_dtype(dtype)?);
        }
        Ok(Self::from_tensors(converted, prefix))
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>, prefix: Option<&str>) -> Self {
        let mut entries: Vec<(String, Tensor)> = tensors
            .into_iter()
            .filter(|(name, _)| prefix.map_or(true, |p| name.starts_with(p)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let slots = entries
            .into_iter()
            .map(|(name, tensor)| Slot {
                name,
                tensor: RwLock::new(tensor),
            })
            .collect();
        Self {
            slots: Arc::new(slots),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Placement unit handles in slot (name-sorted) order.
    pub fn units(&self) -> Vec<Arc<dyn PlacementUnit>> {
        (0..self.slots.len())
            .map(|index| {
                Arc::new(WeightUnit {
                    slots: self.slots.clone(),
                    index,
                }) as Arc<dyn PlacementUnit>
            })
            .collect()
    }

    pub fn move_all(&self, device: &Device) -> Result<()> {
        for slot in self.slots.iter() {
            let mut tensor = slot.tensor.write().unwrap_or_else(|e| e.into_inner());
            *tensor = tensor.to_device(device)?;
        }
        Ok(())
    }

    /// Snapshot of the current tensors for rebuilding a model through
    /// `VarBuilder::from_tensors`. Tensor clones share storage, so this does
    /// not copy weight data.
    pub fn tensors(&self) -> HashMap<String, Tensor> {
        self.slots
            .iter()
            .map(|slot| {
                let tensor = slot.tensor.read().unwrap_or_else(|e| e.into_inner());
                (slot.name.clone(), tensor.clone())
            })
            .collect()
    }
}

struct WeightUnit {
    slots: Arc<Vec<Slot>>,
    index: usize,
}

impl PlacementUnit for WeightUnit {
    fn move_to(&self, device: &Device) -> Result<()> {
        let slot = &self.slots[self.index];
        let mut tensor = slot.tensor.write().unwrap_or_else(|e| e.into_inner());
        *tensor = tensor.to_device(device)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor() -> Tensor {
        Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap()
    }

    fn named(names: &[&str]) -> HashMap<String, Tensor> {
        names.iter().map(|n| (n.to_string(), tensor())).collect()
    }

    #[test]
    fn slots_are_name_sorted() {
        let set = WeightSet::from_tensors(named(&["c.weight", "a.weight", "a.b.weight"]), None);
        let names: Vec<_> = set.tensors().into_keys().collect();
        assert_eq!(set.len(), 3);
        assert!(names.contains(&"a.b.weight".to_string()));

        // Moving unit 0 must always touch the first sorted name; verify via a
        // fresh single-slot set that ordering survives round trips.
        let rebuilt = WeightSet::from_tensors(set.tensors(), None);
        assert_eq!(rebuilt.len(), 3);
    }

    #[test]
    fn prefix_filter_selects_subtree() {
        let set = WeightSet::from_tensors(
            named(&[
                "model.diffusion_model.x.weight",
                "first_stage_model.y.weight",
            ]),
            Some("model.diffusion_model."),
        );
        assert_eq!(set.len(), 1);
        assert!(set
            .tensors()
            .contains_key("model.diffusion_model.x.weight"));
    }

    #[test]
    fn unit_moves_do_not_change_slot_count_or_values() {
        let set = WeightSet::from_tensors(named(&["a", "b"]), None);
        for unit in set.units() {
            unit.move_to(&Device::Cpu).unwrap();
        }
        set.move_all(&Device::Cpu).unwrap();
        assert_eq!(set.len(), 2);
        let sum: f32 = set.tensors()["a"]
            .flatten_all()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(sum, 0.0);
    }
}
