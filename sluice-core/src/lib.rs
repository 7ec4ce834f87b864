pub mod device_map;
pub mod loader;
mod loader_factory;
mod orchestrator;
mod placement;
mod reclaim;
mod registry;
mod util;

pub mod sd3;

pub use device_map::*;
pub use loader::*;
pub use loader_factory::*;
pub use orchestrator::*;
pub use placement::*;
pub use reclaim::*;
pub use registry::*;
pub use sd3::Sd3Loader;
use serde::{Deserialize, Serialize};
pub use util::*;

fn default_steps() -> usize {
    28
}

fn default_guidance() -> f64 {
    7.0
}

fn default_image_count() -> usize {
    1
}

// Define the request type shared by the server and the orchestrator.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f64,
    #[serde(default = "default_image_count")]
    pub num_images_per_prompt: usize,
    pub seed: Option<u64>,
}
