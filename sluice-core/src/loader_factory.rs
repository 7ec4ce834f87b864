use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::sd3::{self, Sd3Loader};
use crate::{DeviceMap, Loader, Orchestrator, StagingPlan};
use std::sync::Arc;

/// Enum of supported pipeline families
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineType {
    Sd3,
    // Add more pipeline families as they become available
}

impl PipelineType {
    /// Detect pipeline family from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION-3") || name_upper.contains("SD3") {
            Some(PipelineType::Sd3)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineVariant {
    Sd3(sd3::Sd3Variant),
}

impl PipelineVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION-3") || name_upper.contains("SD3") {
            Some(PipelineVariant::Sd3(
                if name_upper.contains("3.5") || name_upper.contains("3-5") {
                    sd3::Sd3Variant::ThreeFiveMedium
                } else {
                    sd3::Sd3Variant::Medium
                },
            ))
        } else {
            None
        }
    }
}

/// Load a pipeline based on its model name, automatically detecting the
/// appropriate loader
pub async fn load_pipeline(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
    plan: StagingPlan,
) -> Result<Arc<Orchestrator>> {
    // Get pipeline family and variant or return error if unsupported
    let pipeline_type = PipelineType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported pipeline type: {}", model_name))?;
    let pipeline_variant = PipelineVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported pipeline variant: {}", model_name))?;

    tracing::info!(
        "Loading pipeline: {} (detected type: {:?}/variant: {:?})",
        model_name,
        pipeline_type,
        pipeline_variant
    );

    match pipeline_type {
        PipelineType::Sd3 => {
            let pipeline = Sd3Loader::load(pipeline_variant, api, device_map, plan).await?;
            Ok(Arc::new(pipeline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sd3_medium() {
        let variant = PipelineVariant::from_name("stabilityai/stable-diffusion-3-medium");
        assert!(matches!(
            variant,
            Some(PipelineVariant::Sd3(sd3::Sd3Variant::Medium))
        ));
    }

    #[test]
    fn detects_sd3_5_medium() {
        let variant = PipelineVariant::from_name("stabilityai/stable-diffusion-3.5-medium");
        assert!(matches!(
            variant,
            Some(PipelineVariant::Sd3(sd3::Sd3Variant::ThreeFiveMedium))
        ));
    }

    #[test]
    fn rejects_unknown_models() {
        assert!(PipelineType::from_name("black-forest-labs/FLUX.1-schnell").is_none());
    }
}
