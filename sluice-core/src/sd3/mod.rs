use anyhow::{anyhow, Context, Result};
use candle_nn::VarBuilder;
use candle_transformers::models::mmdit::model::Config as MMDiTConfig;
use candle_transformers::models::t5;
use hf_hub::api::tokio::Api;
use std::sync::Arc;

mod encoder;
mod generator;
mod sampling;
mod weights;

pub use encoder::{ClipEncoder, Sd3EncoderAssembly};
pub use generator::Sd3GeneratorAssembly;
pub use weights::WeightSet;

use crate::{
    DeviceMap, Loader, Orchestrator, PipelineVariant, PlacementController, StagedModule,
    StagingPlan, Tiers,
};

const DEFAULT_HEIGHT: usize = 1024;
const DEFAULT_WIDTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sd3Variant {
    Medium,
    ThreeFiveMedium,
}

impl Sd3Variant {
    pub fn repo(&self) -> &'static str {
        match self {
            Self::Medium => "stabilityai/stable-diffusion-3-medium",
            Self::ThreeFiveMedium => "stabilityai/stable-diffusion-3.5-medium",
        }
    }

    pub fn model_file(&self) -> &'static str {
        match self {
            Self::Medium => "sd3_medium.safetensors",
            Self::ThreeFiveMedium => "sd3.5_medium.safetensors",
        }
    }

    pub fn mmdit_config(&self) -> MMDiTConfig {
        match self {
            Self::Medium => MMDiTConfig::sd3_medium(),
            Self::ThreeFiveMedium => MMDiTConfig::sd3_5_medium(),
        }
    }
}

pub struct Sd3Loader;

impl Loader for Sd3Loader {
    type Pipeline = Orchestrator;

    async fn load(
        variant: PipelineVariant,
        api: Api,
        device_map: DeviceMap,
        plan: StagingPlan,
    ) -> Result<Self::Pipeline> {
        let PipelineVariant::Sd3(variant) = variant;

        // Configure the two device tiers.
        let tiers = Tiers::resolve(device_map).context("failed to set up devices")?;
        let device = tiers.accelerator.clone();
        let dtype = device.bf16_default_to_f32();

        let sd3_repo = api.repo(hf_hub::Repo::model(variant.repo().to_string()));

        // --- Load the three text encoders, fully on the accelerator ---
        let clip_l_file = sd3_repo
            .get("text_encoders/clip_l.safetensors")
            .await
            .context("failed to get CLIP-L model file")?;
        let clip_l_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_l_file], dtype, &device)
                .context("failed to build CLIP-L var builder")?
        };
        let clip_l = ClipEncoder::load_l(clip_l_vb).context("failed to load CLIP-L model")?;

        let clip_g_file = sd3_repo
            .get("text_encoders/clip_g.safetensors")
            .await
            .context("failed to get CLIP-G model file")?;
        let clip_g_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_g_file], dtype, &device)
                .context("failed to build CLIP-G var builder")?
        };
        let clip_g = ClipEncoder::load_g(clip_g_vb).context("failed to load CLIP-G model")?;

        let clip_tokenizer_filename = api
            .repo(hf_hub::Repo::model(
                "openai/clip-vit-large-patch14".to_string(),
            ))
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = tokenizers::Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // T5-XXL is the staged encoder: its weights live in relocatable slots.
        let t5_file = sd3_repo
            .get("text_encoders/t5xxl_fp16.safetensors")
            .await
            .context("failed to get T5 model file")?;
        let t5_weights = WeightSet::load(&t5_file, None, dtype, &device)
            .context("failed to load T5 weight set")?;
        let t5_config_filename = api
            .repo(hf_hub::Repo::with_revision(
                "google/t5-v1_1-xxl".to_string(),
                hf_hub::RepoType::Model,
                "refs/pr/2".to_string(),
            ))
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let t5_config: t5::Config = serde_json::from_str(
            &std::fs::read_to_string(&t5_config_filename).context("failed to read T5 config")?,
        )
        .context("failed to parse T5 config")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = tokenizers::Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(anyhow::Error::msg)
            .context("failed to load T5 tokenizer")?;

        let encoder = Arc::new(Sd3EncoderAssembly::new(
            device.clone(),
            dtype,
            clip_l,
            clip_g,
            clip_tokenizer,
            t5_weights,
            t5_config,
            t5_tokenizer,
        ));

        // --- Load MMDiT and VAE weight sets onto the host tier ---
        let model_file = sd3_repo
            .get(variant.model_file())
            .await
            .context("failed to get SD3 model file")?;
        let mmdit_weights = WeightSet::load(
            &model_file,
            Some(&format!("{}.", Sd3GeneratorAssembly::mmdit_prefix())),
            dtype,
            &tiers.host,
        )
        .context("failed to load MMDiT weight set")?;
        if mmdit_weights.is_empty() {
            return Err(anyhow!(
                "no MMDiT weights found under prefix {}",
                Sd3GeneratorAssembly::mmdit_prefix()
            ));
        }
        let vae_weights = WeightSet::load(
            &model_file,
            Some(&format!("{}.", Sd3GeneratorAssembly::vae_prefix())),
            dtype,
            &tiers.host,
        )
        .context("failed to load VAE weight set")?;

        let generator = Arc::new(Sd3GeneratorAssembly::new(
            device,
            dtype,
            variant.mmdit_config(),
            mmdit_weights,
            vae_weights,
            DEFAULT_HEIGHT,
            DEFAULT_WIDTH,
        ));

        // --- Wire the placement scheduler ---
        let encoder_module = StagedModule::new(encoder.clone());
        let generator_module = StagedModule::new(generator.clone());
        let controller = PlacementController::new(tiers);
        let orchestrator = Orchestrator::new(
            encoder,
            generator,
            encoder_module,
            generator_module,
            controller,
            plan,
        );

        // Load-complete resting state, then one warmup cycle before traffic.
        orchestrator.establish_resting_state()?;
        orchestrator.warmup()?;

        Ok(orchestrator)
    }
}
