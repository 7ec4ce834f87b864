use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::mmdit::model::{Config as MMDiTConfig, MMDiT};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use image::DynamicImage;

use super::{sampling, WeightSet};
use crate::{
    tensor_to_image, ImageSampler, PlacementUnit, PromptEmbeddings, SampleParams, StagedAssembly,
};

const MMDIT_PREFIX: &str = "model.diffusion_model";
const VAE_PREFIX: &str = "first_stage_model";
/// SD3 latent scale/shift applied before VAE decode.
const LATENT_SCALE: f64 = 1.5305;
const LATENT_SHIFT: f64 = 0.0609;
const TIME_SHIFT: f64 = 3.0;

/// The image-generation pipeline without its text encoders: MMDiT plus the
/// VAE decode stage.
///
/// The placement traversal covers the MMDiT weight set; the whole-assembly
/// move also carries the (much smaller) VAE. Forward models are rebuilt from
/// the current slots per sample call, after the orchestrator has staged
/// everything onto the accelerator.
pub struct Sd3GeneratorAssembly {
    device: Device,
    dtype: DType,
    mmdit_config: MMDiTConfig,
    mmdit_weights: WeightSet,
    vae_weights: WeightSet,
    height: usize,
    width: usize,
}

impl Sd3GeneratorAssembly {
    pub fn new(
        device: Device,
        dtype: DType,
        mmdit_config: MMDiTConfig,
        mmdit_weights: WeightSet,
        vae_weights: WeightSet,
        height: usize,
        width: usize,
    ) -> Self {
        Self {
            device,
            dtype,
            mmdit_config,
            mmdit_weights,
            vae_weights,
            height,
            width,
        }
    }

    pub fn mmdit_prefix() -> &'static str {
        MMDIT_PREFIX
    }

    pub fn vae_prefix() -> &'static str {
        VAE_PREFIX
    }

    fn sd3_vae_config() -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 16,
            norm_num_groups: 32,
            use_quant_conv: false,
            use_post_quant_conv: false,
        }
    }

    fn build_mmdit(&self) -> Result<MMDiT> {
        let vb = VarBuilder::from_tensors(self.mmdit_weights.tensors(), self.dtype, &self.device);
        MMDiT::new(&self.mmdit_config, false, vb.pp(MMDIT_PREFIX))
            .context("failed to rebuild MMDiT")
    }

    fn build_vae(&self) -> Result<AutoEncoderKL> {
        let vb = VarBuilder::from_tensors(self.vae_weights.tensors(), self.dtype, &self.device);
        AutoEncoderKL::new(vb.pp(VAE_PREFIX), 3, 3, Self::sd3_vae_config())
            .context("failed to rebuild VAE")
    }
}

impl ImageSampler for Sd3GeneratorAssembly {
    fn sample(
        &self,
        embeds: &PromptEmbeddings,
        params: &SampleParams,
    ) -> Result<Vec<DynamicImage>> {
        if let Some(seed) = params.seed {
            self.device.set_seed(seed)?;
        }
        let mmdit = self.build_mmdit()?;
        let vae = self.build_vae()?;

        let context = Tensor::cat(
            &[&embeds.prompt_embeds, &embeds.negative_prompt_embeds],
            0,
        )?;
        let y = Tensor::cat(
            &[
                &embeds.pooled_prompt_embeds,
                &embeds.negative_pooled_prompt_embeds,
            ],
            0,
        )?;

        let mut images = Vec::with_capacity(params.image_count);
        for index in 0..params.image_count {
            tracing::debug!("sampling image {}/{}", index + 1, params.image_count);
            let latent = sampling::euler_sample(
                &mmdit,
                &y,
                &context,
                params.steps,
                params.guidance_scale,
                TIME_SHIFT,
                self.height,
                self.width,
                &self.device,
                self.dtype,
            )?;
            let latent = ((latent / LATENT_SCALE)? + LATENT_SHIFT)?;
            let decoded = vae.decode(&latent)?;
            let pixels = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
            images.push(tensor_to_image(&pixels.i(0)?)?);
        }
        Ok(images)
    }
}

impl StagedAssembly for Sd3GeneratorAssembly {
    fn traverse(&self) -> Vec<Arc<dyn PlacementUnit>> {
        self.mmdit_weights.units()
    }

    fn move_all(&self, device: &Device) -> Result<()> {
        self.mmdit_weights.move_all(device)?;
        self.vae_weights.move_all(device)
    }
}
