use std::sync::Arc;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::stable_diffusion::clip::{
    ClipTextTransformer, Config as ClipConfig,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use tokenizers::Tokenizer;

use super::WeightSet;
use crate::{PlacementUnit, PromptEmbeddings, StagedAssembly, TextEncoder};

const CLIP_SEQUENCE_LENGTH: usize = 77;
const T5_SEQUENCE_LENGTH: usize = 512;
/// Joint-attention width of the MMDiT context; the CLIP concat is zero-padded
/// up to it.
const CONTEXT_DIM: usize = 4096;

/// Width of the CLIP-L hidden/projected states.
pub const CLIP_L_WIDTH: usize = 768;
/// Width of the CLIP-G hidden/projected states.
pub const CLIP_G_WIDTH: usize = 1280;

/// The SD3 text-encoder checkpoints use the transformers layout: transformer
/// weights nested under `text_model.`, the pooled-output projection at
/// `text_projection.weight`.
pub(crate) const CLIP_WEIGHTS_PREFIX: &str = "text_model";
const CLIP_PROJECTION_PREFIX: &str = "text_projection";

/// One CLIP text encoder plus its pooled-output projection.
pub struct ClipEncoder {
    model: ClipTextTransformer,
    projection: Linear,
}

impl ClipEncoder {
    fn load(vb: VarBuilder, config: &ClipConfig, width: usize) -> Result<Self> {
        let model = ClipTextTransformer::new(vb.pp(CLIP_WEIGHTS_PREFIX), config)
            .context("failed to load CLIP text transformer")?;
        let projection = candle_nn::linear_no_bias(width, width, vb.pp(CLIP_PROJECTION_PREFIX))
            .context("failed to load CLIP text projection")?;
        Ok(Self { model, projection })
    }

    pub fn load_l(vb: VarBuilder) -> Result<Self> {
        Self::load(vb, &ClipConfig::sdxl(), CLIP_L_WIDTH)
    }

    pub fn load_g(vb: VarBuilder) -> Result<Self> {
        Self::load(vb, &ClipConfig::sdxl2(), CLIP_G_WIDTH)
    }

    /// Returns the penultimate-layer hidden states (SD3 conditions on
    /// clip-skip output, not the final layer) and the projected pooled vector
    /// taken from the final layer norm at the EOS position.
    fn forward(&self, ids: &Tensor, eos_position: usize) -> Result<(Tensor, Tensor)> {
        let (final_states, penultimate) =
            self.model
                .forward_until_encoder_layer(ids, usize::MAX, -2)?;
        let pooled = final_states
            .narrow(1, eos_position, 1)?
            .squeeze(1)?
            .apply(&self.projection)?;
        Ok((penultimate, pooled))
    }
}

/// The three tokenizer/text-encoder pairs of SD3.
///
/// CLIP-L and CLIP-G are small enough to live on the accelerator permanently;
/// only the T5-XXL weights participate in staging, so the placement traversal
/// covers the T5 weight set alone. The T5 forward model is rebuilt from the
/// current slots on every encode, which is cheap while they are resident.
pub struct Sd3EncoderAssembly {
    device: Device,
    dtype: DType,
    clip_l: ClipEncoder,
    clip_g: ClipEncoder,
    clip_tokenizer: Tokenizer,
    t5_weights: WeightSet,
    t5_config: t5::Config,
    t5_tokenizer: Tokenizer,
}

impl Sd3EncoderAssembly {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Device,
        dtype: DType,
        clip_l: ClipEncoder,
        clip_g: ClipEncoder,
        clip_tokenizer: Tokenizer,
        t5_weights: WeightSet,
        t5_config: t5::Config,
        t5_tokenizer: Tokenizer,
    ) -> Self {
        Self {
            device,
            dtype,
            clip_l,
            clip_g,
            clip_tokenizer,
            t5_weights,
            t5_config,
            t5_tokenizer,
        }
    }

    fn clip_tokens(&self, text: &str) -> Result<(Tensor, usize)> {
        let mut tokens = self
            .clip_tokenizer
            .encode(text, true)
            .map_err(Error::msg)
            .context("failed to tokenize prompt for CLIP")?
            .get_ids()
            .to_vec();
        tokens.truncate(CLIP_SEQUENCE_LENGTH);
        let eos_position = tokens.len().saturating_sub(1);
        tokens.resize(CLIP_SEQUENCE_LENGTH, 0);
        let ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok((ids, eos_position))
    }

    /// One encode pass: joint sequence context plus the pooled CLIP vector.
    fn encode_one(&self, t5_model: &mut T5EncoderModel, text: &str) -> Result<(Tensor, Tensor)> {
        let (clip_ids, eos_position) = self.clip_tokens(text)?;

        let (hidden_l, pooled_l) = self.clip_l.forward(&clip_ids, eos_position)?;
        let (hidden_g, pooled_g) = self.clip_g.forward(&clip_ids, eos_position)?;
        let pooled = Tensor::cat(&[&pooled_l, &pooled_g], D::Minus1)?;

        let clip_joint = Tensor::cat(&[&hidden_l, &hidden_g], D::Minus1)?;
        let clip_width = clip_joint.dim(D::Minus1)?;
        let clip_joint = clip_joint.pad_with_zeros(D::Minus1, 0, CONTEXT_DIM - clip_width)?;

        let mut t5_tokens = self
            .t5_tokenizer
            .encode(text, true)
            .map_err(Error::msg)
            .context("failed to tokenize prompt for T5")?
            .get_ids()
            .to_vec();
        t5_tokens.truncate(T5_SEQUENCE_LENGTH);
        t5_tokens.resize(T5_SEQUENCE_LENGTH, 0);
        let t5_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_hidden = t5_model.forward(&t5_ids)?.to_dtype(self.dtype)?;

        let context = Tensor::cat(&[&clip_joint, &t5_hidden], 1)?;
        Ok((context, pooled))
    }

    fn build_t5(&self) -> Result<T5EncoderModel> {
        let vb = VarBuilder::from_tensors(self.t5_weights.tensors(), self.dtype, &self.device);
        T5EncoderModel::load(vb, &self.t5_config).context("failed to rebuild T5 encoder")
    }
}

impl TextEncoder for Sd3EncoderAssembly {
    fn encode(&self, prompt: &str, negative_prompt: &str) -> Result<PromptEmbeddings> {
        let mut t5_model = self.build_t5()?;
        let (prompt_embeds, pooled_prompt_embeds) = self
            .encode_one(&mut t5_model, prompt)
            .context("failed to encode prompt")?;
        let (negative_prompt_embeds, negative_pooled_prompt_embeds) = self
            .encode_one(&mut t5_model, negative_prompt)
            .context("failed to encode negative prompt")?;
        Ok(PromptEmbeddings {
            prompt_embeds,
            negative_prompt_embeds,
            pooled_prompt_embeds,
            negative_pooled_prompt_embeds,
        })
    }
}

impl StagedAssembly for Sd3EncoderAssembly {
    fn traverse(&self) -> Vec<Arc<dyn PlacementUnit>> {
        self.t5_weights.units()
    }

    fn move_all(&self, device: &Device) -> Result<()> {
        self.t5_weights.move_all(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // The SD3 clip_l/clip_g checkpoints keep their transformer weights under
    // the `text_model.` prefix, with the projection beside it at the root.
    // The loader must resolve names through that nesting, not at the root.
    #[test]
    fn clip_lookup_nests_under_text_model_prefix() {
        let name = "text_model.embeddings.token_embedding.weight";
        let mut tensors = HashMap::new();
        tensors.insert(
            name.to_string(),
            Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);

        assert!(vb
            .pp(CLIP_WEIGHTS_PREFIX)
            .get((4, 2), "embeddings.token_embedding.weight")
            .is_ok());
        assert!(
            vb.get((4, 2), "embeddings.token_embedding.weight").is_err(),
            "root-level lookup must not resolve transformers-layout weights"
        );
    }

    #[test]
    fn clip_projection_sits_beside_text_model() {
        let mut tensors = HashMap::new();
        tensors.insert(
            format!("{CLIP_PROJECTION_PREFIX}.weight"),
            Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        assert!(candle_nn::linear_no_bias(4, 4, vb.pp(CLIP_PROJECTION_PREFIX)).is_ok());
    }
}
