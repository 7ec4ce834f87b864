use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use candle_core::Tensor;
use image::DynamicImage;

use crate::{Extent, GenerationRequest, PlacementController, StagedModule, Tier};

/// The four embedding tensors one encode pass produces.
pub struct PromptEmbeddings {
    pub prompt_embeds: Tensor,
    pub negative_prompt_embeds: Tensor,
    pub pooled_prompt_embeds: Tensor,
    pub negative_pooled_prompt_embeds: Tensor,
}

/// Opaque embedding capability: produce embeddings from prompts.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, prompt: &str, negative_prompt: &str) -> Result<PromptEmbeddings>;
}

#[derive(Clone, Copy, Debug)]
pub struct SampleParams {
    pub steps: usize,
    pub guidance_scale: f64,
    pub image_count: usize,
    pub seed: Option<u64>,
}

/// Opaque sampling capability: denoise latents and decode to pixels.
/// Precondition: the generator assembly is fully resident on the accelerator.
pub trait ImageSampler: Send + Sync {
    fn sample(&self, embeds: &PromptEmbeddings, params: &SampleParams)
        -> Result<Vec<DynamicImage>>;
}

/// Unit counts for each staging transition. These are approximate working-set
/// sizes by unit count, not by byte size; the defaults were tuned for SD3
/// medium on a 16GB device.
#[derive(Clone, Copy, Debug)]
pub struct StagingPlan {
    /// Generator units prefetched to the accelerator before the encoder is
    /// evicted.
    pub generator_prefetch: usize,
    /// Text-encoder-3 units evicted to host to make room for the generator.
    pub encoder_evict: usize,
    /// Text-encoder-3 units restored first after sampling (minimal working
    /// set).
    pub encoder_prime: usize,
    /// Text-encoder-3 units resident at rest. Re-asserted after
    /// `encoder_prime` on purpose: the two-step widening primes a minimal set
    /// before the generator has fully left the device.
    pub encoder_rest: usize,
}

impl Default for StagingPlan {
    fn default() -> Self {
        Self {
            generator_prefetch: 400,
            encoder_evict: 250,
            encoder_prime: 150,
            encoder_rest: 250,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Encoding,
    StagingForSample,
    Sampling,
    StagingForRest,
}

/// Prompt used for the single warmup generation at load time.
pub const WARMUP_PROMPT: &str = "gold ring with diamond with two interlocking bands made of polished yellow gold, each with a smooth, rounded profile that tapers slightly towards the back for comfort. a central floral cluster of diamonds, featuring a larger round diamond surrounded by smaller round diamonds arranged in a petal-like formation, creating a blooming effect. a halo of smaller diamonds encircling the central floral cluster, enhancing the overall sparkle and creating a sense of depth. the base of the ring features a smooth, polished finish that complements the intricate diamond settings, ensuring a seamless transition from the floral designs to the band.";

/// Sequences encoding, placement transitions and sampling for one request,
/// then restores the resting placement.
///
/// At most one generation is in flight at a time: the whole per-request
/// sequence runs under a single-permit gate, because placement state is
/// process-wide and two interleaved staging sequences would leave units on
/// the wrong device or start sampling with the generator only partially
/// resident.
pub struct Orchestrator {
    encoder: Arc<dyn TextEncoder>,
    sampler: Arc<dyn ImageSampler>,
    encoder_module: StagedModule,
    generator_module: StagedModule,
    controller: PlacementController,
    plan: StagingPlan,
    gate: Mutex<()>,
    phase: Mutex<Phase>,
}

impl Orchestrator {
    pub fn new(
        encoder: Arc<dyn TextEncoder>,
        sampler: Arc<dyn ImageSampler>,
        encoder_module: StagedModule,
        generator_module: StagedModule,
        controller: PlacementController,
        plan: StagingPlan,
    ) -> Self {
        Self {
            encoder,
            sampler,
            encoder_module,
            generator_module,
            controller,
            plan,
            gate: Mutex::new(()),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Establishes the load-complete resting state: encoders stay wherever
    /// load put them (fully on the accelerator), generator fully on host.
    pub fn establish_resting_state(&self) -> Result<()> {
        self.controller
            .place(&self.generator_module, Tier::Host, Extent::All)
            .context("failed to move generator to host after load")
    }

    /// Runs the full phase sequence for one request. Failures propagate
    /// without restoring the resting placement; the next request starts from
    /// whatever the failed sequence left behind.
    pub fn generate(&self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
        let _flight = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let plan = self.plan;

        self.set_phase(Phase::Encoding);
        let embeds = self
            .encoder
            .encode(&request.prompt, &request.negative_prompt)
            .context("prompt encoding failed")?;

        self.set_phase(Phase::StagingForSample);
        self.controller.place(
            &self.generator_module,
            Tier::Accelerator,
            Extent::Units(plan.generator_prefetch),
        )?;
        self.controller.place(
            &self.encoder_module,
            Tier::Host,
            Extent::Units(plan.encoder_evict),
        )?;
        self.controller
            .place(&self.generator_module, Tier::Accelerator, Extent::All)?;

        self.set_phase(Phase::Sampling);
        let params = SampleParams {
            steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            image_count: request.num_images_per_prompt,
            seed: request.seed,
        };
        let images = self
            .sampler
            .sample(&embeds, &params)
            .context("sampling failed")?;
        self.controller.reclaim();

        self.set_phase(Phase::StagingForRest);
        self.controller.place(
            &self.encoder_module,
            Tier::Accelerator,
            Extent::Units(plan.encoder_prime),
        )?;
        self.controller
            .place(&self.generator_module, Tier::Host, Extent::All)?;
        self.controller.place(
            &self.encoder_module,
            Tier::Accelerator,
            Extent::Units(plan.encoder_rest),
        )?;

        self.set_phase(Phase::Idle);
        Ok(images)
    }

    /// One throwaway low-step generation to materialize kernels and validate
    /// the placement sequence before the listener accepts traffic.
    pub fn warmup(&self) -> Result<()> {
        tracing::info!("running warmup generation");
        let request = GenerationRequest {
            prompt: WARMUP_PROMPT.to_string(),
            negative_prompt: String::new(),
            num_inference_steps: 1,
            guidance_scale: 7.0,
            num_images_per_prompt: 1,
            seed: None,
        };
        let _ = self.generate(&request).context("warmup generation failed")?;
        tracing::info!("warmup complete");
        Ok(())
    }

    pub fn encoder_module(&self) -> &StagedModule {
        &self.encoder_module
    }

    pub fn generator_module(&self) -> &StagedModule {
        &self.generator_module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceMap, PlacementUnit, StagedAssembly, Tiers};
    use anyhow::anyhow;
    use candle_core::{DType, Device};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct InertUnit;

    impl PlacementUnit for InertUnit {
        fn move_to(&self, _device: &Device) -> Result<()> {
            Ok(())
        }
    }

    struct InertAssembly {
        units: usize,
    }

    impl StagedAssembly for InertAssembly {
        fn traverse(&self) -> Vec<Arc<dyn PlacementUnit>> {
            (0..self.units)
                .map(|_| Arc::new(InertUnit) as Arc<dyn PlacementUnit>)
                .collect()
        }

        fn move_all(&self, _device: &Device) -> Result<()> {
            Ok(())
        }
    }

    fn zero_embeddings() -> PromptEmbeddings {
        let zeros = || Tensor::zeros((1, 1), DType::F32, &Device::Cpu).unwrap();
        PromptEmbeddings {
            prompt_embeds: zeros(),
            negative_prompt_embeds: zeros(),
            pooled_prompt_embeds: zeros(),
            negative_pooled_prompt_embeds: zeros(),
        }
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<String>>);

    impl EventLog {
        fn push(&self, event: impl Into<String>) {
            self.0.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeEncoder {
        log: Arc<EventLog>,
        fail: bool,
    }

    impl TextEncoder for FakeEncoder {
        fn encode(&self, prompt: &str, _negative_prompt: &str) -> Result<PromptEmbeddings> {
            self.log.push(format!("encode:{prompt}"));
            if self.fail {
                return Err(anyhow!("bad prompt weighting syntax"));
            }
            std::thread::sleep(Duration::from_millis(5));
            Ok(zero_embeddings())
        }
    }

    struct FakeSampler {
        log: Arc<EventLog>,
        samples: AtomicUsize,
    }

    impl ImageSampler for FakeSampler {
        fn sample(
            &self,
            _embeds: &PromptEmbeddings,
            params: &SampleParams,
        ) -> Result<Vec<DynamicImage>> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.log.push(format!("sample:{}", params.image_count));
            Ok((0..params.image_count)
                .map(|_| DynamicImage::new_rgb8(2, 2))
                .collect())
        }
    }

    fn test_plan() -> StagingPlan {
        StagingPlan {
            generator_prefetch: 2,
            encoder_evict: 3,
            encoder_prime: 1,
            encoder_rest: 3,
        }
    }

    fn orchestrator(
        log: Arc<EventLog>,
        encoder_fails: bool,
    ) -> (Orchestrator, Arc<FakeSampler>) {
        let sampler = Arc::new(FakeSampler {
            log: log.clone(),
            samples: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(
            Arc::new(FakeEncoder {
                log,
                fail: encoder_fails,
            }),
            sampler.clone(),
            StagedModule::new(Arc::new(InertAssembly { units: 5 })),
            StagedModule::new(Arc::new(InertAssembly { units: 4 })),
            PlacementController::new(Tiers::resolve(DeviceMap::ForceCpu).unwrap()),
            test_plan(),
        );
        (orchestrator, sampler)
    }

    fn request(prompt: &str, images: usize) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            negative_prompt: String::new(),
            num_inference_steps: 2,
            guidance_scale: 7.0,
            num_images_per_prompt: images,
            seed: Some(42),
        }
    }

    #[test]
    fn full_cycle_returns_to_resting_placement() {
        let (orchestrator, _) = orchestrator(Arc::new(EventLog::default()), false);
        orchestrator.establish_resting_state().unwrap();
        let images = orchestrator.generate(&request("a red bicycle", 1)).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(orchestrator.phase(), Phase::Idle);

        // Post-generation resting state: first `encoder_rest` deepest units of
        // text-encoder-3 on the accelerator, the rest never explicitly moved;
        // generator fully on host.
        let encoder_tiers = orchestrator.encoder_module().unit_tiers();
        assert_eq!(
            encoder_tiers,
            vec![
                Some(Tier::Accelerator),
                Some(Tier::Accelerator),
                Some(Tier::Accelerator),
                None,
                None,
            ]
        );
        assert_eq!(
            orchestrator.generator_module().unit_tiers(),
            vec![Some(Tier::Host); 4]
        );
    }

    #[test]
    fn image_count_is_respected() {
        let (orchestrator, _) = orchestrator(Arc::new(EventLog::default()), false);
        orchestrator.establish_resting_state().unwrap();
        let images = orchestrator.generate(&request("a red bicycle", 3)).unwrap();
        assert_eq!(images.len(), 3);
    }

    #[test]
    fn encode_failure_aborts_before_sampling() {
        let log = Arc::new(EventLog::default());
        let (orchestrator, sampler) = orchestrator(log, true);
        orchestrator.establish_resting_state().unwrap();
        let err = orchestrator.generate(&request("(((", 1)).unwrap_err();
        assert!(err.to_string().contains("prompt encoding failed"));
        assert_eq!(sampler.samples.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_requests_do_not_interleave() {
        let log = Arc::new(EventLog::default());
        let (orchestrator, _) = orchestrator(log.clone(), false);
        orchestrator.establish_resting_state().unwrap();
        let orchestrator = Arc::new(orchestrator);

        let handles: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|tag| {
                let orchestrator = orchestrator.clone();
                std::thread::spawn(move || orchestrator.generate(&request(tag, 1)).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Whichever request wins the gate must finish its whole sequence
        // before the other's encode begins.
        let events = log.events();
        assert_eq!(events.len(), 4);
        let first_tag = events[0].strip_prefix("encode:").unwrap().to_string();
        assert_eq!(events[1], "sample:1");
        assert_ne!(events[2], format!("encode:{first_tag}"));
        assert_eq!(events[3], "sample:1");
    }

    #[test]
    fn warmup_runs_one_generation() {
        let log = Arc::new(EventLog::default());
        let (orchestrator, sampler) = orchestrator(log.clone(), false);
        orchestrator.establish_resting_state().unwrap();
        orchestrator.warmup().unwrap();
        assert_eq!(sampler.samples.load(Ordering::SeqCst), 1);
        assert!(log.events()[0].starts_with("encode:gold ring with diamond"));
    }
}
