use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::{Scheduler, SchedulerConfig};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use super::conditioning::snap_dimension;
use super::{ActiveConfiguration, PromptFreeCallback, PromptFreePipeline};
use crate::network::PromptFreeNetwork;
use crate::registry::{ContextEncoder, ControlAdapter, Diffuser, PreprocessMethod};

/// Offset between the latent stream's seed and the sampler stream's seed.
const SAMPLER_SEED_OFFSET: u64 = 100;

/// The two pseudorandom seeds derived from a caller-supplied seed.
///
/// One stream drives the initial latent draw, the other the sampler's internal noise draws.
/// The dual-stream convention (and its fixed `+100` offset) is preserved from the original
/// pipeline for output compatibility; it is deliberately confined to [`ResolvedSeeds::resolve`]
/// and should not spread to new code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSeeds {
	/// Seeds the generator the initial latents are drawn from.
	pub latent: u64,
	/// Seeds the device-side generator the sampler draws its internal noise from.
	pub sampler: u64
}

impl ResolvedSeeds {
	/// Derives the two stream seeds from a caller-supplied seed.
	///
	/// A non-negative seed is used directly (sampler stream offset by 100), making the run
	/// reproducible. A negative seed requests an irreproducible run: the latent stream is seeded
	/// from wall-clock time and the sampler stream from the negated value. An absent seed draws
	/// a fresh random 16-bit seed and treats it as non-negative.
	pub fn resolve(seed: Option<i64>) -> Self {
		let seed = seed.unwrap_or_else(|| rand::thread_rng().gen::<u16>() as i64);
		if seed < 0 {
			let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
			Self { latent: now, sampler: seed.unsigned_abs() + SAMPLER_SEED_OFFSET }
		} else {
			Self { latent: seed as u64, sampler: seed as u64 + SAMPLER_SEED_OFFSET }
		}
	}
}

/// Options for a single prompt-free prediction.
#[derive(Debug)]
pub struct PromptFreePredictOptions {
	pub(crate) configuration: ActiveConfiguration,
	pub(crate) preprocess: Option<PreprocessMethod>,
	pub(crate) width: u32,
	pub(crate) height: u32,
	pub(crate) steps: usize,
	pub(crate) guidance_scale: f32,
	pub(crate) seed: Option<i64>,
	pub(crate) samples: usize,
	pub(crate) callback: Option<PromptFreeCallback>
}

impl Default for PromptFreePredictOptions {
	fn default() -> Self {
		Self {
			configuration: ActiveConfiguration::default(),
			preprocess: None,
			width: 512,
			height: 512,
			steps: 50,
			guidance_scale: 2.0,
			seed: None,
			samples: 1,
			callback: None
		}
	}
}

// builder for options
impl PromptFreePredictOptions {
	/// Select the weight subsets to predict with; families already resident are not reloaded.
	pub fn with_configuration(mut self, configuration: ActiveConfiguration) -> Self {
		self.configuration = configuration;
		self
	}
	/// Select the context encoder encoding the input image.
	pub fn with_context_encoder(mut self, tag: ContextEncoder) -> Self {
		self.configuration.context_encoder = tag;
		self
	}
	/// Select the diffusion backbone.
	pub fn with_diffuser(mut self, tag: Diffuser) -> Self {
		self.configuration.diffuser = tag;
		self
	}
	/// Select the control adapter; [`ControlAdapter::None`] disables control conditioning.
	pub fn with_control_adapter(mut self, tag: ControlAdapter) -> Self {
		self.configuration.control_adapter = tag;
		self
	}
	/// Derive the control signal from a raw photo with the given preprocessing method, instead
	/// of treating the control image as already annotated.
	pub fn with_preprocess(mut self, method: PreprocessMethod) -> Self {
		self.preprocess = Some(method);
		self
	}
	/// Set the size of the output image. **Sizes are rounded down to a multiple of 64 and
	/// clamped into `[512, 1536]`.**
	pub fn with_size(self, width: u32, height: u32) -> Self {
		self.with_width(width).with_height(height)
	}
	/// Set the width of the output image; see [`PromptFreePredictOptions::with_size`].
	#[inline]
	pub fn with_width(mut self, width: u32) -> Self {
		self.width = snap_dimension(width);
		self
	}
	/// Set the height of the output image; see [`PromptFreePredictOptions::with_size`].
	#[inline]
	pub fn with_height(mut self, height: u32) -> Self {
		self.height = snap_dimension(height);
		self
	}
	/// Derive the output size from the control image's own dimensions (512x512 without one).
	pub fn with_autoset_size(self, control_image: Option<&DynamicImage>) -> Self {
		let (width, height) = super::autoset_dimensions(control_image);
		self.with_size(width, height)
	}
	/// The number of denoising steps, clamped into `[1, 500]`. More steps typically yields
	/// higher quality images.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps.clamp(1, 500);
		self
	}
	/// The 'guidance scale' for classifier-free guidance, clamped into `[0, 10]`. A lower
	/// guidance scale gives the model more freedom, but the output may stray further from the
	/// input image's context.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale.clamp(0.0, 10.0);
		self
	}
	/// Set the seed, so that each run generates the same image. Negative seeds produce an
	/// irreproducible run; see [`ResolvedSeeds::resolve`].
	pub fn with_seed(mut self, seed: i64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates a different image.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// The number of images to generate in one run.
	pub fn with_samples(mut self, samples: usize) -> Self {
		self.samples = samples.max(1);
		self
	}
	/// Register a progress callback, called every `frequency` steps; returning `false` stops
	/// sampling early.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, usize) -> bool + 'static
	{
		self.callback = Some(PromptFreeCallback::Progress { frequency, cb: Box::new(callback) });
		self
	}
}

impl PromptFreePredictOptions {
	/// Generates images conditioned on `image` (and optionally `control_image`). Returns a
	/// vector of [`image::DynamicImage`]s, using float32 buffers; in most cases, you'll want to
	/// convert the images into RGB8 via `img.into_rgb8()`.
	///
	/// Reloads any weight family whose requested tag differs from the pipeline's resident
	/// configuration before sampling; see [`PromptFreePipeline::reconcile`].
	pub fn run<N: PromptFreeNetwork>(
		&self,
		pipeline: &mut PromptFreePipeline<N>,
		image: &DynamicImage,
		control_image: Option<&DynamicImage>
	) -> anyhow::Result<Vec<DynamicImage>> {
		pipeline.reconcile(self.configuration)?;

		let width = snap_dimension(self.width);
		let height = snap_dimension(self.height);
		let conditioning = pipeline.assemble_conditioning(image, control_image, self.preprocess, width, height, self.samples)?;

		let network = pipeline.network();
		let device = network.device();
		let dtype = network.dtype();

		let seeds = ResolvedSeeds::resolve(self.seed);
		debug!("using seeds {seeds:?}");
		// the CPU backend has no seedable generator; its noise all comes from the latent stream
		if !device.is_cpu() {
			device.set_seed(seeds.sampler)?;
		}
		let mut rng = StdRng::seed_from_u64(seeds.latent);

		let do_classifier_free_guidance = self.guidance_scale != 1.0;
		let context = if do_classifier_free_guidance {
			Tensor::cat(&[&conditioning.uncond, &conditioning.context], 0)?
		} else {
			conditioning.context.clone()
		};
		let control = match (&conditioning.control, do_classifier_free_guidance) {
			(Some(control), true) => Some(Tensor::cat(&[control, control], 0)?),
			(Some(control), false) => Some(control.clone()),
			(None, _) => None
		};

		let latent_shape = (self.samples, network.latent_channels(), height as usize / 8, width as usize / 8);
		let noise: Vec<f32> = (0..latent_shape.0 * latent_shape.1 * latent_shape.2 * latent_shape.3)
			.map(|_| rng.sample(StandardNormal))
			.collect();
		let latents = Tensor::from_vec(noise, latent_shape, device)?.to_dtype(dtype)?;

		let mut scheduler: Box<dyn Scheduler> = DDIMSchedulerConfig::default().build(self.steps)?;
		// scale the initial noise by the standard deviation required by the scheduler
		let mut latents = (latents * scheduler.init_noise_sigma())?;

		let timesteps = scheduler.timesteps().to_vec();
		for (step, &timestep) in timesteps.iter().enumerate() {
			let latent_input = if do_classifier_free_guidance {
				Tensor::cat(&[&latents, &latents], 0)?
			} else {
				latents.clone()
			};
			let latent_input = scheduler.scale_model_input(latent_input, timestep)?;

			let noise_pred = network.predict_noise(&latent_input, timestep, &context, control.as_ref())?;
			let noise_pred = if do_classifier_free_guidance {
				let noise_pred = noise_pred.chunk(2, 0)?;
				let (uncond, cond) = (&noise_pred[0], &noise_pred[1]);
				(uncond + ((cond - uncond)? * self.guidance_scale as f64)?)?
			} else {
				noise_pred
			};

			latents = scheduler.step(&noise_pred, timestep, &latents)?;
			debug!("step {}/{} done", step + 1, timesteps.len());

			if let Some(PromptFreeCallback::Progress { frequency, cb }) = self.callback.as_ref() {
				if step % frequency == 0 && !cb(step, timestep) {
					break;
				}
			}
		}

		pipeline.decode_latents(&latents)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn non_negative_seeds_resolve_deterministically() {
		assert_eq!(ResolvedSeeds::resolve(Some(42)), ResolvedSeeds { latent: 42, sampler: 142 });
		assert_eq!(ResolvedSeeds::resolve(Some(0)), ResolvedSeeds { latent: 0, sampler: 100 });
		assert_eq!(ResolvedSeeds::resolve(Some(42)), ResolvedSeeds::resolve(Some(42)));
	}

	#[test]
	fn negative_seeds_negate_into_the_sampler_stream() {
		let seeds = ResolvedSeeds::resolve(Some(-5));
		assert_eq!(seeds.sampler, 105);
		// the latent stream is wall-clock seeded; it must not echo the supplied value
		assert_ne!(seeds.latent, 5);
	}

	#[test]
	fn absent_seeds_fit_sixteen_bits() {
		for _ in 0..32 {
			let seeds = ResolvedSeeds::resolve(None);
			assert!(seeds.latent <= u16::MAX as u64);
			assert_eq!(seeds.sampler, seeds.latent + 100);
		}
	}

	#[test]
	fn sizes_snap_in_builders() {
		let options = PromptFreePredictOptions::default().with_size(700, 900);
		assert_eq!((options.width, options.height), (640, 896));
		let options = PromptFreePredictOptions::default().with_size(4096, 100);
		assert_eq!((options.width, options.height), (1536, 512));
	}

	#[test]
	fn steps_and_guidance_clamp_to_their_ranges() {
		let options = PromptFreePredictOptions::default().with_steps(0).with_guidance_scale(-3.0);
		assert_eq!(options.steps, 1);
		assert_eq!(options.guidance_scale, 0.0);
		let options = PromptFreePredictOptions::default().with_steps(10_000).with_guidance_scale(25.0);
		assert_eq!(options.steps, 500);
		assert_eq!(options.guidance_scale, 10.0);
	}
}
