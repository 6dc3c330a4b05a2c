// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use candle_core::Tensor;
use image::{DynamicImage, Rgb32FImage};
use tracing::info;

use super::ActiveConfiguration;
use crate::loader;
use crate::network::{PromptFreeNetwork, CONTEXT_PREFIX, DIFFUSER_PREFIX};
use crate::registry::{ContextEncoder, ControlAdapter, Diffuser, WeightRegistry};

/// A [Prompt-Free Diffusion](https://github.com/SHI-Labs/Prompt-Free-Diffusion) pipeline.
///
/// Generation is conditioned on an input image (via a pretrained context encoder) instead of a
/// text prompt, optionally guided by a spatial control signal. The three pretrained weight
/// families backing the composite network are independently versioned; the pipeline keeps them
/// resident across predictions and swaps only the families a request changes:
///
/// ```ignore
/// use prompt_free_diffusion::{ActiveConfiguration, PromptFreePipeline, PromptFreePredictOptions, WeightRegistry};
///
/// let mut pipeline = PromptFreePipeline::new(network, WeightRegistry::new("."), ActiveConfiguration::default())?;
///
/// let imgs = PromptFreePredictOptions::default()
/// 	.with_seed(42)
/// 	.run(&mut pipeline, &image, Some(&control))?;
/// imgs[0].clone().into_rgb8().save("result.png")?;
/// ```
///
/// The pipeline is process-lifetime mutable state with no internal locking; it serves one
/// prediction at a time. Concurrent use must be serialized externally, since a weight swap
/// interleaved with another request's encode or decode would corrupt the resident state.
pub struct PromptFreePipeline<N: PromptFreeNetwork> {
	pub(crate) network: N,
	pub(crate) registry: WeightRegistry,
	pub(crate) tag_context: ContextEncoder,
	pub(crate) tag_diffuser: Diffuser,
	pub(crate) tag_control: ControlAdapter
}

impl<N: PromptFreeNetwork> PromptFreePipeline<N> {
	/// Creates a pipeline around `network`, loading the weight subsets named by `configuration`.
	///
	/// All three families are loaded eagerly so the first prediction pays no setup cost beyond
	/// any tag it changes.
	pub fn new(network: N, registry: WeightRegistry, configuration: ActiveConfiguration) -> anyhow::Result<Self> {
		let mut pipeline = Self {
			network,
			registry,
			tag_context: configuration.context_encoder,
			tag_diffuser: configuration.diffuser,
			tag_control: configuration.control_adapter
		};
		pipeline.load_context_encoder(configuration.context_encoder)?;
		pipeline.load_diffuser(configuration.diffuser)?;
		pipeline.load_control_adapter(configuration.control_adapter)?;
		Ok(pipeline)
	}

	/// The weight-subset selection currently resident in the network.
	pub fn configuration(&self) -> ActiveConfiguration {
		ActiveConfiguration {
			context_encoder: self.tag_context,
			diffuser: self.tag_diffuser,
			control_adapter: self.tag_control
		}
	}

	/// The composite network this pipeline drives.
	pub fn network(&self) -> &N {
		&self.network
	}

	/// The weight registry this pipeline resolves tags against.
	pub fn registry(&self) -> &WeightRegistry {
		&self.registry
	}

	/// Reloads every family whose resident tag differs from `configuration`. Families whose tag
	/// is unchanged are not touched, which saves a good amount of time on slower hardware.
	pub fn reconcile(&mut self, configuration: ActiveConfiguration) -> anyhow::Result<()> {
		self.replace_context_encoder(configuration.context_encoder)?;
		self.replace_diffuser(configuration.diffuser)?;
		self.replace_control_adapter(configuration.control_adapter)?;
		Ok(())
	}

	/// Replaces the resident context encoder at runtime, leaving the diffuser and control
	/// adapter partitions untouched. A no-op if `tag` is already resident.
	pub fn replace_context_encoder(&mut self, tag: ContextEncoder) -> anyhow::Result<()> {
		if tag == self.tag_context {
			return Ok(());
		}
		self.load_context_encoder(tag)
	}

	/// Replaces the resident diffusion backbone at runtime, leaving the context encoder and
	/// control adapter partitions untouched. A no-op if `tag` is already resident.
	pub fn replace_diffuser(&mut self, tag: Diffuser) -> anyhow::Result<()> {
		if tag == self.tag_diffuser {
			return Ok(());
		}
		self.load_diffuser(tag)
	}

	/// Replaces the resident control adapter at runtime. A no-op if `tag` is already resident;
	/// [`ControlAdapter::None`] loads no weights and only disables control conditioning.
	pub fn replace_control_adapter(&mut self, tag: ControlAdapter) -> anyhow::Result<()> {
		if tag == self.tag_control {
			return Ok(());
		}
		self.load_control_adapter(tag)
	}

	fn load_context_encoder(&mut self, tag: ContextEncoder) -> anyhow::Result<()> {
		let path = self.registry.context_encoder(tag);
		let weights = loader::load_weights(&path, self.network.device())?;
		loader::install_partition(self.network.vars(), "context encoder", CONTEXT_PREFIX, weights)?;
		self.tag_context = tag;
		info!("loaded context encoder `{tag}` from {}", path.display());
		Ok(())
	}

	fn load_diffuser(&mut self, tag: Diffuser) -> anyhow::Result<()> {
		let path = self.registry.diffuser(tag);
		let weights = loader::adapt_legacy_context_blocks(loader::load_weights(&path, self.network.device())?);
		loader::install_partition(self.network.vars(), "diffuser", DIFFUSER_PREFIX, weights)?;
		self.tag_diffuser = tag;
		info!("loaded diffuser `{tag}` from {}", path.display());
		Ok(())
	}

	fn load_control_adapter(&mut self, tag: ControlAdapter) -> anyhow::Result<()> {
		if let Some(path) = self.registry.control_adapter(tag) {
			let weights = loader::load_weights(&path, self.network.device())?;
			loader::install_all(self.network.control_vars(), "control adapter", weights)?;
			info!("loaded control adapter `{tag}` from {}", path.display());
		}
		self.tag_control = tag;
		Ok(())
	}

	/// Decodes a batch of latents via the network's decode path into an array of
	/// [`image::DynamicImage`]s, using float32 buffers. In most cases, you'll want to convert
	/// the images into RGB8 via `img.into_rgb8()`.
	pub fn decode_latents(&self, latents: &Tensor) -> anyhow::Result<Vec<DynamicImage>> {
		let decoded = self.network.decode_latents(latents)?.to_dtype(candle_core::DType::F32)?;
		let mut images = Vec::new();
		for i in 0..decoded.dim(0)? {
			let image = decoded.get(i)?.clamp(0f32, 1f32)?;
			let (_, height, width) = image.dims3()?;
			let buffer = image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<f32>()?;
			images.push(DynamicImage::ImageRgb32F(
				Rgb32FImage::from_raw(width as u32, height as u32, buffer).ok_or_else(|| anyhow::anyhow!("failed to construct image"))?
			));
		}
		Ok(images)
	}
}
