use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use super::PromptFreePipeline;
use crate::loader;
use crate::network::PromptFreeNetwork;
use crate::registry::{ControlAdapter, PreprocessMethod};

/// The tensors a sampling run needs, derived fresh per request from the resident network state.
///
/// Never cached across requests: a weight swap in between would silently invalidate them.
#[derive(Debug, Clone)]
pub struct Conditioning {
	/// The `[n, seq, dim]` image-context embedding.
	pub context: Tensor,
	/// The unconditional baseline embedding used for classifier-free guidance, shaped like
	/// [`Conditioning::context`].
	pub uncond: Tensor,
	/// The `[n, 3, h, w]` control signal, absent when the resident control adapter is
	/// [`ControlAdapter::None`].
	pub control: Option<Tensor>
}

/// Rounds a requested dimension down to a multiple of 64, clamped into `[512, 1536]`.
pub(crate) fn snap_dimension(dimension: u32) -> u32 {
	(dimension / 64 * 64).clamp(512, 1536)
}

/// Derives output `(width, height)` from the control image's own dimensions, snapped per
/// [`PromptFreePredictOptions::with_size`]; `(512, 512)` when there is no control image.
///
/// [`PromptFreePredictOptions::with_size`]: super::PromptFreePredictOptions::with_size
pub fn autoset_dimensions(control: Option<&DynamicImage>) -> (u32, u32) {
	match control {
		Some(image) => {
			let (width, height) = image.dimensions();
			(snap_dimension(width), snap_dimension(height))
		}
		None => (512, 512)
	}
}

/// Converts an image to a normalized `[1, 3, h, w]` tensor with values in `[0, 1]`.
pub(crate) fn image_to_tensor(image: &DynamicImage, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
	let image = image.to_rgb32f();
	let (width, height) = image.dimensions();
	Tensor::from_vec(image.into_raw(), (height as usize, width as usize, 3), device)?
		.permute((2, 0, 1))?
		.unsqueeze(0)?
		.to_dtype(dtype)
}

/// Loads the precomputed unconditional embedding asset as a `[1, seq, dim]` tensor.
fn load_uncond_asset(path: &std::path::Path, device: &Device, dtype: DType) -> anyhow::Result<Tensor> {
	let mut weights = loader::load_weights(path, device)?;
	let Some(key) = weights.keys().next().cloned() else {
		anyhow::bail!("unconditional embedding asset {} holds no tensors", path.display());
	};
	let asset = weights.remove(&key).unwrap_or_else(|| unreachable!());
	let asset = match asset.rank() {
		2 => asset.unsqueeze(0)?,
		_ => asset
	};
	Ok(asset.to_dtype(dtype)?)
}

impl<N: PromptFreeNetwork> PromptFreePipeline<N> {
	/// Assembles the conditioning tensors for one request against the resident network state.
	///
	/// `preprocess` selects an optional transform deriving the control signal from a raw photo;
	/// pass `None` when the control image is already annotated (edge map, pose skeleton, ...).
	pub fn assemble_conditioning(
		&self,
		image: &DynamicImage,
		control_image: Option<&DynamicImage>,
		preprocess: Option<PreprocessMethod>,
		width: u32,
		height: u32,
		samples: usize
	) -> anyhow::Result<Conditioning> {
		let device = self.network.device();
		let dtype = self.network.dtype();

		let source = image_to_tensor(image, device, dtype)?;
		let mut context = self.network.encode_context(&source)?;
		if samples > 1 {
			context = context.repeat((samples, 1, 1))?;
		}

		// most encoders were trained against a zero unconditional prior; the flagged one ships
		// a fixed embedding that gets zero-padded up to the context's sequence length
		let uncond = match self.registry.uncond_embedding(self.tag_context) {
			Some(asset_path) => {
				let asset = load_uncond_asset(&asset_path, device, dtype)?;
				let (_, asset_len, dim) = asset.dims3()?;
				let target_len = context.dim(1)?;
				let padded = if asset_len < target_len {
					let pad = Tensor::zeros((1, target_len - asset_len, dim), dtype, device)?;
					Tensor::cat(&[&asset, &pad], 1)?
				} else {
					asset
				};
				if samples > 1 { padded.repeat((samples, 1, 1))? } else { padded }
			}
			None => context.zeros_like()?
		};

		let control = if self.tag_control != ControlAdapter::None {
			let Some(control_image) = control_image else {
				anyhow::bail!("control adapter `{}` requires a control image", self.tag_control);
			};
			let resized = control_image.resize_exact(width, height, FilterType::CatmullRom);
			let mut signal = image_to_tensor(&resized, device, dtype)?;
			if let Some(method) = preprocess {
				signal = self.network.preprocess_control(&signal, method, height as usize, width as usize)?.to_dtype(dtype)?;
			}
			if samples > 1 {
				signal = signal.repeat((samples, 1, 1, 1))?;
			}
			Some(signal)
		} else {
			None
		};

		Ok(Conditioning { context, uncond, control })
	}
}
