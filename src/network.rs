use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use crate::registry::PreprocessMethod;

/// Reserved name prefix of the context encoder parameter partition.
pub const CONTEXT_PREFIX: &str = "ctx.";
/// Reserved name prefix of the diffusion backbone parameter partition.
pub const DIFFUSER_PREFIX: &str = "diffuser.";

/// The composite prompt-free diffusion network, as consumed by the pipeline.
///
/// The network architecture itself (SeeCoder, the UNet diffuser, the control adapter, the VAE)
/// comes from a model zoo outside this crate; the pipeline only needs the operations below plus
/// access to the network's named-parameter stores so weight subsets can be hot-swapped at
/// runtime.
///
/// Implementations must uphold the partition convention: every parameter name in [`vars`] starts
/// with either [`CONTEXT_PREFIX`] or [`DIFFUSER_PREFIX`], and the control adapter lives in its
/// own isolated store ([`control_vars`]) whose names overlap with neither.
///
/// [`vars`]: PromptFreeNetwork::vars
/// [`control_vars`]: PromptFreeNetwork::control_vars
pub trait PromptFreeNetwork {
	/// The device this network computes on.
	fn device(&self) -> &Device;

	/// The floating-point type this network computes in (f16 when running half-precision).
	fn dtype(&self) -> DType;

	/// The named-parameter store holding the context encoder and diffuser partitions.
	fn vars(&self) -> &VarMap;

	/// The named-parameter store of the control adapter sub-module.
	fn control_vars(&self) -> &VarMap;

	/// Number of channels in the latent space the diffuser operates on.
	fn latent_channels(&self) -> usize {
		4
	}

	/// Encodes an `[1, 3, h, w]` image into a `[1, seq, dim]` conditioning embedding.
	fn encode_context(&self, image: &Tensor) -> candle_core::Result<Tensor>;

	/// Predicts the noise residual for `latents` at `timestep` given the context embedding and,
	/// optionally, a control signal. Batches conditional and unconditional halves together when
	/// the caller runs classifier-free guidance.
	fn predict_noise(&self, latents: &Tensor, timestep: usize, context: &Tensor, control: Option<&Tensor>) -> candle_core::Result<Tensor>;

	/// Derives a control signal from a raw `[n, 3, h, w]` photo using the given preprocessing
	/// method (edge detection, depth estimation, pose estimation, ...).
	fn preprocess_control(&self, control: &Tensor, method: PreprocessMethod, height: usize, width: usize) -> candle_core::Result<Tensor>;

	/// Decodes a batch of latents into `[n, 3, h, w]` images with values in `[0, 1]`.
	fn decode_latents(&self, latents: &Tensor) -> candle_core::Result<Tensor>;
}
