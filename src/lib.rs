//! `prompt-free-diffusion` runs a pretrained multi-modal image diffusion pipeline in which
//! generation is conditioned on an *image* — encoded by a pretrained context encoder — instead
//! of a text prompt, optionally steered by a spatial control signal (edges, depth, pose, ...).
//!
//! The three pretrained weight families backing the composite network (context encoders,
//! diffusion backbones, control adapters) are independently versioned; a pipeline keeps one
//! subset per family resident and hot-swaps only the families a request changes, without ever
//! rebuilding the network:
//!
//! ```ignore
//! use prompt_free_diffusion::{
//! 	ActiveConfiguration, ContextEncoder, ControlAdapter, Diffuser, PromptFreePipeline,
//! 	PromptFreePredictOptions, WeightRegistry
//! };
//!
//! let registry = WeightRegistry::new("./weights/");
//! let mut pipeline = PromptFreePipeline::new(network, registry, ActiveConfiguration::default())?;
//!
//! let imgs = PromptFreePredictOptions::default()
//! 	.with_context_encoder(ContextEncoder::SeeCoder)
//! 	.with_diffuser(Diffuser::SdV1_5)
//! 	.with_control_adapter(ControlAdapter::Canny)
//! 	.with_seed(42)
//! 	.run(&mut pipeline, &image, Some(&control))?;
//! imgs[0].clone().into_rgb8().save("result.png")?;
//! ```
//!
//! The network architecture and the sampler numerics are external, pretrained components
//! ([`candle`] and its model zoo); this crate provides the orchestration around them — weight
//! registry, selective state loading, conditioning assembly and the prediction loop. See
//! [`PromptFreeNetwork`] for the seam a concrete network plugs into.
//!
//! [`candle`]: https://github.com/huggingface/candle

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

mod config;
pub mod loader;
mod network;
pub mod pipelines;
mod registry;

pub use self::config::WeightManifest;
pub use self::loader::{WeightFormat, WeightLoadError};
pub use self::network::{PromptFreeNetwork, CONTEXT_PREFIX, DIFFUSER_PREFIX};
pub use self::pipelines::*;
pub use self::registry::{ContextEncoder, ControlAdapter, Diffuser, PreprocessMethod, UnknownTag, WeightRegistry};
