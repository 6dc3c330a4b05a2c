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

//! Selective loading of pretrained weight subsets into a resident composite model.
//!
//! The composite network holds three disjoint parameter partitions (context encoder, diffuser,
//! control adapter). [`install_partition`] replaces exactly one partition — identified by its
//! reserved name prefix — while leaving the others byte-identical, so a pipeline can hot-swap
//! e.g. the diffuser without reloading the context encoder.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{pickle, safetensors, Device, Tensor};
use candle_nn::VarMap;
use thiserror::Error;
use tracing::debug;

/// Name branch modern image-conditioned checkpoints store their cross-attention context
/// parameters under.
const IMAGE_CONTEXT_BRANCH: &str = "diffuser.image.context_blocks.";
/// Name branch used by legacy text-conditioned checkpoints for the same parameters.
const TEXT_CONTEXT_BRANCH: &str = "diffuser.text.context_blocks.";

/// An error raised while loading a weight subset.
#[derive(Debug, Error)]
pub enum WeightLoadError {
	/// The weight file's extension matches none of the supported serialization formats.
	#[error("unsupported weight file extension `{0}`; expected .ckpt, .pth or .safetensors")]
	UnsupportedFileExtension(String),
	/// After merging, the parameter-name set does not exactly match the resident model's. This
	/// indicates an incompatible checkpoint (or a partition-prefix bug) and aborts the load; the
	/// resident parameters are left unmodified.
	#[error("{family} checkpoint is incompatible with the resident model: {} missing, {} unexpected parameter name(s)", missing.len(), unexpected.len())]
	StateMismatch {
		/// The weight family being installed.
		family: &'static str,
		/// Resident parameter names absent from the merged mapping.
		missing: Vec<String>,
		/// Merged parameter names the resident model does not have.
		unexpected: Vec<String>
	},
	/// An incoming tensor's shape or dtype differs from the resident parameter it replaces. The
	/// install aborts before the first write; the resident parameters are left unmodified.
	#[error("{family} checkpoint parameter `{name}` is {got}, expected {expected}")]
	TensorMismatch {
		/// The weight family being installed.
		family: &'static str,
		/// The offending parameter name.
		name: String,
		/// The resident parameter's shape and dtype.
		expected: String,
		/// The incoming tensor's shape and dtype.
		got: String
	},
	/// An underlying tensor-framework error (I/O, decode, shape or dtype mismatch).
	#[error(transparent)]
	Tensor(#[from] candle_core::Error)
}

/// A supported weight-file serialization format, selected purely by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
	/// Legacy training checkpoint (`.ckpt`); parameters live under a nested `state_dict` key.
	LegacyCheckpoint,
	/// Legacy flat parameter archive (`.pth`).
	LegacyFlat,
	/// Flat safetensors archive (`.safetensors`), loaded directly onto host memory.
	Safetensors
}

impl WeightFormat {
	/// Determines the serialization format of `path` from its extension.
	pub fn from_path(path: &Path) -> Result<Self, WeightLoadError> {
		let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
		match extension {
			"ckpt" => Ok(WeightFormat::LegacyCheckpoint),
			"pth" => Ok(WeightFormat::LegacyFlat),
			"safetensors" => Ok(WeightFormat::Safetensors),
			other => Err(WeightLoadError::UnsupportedFileExtension(other.to_string()))
		}
	}
}

/// Loads a serialized parameter mapping from `path`, decoding per [`WeightFormat`].
pub fn load_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>, WeightLoadError> {
	let weights = match WeightFormat::from_path(path)? {
		WeightFormat::LegacyCheckpoint => pickle::read_all_with_key(path, Some("state_dict"))?
			.into_iter()
			.map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
			.collect::<candle_core::Result<HashMap<_, _>>>()?,
		WeightFormat::LegacyFlat => pickle::read_all(path)?
			.into_iter()
			.map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
			.collect::<candle_core::Result<HashMap<_, _>>>()?,
		WeightFormat::Safetensors => safetensors::load(path, device)?
	};
	debug!("loaded {} tensors from {}", weights.len(), path.display());
	Ok(weights)
}

/// Renames legacy text-conditioning cross-attention parameters onto the image-conditioning
/// branch the composite model expects.
///
/// Older diffuser checkpoints were serialized before the image-context branch existed; when no
/// parameter matches the image branch, matching text-branch names are renamed. This is a
/// compatibility shim for those checkpoints, not a general rename mechanism — checkpoints that
/// already carry image-branch parameters pass through untouched.
pub(crate) fn adapt_legacy_context_blocks(weights: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
	if weights.keys().any(|name| name.starts_with(IMAGE_CONTEXT_BRANCH)) {
		return weights;
	}
	weights
		.into_iter()
		.map(|(name, tensor)| match name.strip_prefix(TEXT_CONTEXT_BRANCH) {
			Some(rest) => (format!("{IMAGE_CONTEXT_BRANCH}{rest}"), tensor),
			None => (name, tensor)
		})
		.collect()
}

/// Replaces the parameter partition identified by `prefix` with `incoming`, leaving all other
/// partitions untouched.
///
/// `incoming`, together with the resident parameters outside `prefix`, must cover the resident
/// parameter-name set exactly, one-to-one, and every incoming tensor must match its resident
/// counterpart's shape and dtype; otherwise the install fails ([`WeightLoadError::StateMismatch`]
/// or [`WeightLoadError::TensorMismatch`]) without modifying the model. Only the target partition
/// is written — the kept parameters are already resident and never rewritten.
pub fn install_partition(vars: &VarMap, family: &'static str, prefix: &str, incoming: HashMap<String, Tensor>) -> Result<(), WeightLoadError> {
	let resident = vars.data().lock().expect("poisoned parameter store");

	// stray incoming entries outside the target partition lose to the resident parameters
	let mut missing: Vec<String> = resident
		.keys()
		.filter(|name| name.starts_with(prefix) && !incoming.contains_key(*name))
		.cloned()
		.collect();
	let mut unexpected: Vec<String> = incoming.keys().filter(|name| !resident.contains_key(*name)).cloned().collect();
	if !missing.is_empty() || !unexpected.is_empty() {
		missing.sort();
		unexpected.sort();
		return Err(WeightLoadError::StateMismatch { family, missing, unexpected });
	}

	// reject shape and dtype drift before the first write, so a failed install never leaves the
	// partition half-replaced
	for (name, tensor) in &incoming {
		if !name.starts_with(prefix) {
			continue;
		}
		let var = &resident[name];
		if var.shape() != tensor.shape() || var.dtype() != tensor.dtype() {
			return Err(WeightLoadError::TensorMismatch {
				family,
				name: name.clone(),
				expected: format!("{:?}/{:?}", var.shape(), var.dtype()),
				got: format!("{:?}/{:?}", tensor.shape(), tensor.dtype())
			});
		}
	}

	for (name, tensor) in &incoming {
		if name.starts_with(prefix) {
			resident[name].set(tensor)?;
		}
	}
	Ok(())
}

/// Replaces an architecturally isolated variable store in its entirety.
///
/// Used for the control adapter, which shares no parameter names with the other families and is
/// loaded onto its own sub-module rather than merged by prefix filtering.
pub fn install_all(vars: &VarMap, family: &'static str, incoming: HashMap<String, Tensor>) -> Result<(), WeightLoadError> {
	// the empty prefix keeps no resident entries, so the incoming map must match exactly
	install_partition(vars, family, "", incoming)
}
