//! The weight registry maps human-readable model tags to the pretrained weight files that back
//! them. Three independent families exist: context encoders, diffusion backbones, and control
//! adapters. Each family can be swapped into a live pipeline independently of the others; see
//! [`crate::PromptFreePipeline`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WeightManifest;

/// A tag was requested that is not part of its family's enumeration.
///
/// In normal operation this cannot happen, since tags are constrained to their enumerations at
/// the API boundary; it surfaces when parsing tags from free-form strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {family} tag `{tag}`")]
pub struct UnknownTag {
	/// The family the tag was looked up in.
	pub family: &'static str,
	/// The offending tag.
	pub tag: String
}

/// A pretrained context encoder, producing the image-derived embedding that conditions
/// generation in place of a text prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ContextEncoder {
	/// The general-purpose SeeCoder encoder.
	#[serde(rename = "SeeCoder")]
	SeeCoder,
	/// SeeCoder with positional awareness.
	#[serde(rename = "SeeCoder-PA")]
	SeeCoderPA,
	/// SeeCoder finetuned on anime-style imagery. This encoder was trained against a non-zero
	/// unconditional prior, so it carries a precomputed unconditional embedding asset.
	#[serde(rename = "SeeCoder-Anime")]
	SeeCoderAnime
}

impl ContextEncoder {
	/// All context encoder tags, in registry order.
	pub const ALL: [ContextEncoder; 3] = [ContextEncoder::SeeCoder, ContextEncoder::SeeCoderPA, ContextEncoder::SeeCoderAnime];

	/// The tag string, exactly as it appears at the API boundary.
	pub fn name(&self) -> &'static str {
		match self {
			ContextEncoder::SeeCoder => "SeeCoder",
			ContextEncoder::SeeCoderPA => "SeeCoder-PA",
			ContextEncoder::SeeCoderAnime => "SeeCoder-Anime"
		}
	}

	/// Whether this encoder requires the precomputed unconditional embedding asset instead of a
	/// zero unconditional baseline.
	pub fn requires_uncond_asset(&self) -> bool {
		matches!(self, ContextEncoder::SeeCoderAnime)
	}

	pub(crate) fn weights_file(&self) -> &'static str {
		match self {
			ContextEncoder::SeeCoder => "pretrained/pfd/seecoder/seecoder-v1-0.safetensors",
			ContextEncoder::SeeCoderPA => "pretrained/pfd/seecoder/seecoder-pa-v1-0.safetensors",
			ContextEncoder::SeeCoderAnime => "pretrained/pfd/seecoder/seecoder-anime-v1-0.safetensors"
		}
	}
}

/// A pretrained diffusion backbone, defining the generative style of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Diffuser {
	/// Stable Diffusion v1.5.
	#[serde(rename = "SD-v1.5")]
	SdV1_5,
	/// OpenJourney v4.
	#[serde(rename = "OpenJouney-v4")]
	OpenJourneyV4,
	/// Deliberate v2.0.
	#[serde(rename = "Deliberate-v2.0")]
	DeliberateV2,
	/// Realistic Vision v2.0.
	#[serde(rename = "RealisticVision-v2.0")]
	RealisticVisionV2,
	/// Anything v4.
	#[serde(rename = "Anything-v4")]
	AnythingV4,
	/// AbyssOrangeMix v3.
	#[serde(rename = "Oam-v3")]
	OamV3,
	/// AbyssOrangeMix v2.
	#[serde(rename = "Oam-v2")]
	OamV2
}

impl Diffuser {
	/// All diffuser tags, in registry order.
	pub const ALL: [Diffuser; 7] = [
		Diffuser::SdV1_5,
		Diffuser::OpenJourneyV4,
		Diffuser::DeliberateV2,
		Diffuser::RealisticVisionV2,
		Diffuser::AnythingV4,
		Diffuser::OamV3,
		Diffuser::OamV2
	];

	/// The tag string, exactly as it appears at the API boundary.
	pub fn name(&self) -> &'static str {
		match self {
			Diffuser::SdV1_5 => "SD-v1.5",
			Diffuser::OpenJourneyV4 => "OpenJouney-v4",
			Diffuser::DeliberateV2 => "Deliberate-v2.0",
			Diffuser::RealisticVisionV2 => "RealisticVision-v2.0",
			Diffuser::AnythingV4 => "Anything-v4",
			Diffuser::OamV3 => "Oam-v3",
			Diffuser::OamV2 => "Oam-v2"
		}
	}

	pub(crate) fn weights_file(&self) -> &'static str {
		match self {
			Diffuser::SdV1_5 => "pretrained/pfd/diffuser/SD-v1-5.safetensors",
			Diffuser::OpenJourneyV4 => "pretrained/pfd/diffuser/OpenJouney-v4.safetensors",
			Diffuser::DeliberateV2 => "pretrained/pfd/diffuser/Deliberate-v2-0.safetensors",
			Diffuser::RealisticVisionV2 => "pretrained/pfd/diffuser/RealisticVision-v2-0.safetensors",
			Diffuser::AnythingV4 => "pretrained/pfd/diffuser/Anything-v4.safetensors",
			Diffuser::OamV3 => "pretrained/pfd/diffuser/AbyssOrangeMix-v3.safetensors",
			Diffuser::OamV2 => "pretrained/pfd/diffuser/AbyssOrangeMix-v2.safetensors"
		}
	}
}

/// A preprocessing method used to derive a control signal from a raw photo (edge detection,
/// depth estimation, pose estimation, ...). The transforms themselves live in the model zoo;
/// this enum only selects one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessMethod {
	/// Canny edge detection.
	Canny,
	/// Monocular depth estimation.
	Depth,
	/// HED soft-edge detection.
	Hed,
	/// M-LSD straight-line detection.
	Mlsd,
	/// Surface normal estimation.
	Normal,
	/// OpenPose body pose estimation.
	Openpose,
	/// OpenPose body and face pose estimation.
	OpenposeWithface,
	/// OpenPose body, face and hand pose estimation.
	OpenposeWithfacehand,
	/// Scribble-style edge extraction.
	Scribble,
	/// The control image is used as-is, without preprocessing.
	None
}

impl PreprocessMethod {
	/// All preprocessing methods.
	pub const ALL: [PreprocessMethod; 10] = [
		PreprocessMethod::Canny,
		PreprocessMethod::Depth,
		PreprocessMethod::Hed,
		PreprocessMethod::Mlsd,
		PreprocessMethod::Normal,
		PreprocessMethod::Openpose,
		PreprocessMethod::OpenposeWithface,
		PreprocessMethod::OpenposeWithfacehand,
		PreprocessMethod::Scribble,
		PreprocessMethod::None
	];

	/// The method name, exactly as it appears at the API boundary.
	pub fn name(&self) -> &'static str {
		match self {
			PreprocessMethod::Canny => "canny",
			PreprocessMethod::Depth => "depth",
			PreprocessMethod::Hed => "hed",
			PreprocessMethod::Mlsd => "mlsd",
			PreprocessMethod::Normal => "normal",
			PreprocessMethod::Openpose => "openpose",
			PreprocessMethod::OpenposeWithface => "openpose_withface",
			PreprocessMethod::OpenposeWithfacehand => "openpose_withfacehand",
			PreprocessMethod::Scribble => "scribble",
			PreprocessMethod::None => "none"
		}
	}
}

/// A pretrained control adapter, injecting spatial structure (edges, depth, pose, ...) into the
/// generation process.
///
/// Several tags share one preprocessing method; e.g. [`ControlAdapter::Canny`] and
/// [`ControlAdapter::CannyV11p`] are two trainings of the same conditioning type. The sentinel
/// [`ControlAdapter::None`] disables control conditioning entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAdapter {
	/// Canny edge conditioning (SD 1.5 training).
	Canny,
	/// Canny edge conditioning (ControlNet v1.1 training).
	CannyV11p,
	/// Depth map conditioning.
	Depth,
	/// HED soft-edge conditioning (SD 1.5 training).
	Hed,
	/// Soft-edge conditioning (ControlNet v1.1 training).
	SoftedgeV11p,
	/// Straight-line conditioning (SD 1.5 training).
	Mlsd,
	/// Straight-line conditioning (ControlNet v1.1 training).
	MlsdV11p,
	/// Surface normal conditioning.
	Normal,
	/// Pose skeleton conditioning (SD 1.5 training).
	Openpose,
	/// Pose skeleton conditioning (ControlNet v1.1 training).
	OpenposeV11p,
	/// Scribble conditioning.
	Scribble,
	/// Segmentation map conditioning.
	Seg,
	/// Line art conditioning.
	LineartV11p,
	/// Anime-style line art conditioning.
	LineartAnimeV11p,
	/// No control conditioning.
	None
}

impl ControlAdapter {
	/// All control adapter tags, in registry order.
	pub const ALL: [ControlAdapter; 15] = [
		ControlAdapter::Canny,
		ControlAdapter::CannyV11p,
		ControlAdapter::Depth,
		ControlAdapter::Hed,
		ControlAdapter::SoftedgeV11p,
		ControlAdapter::Mlsd,
		ControlAdapter::MlsdV11p,
		ControlAdapter::Normal,
		ControlAdapter::Openpose,
		ControlAdapter::OpenposeV11p,
		ControlAdapter::Scribble,
		ControlAdapter::Seg,
		ControlAdapter::LineartV11p,
		ControlAdapter::LineartAnimeV11p,
		ControlAdapter::None
	];

	/// The tag string, exactly as it appears at the API boundary.
	pub fn name(&self) -> &'static str {
		match self {
			ControlAdapter::Canny => "canny",
			ControlAdapter::CannyV11p => "canny_v11p",
			ControlAdapter::Depth => "depth",
			ControlAdapter::Hed => "hed",
			ControlAdapter::SoftedgeV11p => "softedge_v11p",
			ControlAdapter::Mlsd => "mlsd",
			ControlAdapter::MlsdV11p => "mlsd_v11p",
			ControlAdapter::Normal => "normal",
			ControlAdapter::Openpose => "openpose",
			ControlAdapter::OpenposeV11p => "openpose_v11p",
			ControlAdapter::Scribble => "scribble",
			ControlAdapter::Seg => "seg",
			ControlAdapter::LineartV11p => "lineart_v11p",
			ControlAdapter::LineartAnimeV11p => "lineart_anime_v11p",
			ControlAdapter::None => "none"
		}
	}

	/// The preprocessing method associated with this adapter.
	///
	/// `Seg` and the lineart adapters expect an already-annotated control image and map to
	/// [`PreprocessMethod::None`].
	pub fn method(&self) -> PreprocessMethod {
		match self {
			ControlAdapter::Canny | ControlAdapter::CannyV11p => PreprocessMethod::Canny,
			ControlAdapter::Depth => PreprocessMethod::Depth,
			ControlAdapter::Hed | ControlAdapter::SoftedgeV11p => PreprocessMethod::Hed,
			ControlAdapter::Mlsd | ControlAdapter::MlsdV11p => PreprocessMethod::Mlsd,
			ControlAdapter::Normal => PreprocessMethod::Normal,
			ControlAdapter::Openpose | ControlAdapter::OpenposeV11p => PreprocessMethod::Openpose,
			ControlAdapter::Scribble => PreprocessMethod::Scribble,
			ControlAdapter::Seg | ControlAdapter::LineartV11p | ControlAdapter::LineartAnimeV11p | ControlAdapter::None => PreprocessMethod::None
		}
	}

	pub(crate) fn weights_file(&self) -> Option<&'static str> {
		match self {
			ControlAdapter::Canny => Some("pretrained/controlnet/control_sd15_canny_slimmed.safetensors"),
			ControlAdapter::CannyV11p => Some("pretrained/controlnet/control_v11p_sd15_canny_slimmed.safetensors"),
			ControlAdapter::Depth => Some("pretrained/controlnet/control_sd15_depth_slimmed.safetensors"),
			ControlAdapter::Hed => Some("pretrained/controlnet/control_sd15_hed_slimmed.safetensors"),
			ControlAdapter::SoftedgeV11p => Some("pretrained/controlnet/control_v11p_sd15_softedge_slimmed.safetensors"),
			ControlAdapter::Mlsd => Some("pretrained/controlnet/control_sd15_mlsd_slimmed.safetensors"),
			ControlAdapter::MlsdV11p => Some("pretrained/controlnet/control_v11p_sd15_mlsd_slimmed.safetensors"),
			ControlAdapter::Normal => Some("pretrained/controlnet/control_sd15_normal_slimmed.safetensors"),
			ControlAdapter::Openpose => Some("pretrained/controlnet/control_sd15_openpose_slimmed.safetensors"),
			ControlAdapter::OpenposeV11p => Some("pretrained/controlnet/control_v11p_sd15_openpose_slimmed.safetensors"),
			ControlAdapter::Scribble => Some("pretrained/controlnet/control_sd15_scribble_slimmed.safetensors"),
			ControlAdapter::Seg => Some("pretrained/controlnet/control_sd15_seg_slimmed.safetensors"),
			ControlAdapter::LineartV11p => Some("pretrained/controlnet/control_v11p_sd15_lineart_slimmed.safetensors"),
			ControlAdapter::LineartAnimeV11p => Some("pretrained/controlnet/control_v11p_sd15s2_lineart_anime_slimmed.safetensors"),
			ControlAdapter::None => None
		}
	}
}

macro_rules! tag_strings {
	($($t:ty => $family:literal),*) => {
		$(
			impl fmt::Display for $t {
				fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
					f.write_str(self.name())
				}
			}

			impl FromStr for $t {
				type Err = UnknownTag;

				fn from_str(s: &str) -> Result<Self, Self::Err> {
					Self::ALL
						.iter()
						.find(|t| t.name() == s)
						.copied()
						.ok_or_else(|| UnknownTag { family: $family, tag: s.to_string() })
				}
			}
		)*
	};
}

tag_strings! {
	ContextEncoder => "context encoder",
	Diffuser => "diffuser",
	PreprocessMethod => "preprocess method",
	ControlAdapter => "control adapter"
}

/// Resolves model tags to on-disk weight files.
///
/// The registry joins a root directory with the well-known relative path of each pretrained
/// weight subset. Individual paths can be redirected with a [`WeightManifest`]; see
/// [`WeightRegistry::with_manifest`].
#[derive(Debug, Clone)]
pub struct WeightRegistry {
	root: PathBuf,
	manifest: WeightManifest
}

impl WeightRegistry {
	/// Creates a registry resolving weight files under `root`.
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into(), manifest: WeightManifest::default() }
	}

	/// Creates a registry whose built-in paths are selectively overridden by `manifest`.
	/// Override paths are also resolved relative to `root` unless absolute.
	pub fn with_manifest(root: impl Into<PathBuf>, manifest: WeightManifest) -> Self {
		Self { root: root.into(), manifest }
	}

	/// The weight file backing a context encoder tag.
	pub fn context_encoder(&self, tag: ContextEncoder) -> PathBuf {
		match self.manifest.context_encoders.get(&tag) {
			Some(path) => self.root.join(path),
			None => self.root.join(tag.weights_file())
		}
	}

	/// The weight file backing a diffuser tag.
	pub fn diffuser(&self, tag: Diffuser) -> PathBuf {
		match self.manifest.diffusers.get(&tag) {
			Some(path) => self.root.join(path),
			None => self.root.join(tag.weights_file())
		}
	}

	/// The weight file backing a control adapter tag, or `None` for [`ControlAdapter::None`].
	pub fn control_adapter(&self, tag: ControlAdapter) -> Option<PathBuf> {
		match self.manifest.control_adapters.get(&tag) {
			Some(path) => Some(self.root.join(path)),
			None => tag.weights_file().map(|f| self.root.join(f))
		}
	}

	/// The precomputed unconditional embedding asset for `tag`, if that encoder requires one.
	pub fn uncond_embedding(&self, tag: ContextEncoder) -> Option<PathBuf> {
		if !tag.requires_uncond_asset() {
			return None;
		}
		match self.manifest.uncond_embeddings.get(&tag) {
			Some(path) => Some(self.root.join(path)),
			None => Some(self.root.join("assets/anime_ug.pth"))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tag_names_round_trip() {
		for tag in ContextEncoder::ALL {
			assert_eq!(tag.name().parse::<ContextEncoder>().unwrap(), tag);
		}
		for tag in Diffuser::ALL {
			assert_eq!(tag.name().parse::<Diffuser>().unwrap(), tag);
		}
		for tag in ControlAdapter::ALL {
			assert_eq!(tag.name().parse::<ControlAdapter>().unwrap(), tag);
		}
		for method in PreprocessMethod::ALL {
			assert_eq!(method.name().parse::<PreprocessMethod>().unwrap(), method);
		}
	}

	#[test]
	fn unknown_tags_are_rejected() {
		let err = "SeeCoder-XL".parse::<ContextEncoder>().unwrap_err();
		assert_eq!(err.family, "context encoder");
		assert_eq!(err.tag, "SeeCoder-XL");
		assert!("".parse::<Diffuser>().is_err());
		assert!("Canny".parse::<ControlAdapter>().is_err(), "tags are case-sensitive");
	}

	#[test]
	fn serde_names_match_boundary_names() {
		assert_eq!(serde_json::to_string(&Diffuser::SdV1_5).unwrap(), "\"SD-v1.5\"");
		assert_eq!(serde_json::from_str::<ControlAdapter>("\"lineart_anime_v11p\"").unwrap(), ControlAdapter::LineartAnimeV11p);
		assert_eq!(serde_json::from_str::<PreprocessMethod>("\"openpose_withfacehand\"").unwrap(), PreprocessMethod::OpenposeWithfacehand);
	}

	#[test]
	fn adapters_share_preprocess_methods() {
		assert_eq!(ControlAdapter::Canny.method(), PreprocessMethod::Canny);
		assert_eq!(ControlAdapter::CannyV11p.method(), PreprocessMethod::Canny);
		assert_eq!(ControlAdapter::SoftedgeV11p.method(), PreprocessMethod::Hed);
		assert_eq!(ControlAdapter::Seg.method(), PreprocessMethod::None);
		assert_eq!(ControlAdapter::LineartAnimeV11p.method(), PreprocessMethod::None);
	}

	#[test]
	fn registry_resolves_paths() {
		let registry = WeightRegistry::new("/models");
		assert_eq!(
			registry.context_encoder(ContextEncoder::SeeCoder),
			PathBuf::from("/models/pretrained/pfd/seecoder/seecoder-v1-0.safetensors")
		);
		assert_eq!(registry.control_adapter(ControlAdapter::None), None);
		assert!(registry.control_adapter(ControlAdapter::Scribble).is_some());
		assert_eq!(registry.uncond_embedding(ContextEncoder::SeeCoder), None);
		assert_eq!(registry.uncond_embedding(ContextEncoder::SeeCoderAnime), Some(PathBuf::from("/models/assets/anime_ug.pth")));
	}
}
