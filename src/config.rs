use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::{ContextEncoder, ControlAdapter, Diffuser};

/// Optional overrides for the built-in weight-file tables.
///
/// Deployments that relocate individual checkpoints (e.g. a finetuned diffuser outside the
/// standard `pretrained/` tree) can redirect single tags without rebuilding the registry:
///
/// ```json
/// {
/// 	"diffusers": { "SD-v1.5": "custom/sd15-pruned.safetensors" }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WeightManifest {
	/// Per-tag context encoder weight file overrides.
	pub context_encoders: HashMap<ContextEncoder, PathBuf>,
	/// Per-tag diffuser weight file overrides.
	pub diffusers: HashMap<Diffuser, PathBuf>,
	/// Per-tag control adapter weight file overrides.
	pub control_adapters: HashMap<ControlAdapter, PathBuf>,
	/// Per-tag unconditional embedding asset overrides.
	pub uncond_embeddings: HashMap<ContextEncoder, PathBuf>
}

impl WeightManifest {
	/// Reads a manifest from a JSON file.
	pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
	}
}
