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

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::registry::{ContextEncoder, ControlAdapter, Diffuser};

mod conditioning;
mod impl_main;
mod impl_predict;

pub use self::conditioning::{autoset_dimensions, Conditioning};
pub use self::impl_main::PromptFreePipeline;
pub use self::impl_predict::{PromptFreePredictOptions, ResolvedSeeds};

/// The weight-subset selection resident in a [`PromptFreePipeline`]: one tag per family.
///
/// A pipeline compares its resident configuration against a request's desired configuration and
/// reloads only the families whose tags changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActiveConfiguration {
	/// The resident context encoder.
	pub context_encoder: ContextEncoder,
	/// The resident diffusion backbone.
	pub diffuser: Diffuser,
	/// The resident control adapter.
	pub control_adapter: ControlAdapter
}

impl Default for ActiveConfiguration {
	fn default() -> Self {
		Self {
			context_encoder: ContextEncoder::SeeCoder,
			diffuser: Diffuser::DeliberateV2,
			control_adapter: ControlAdapter::Canny
		}
	}
}

/// Describes a function to be called on each step of the pipeline.
pub enum PromptFreeCallback {
	/// A simple callback to be used for e.g. reporting progress updates.
	Progress {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (usize): This step's timestep.
		cb: Box<dyn Fn(usize, usize) -> bool>
	}
}

impl Debug for PromptFreeCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<PromptFreeCallback>")
	}
}
