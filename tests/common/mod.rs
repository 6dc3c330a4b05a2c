#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarMap};
use prompt_free_diffusion::{ContextEncoder, ControlAdapter, Diffuser, PreprocessMethod, PromptFreeNetwork, WeightRegistry};

pub const CTX_NAMES: [&str; 2] = ["ctx.proj.weight", "ctx.norm.weight"];
pub const DIFFUSER_NAMES: [&str; 2] = ["diffuser.image.context_blocks.0.attn.weight", "diffuser.unet.conv_in.weight"];
pub const CONTROL_NAMES: [&str; 2] = ["input_hint.weight", "zero_convs.0.weight"];

/// A tiny stand-in for the composite network: real parameter stores with the real partition
/// naming, trivial numerics.
pub struct ToyNetwork {
	device: Device,
	vars: VarMap,
	control_vars: VarMap,
	pub saw_control: Cell<bool>
}

impl ToyNetwork {
	pub fn new() -> Self {
		let device = Device::Cpu;
		let vars = VarMap::new();
		for name in CTX_NAMES.iter().chain(DIFFUSER_NAMES.iter()) {
			vars.get((2, 2), name, Init::Const(0.), DType::F32, &device).unwrap();
		}
		let control_vars = VarMap::new();
		for name in CONTROL_NAMES {
			control_vars.get((2, 2), name, Init::Const(0.), DType::F32, &device).unwrap();
		}
		Self {
			device,
			vars,
			control_vars,
			saw_control: Cell::new(false)
		}
	}
}

impl PromptFreeNetwork for ToyNetwork {
	fn device(&self) -> &Device {
		&self.device
	}

	fn dtype(&self) -> DType {
		DType::F32
	}

	fn vars(&self) -> &VarMap {
		&self.vars
	}

	fn control_vars(&self) -> &VarMap {
		&self.control_vars
	}

	fn encode_context(&self, image: &Tensor) -> candle_core::Result<Tensor> {
		let mean = image.mean_all()?.to_scalar::<f32>()?;
		Tensor::full(mean + 1., (1, 4, 8), &self.device)
	}

	fn predict_noise(&self, latents: &Tensor, _timestep: usize, context: &Tensor, control: Option<&Tensor>) -> candle_core::Result<Tensor> {
		let mut bias = context.mean_all()?.to_scalar::<f32>()? as f64 * 0.05;
		if let Some(control) = control {
			self.saw_control.set(true);
			bias += control.mean_all()?.to_scalar::<f32>()? as f64 * 0.01;
		}
		latents.affine(0.95, bias)
	}

	fn preprocess_control(&self, control: &Tensor, _method: PreprocessMethod, _height: usize, _width: usize) -> candle_core::Result<Tensor> {
		control * 0.5
	}

	fn decode_latents(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
		latents.narrow(1, 0, 3)?.affine(0.5, 0.5)
	}
}

/// Reads one partition of a variable store as plain buffers for comparison.
pub fn partition_values(vars: &VarMap, prefix: &str) -> HashMap<String, Vec<f32>> {
	vars.data()
		.lock()
		.unwrap()
		.iter()
		.filter(|(name, _)| name.starts_with(prefix))
		.map(|(name, var)| (name.clone(), var.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
		.collect()
}

/// Writes a weight subset where every named tensor is filled with `value`.
pub fn write_subset(path: &Path, names: &[&str], value: f32) {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).unwrap();
	}
	let tensors: HashMap<String, Tensor> = names
		.iter()
		.map(|name| (name.to_string(), Tensor::full(value, (2, 2), &Device::Cpu).unwrap()))
		.collect();
	candle_core::safetensors::save(&tensors, path).unwrap();
}

/// Populates `root` with a full set of toy weight files at the registry's built-in paths, each
/// family member filled with a distinct value.
pub fn seed_weights(root: &Path) -> WeightRegistry {
	let registry = WeightRegistry::new(root);
	for (i, tag) in ContextEncoder::ALL.iter().enumerate() {
		write_subset(&registry.context_encoder(*tag), &CTX_NAMES, 1. + i as f32);
	}
	for (i, tag) in Diffuser::ALL.iter().enumerate() {
		write_subset(&registry.diffuser(*tag), &DIFFUSER_NAMES, 10. + i as f32);
	}
	for (i, tag) in ControlAdapter::ALL.iter().enumerate() {
		if let Some(path) = registry.control_adapter(*tag) {
			write_subset(&path, &CONTROL_NAMES, 20. + i as f32);
		}
	}
	registry
}
