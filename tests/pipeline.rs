use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use candle_core::{Device, Tensor};
use image::DynamicImage;
use prompt_free_diffusion::{
	ActiveConfiguration, ContextEncoder, ControlAdapter, PromptFreePipeline, PromptFreePredictOptions, WeightManifest, WeightRegistry
};

mod common;
use common::ToyNetwork;

fn pipeline_in(root: &std::path::Path) -> PromptFreePipeline<ToyNetwork> {
	let registry = common::seed_weights(root);
	PromptFreePipeline::new(ToyNetwork::new(), registry, ActiveConfiguration::default()).unwrap()
}

fn source_image() -> DynamicImage {
	let mut buffer = image::RgbImage::new(8, 8);
	for (x, y, pixel) in buffer.enumerate_pixels_mut() {
		*pixel = image::Rgb([(x * 32) as u8, (y * 32) as u8, 128]);
	}
	DynamicImage::ImageRgb8(buffer)
}

#[test]
fn identical_seeds_generate_identical_images() {
	let dir = tempfile::tempdir().unwrap();
	let mut pipeline = pipeline_in(dir.path());
	let image = source_image();
	let control = source_image();

	let options = PromptFreePredictOptions::default().with_seed(42).with_steps(3);
	let first = options.run(&mut pipeline, &image, Some(&control)).unwrap();
	let second = options.run(&mut pipeline, &image, Some(&control)).unwrap();
	assert_eq!(first.len(), 1);
	assert_eq!(first[0].clone().into_rgb8().into_raw(), second[0].clone().into_rgb8().into_raw());

	let other = PromptFreePredictOptions::default().with_seed(43).with_steps(3);
	let third = other.run(&mut pipeline, &image, Some(&control)).unwrap();
	assert_ne!(first[0].clone().into_rgb8().into_raw(), third[0].clone().into_rgb8().into_raw());
}

#[test]
fn disabled_control_skips_the_control_path() {
	let dir = tempfile::tempdir().unwrap();
	let mut pipeline = pipeline_in(dir.path());

	let options = PromptFreePredictOptions::default()
		.with_control_adapter(ControlAdapter::None)
		.with_seed(7)
		.with_steps(2);
	// no control image required once control conditioning is disabled
	let images = options.run(&mut pipeline, &source_image(), None).unwrap();
	assert_eq!(images.len(), 1);
	assert!(!pipeline.network().saw_control.get());
}

#[test]
fn control_adapters_require_a_control_image() {
	let dir = tempfile::tempdir().unwrap();
	let mut pipeline = pipeline_in(dir.path());

	let options = PromptFreePredictOptions::default().with_seed(7).with_steps(2);
	assert!(options.run(&mut pipeline, &source_image(), None).is_err());
}

#[test]
fn multiple_samples_come_back_in_one_batch() {
	let dir = tempfile::tempdir().unwrap();
	let mut pipeline = pipeline_in(dir.path());

	let options = PromptFreePredictOptions::default()
		.with_control_adapter(ControlAdapter::None)
		.with_seed(1)
		.with_steps(2)
		.with_samples(2);
	let images = options.run(&mut pipeline, &source_image(), None).unwrap();
	assert_eq!(images.len(), 2);
}

#[test]
fn progress_callbacks_fire_and_can_stop_sampling() {
	let dir = tempfile::tempdir().unwrap();
	let mut pipeline = pipeline_in(dir.path());

	let calls = Rc::new(Cell::new(0usize));
	let counter = Rc::clone(&calls);
	let options = PromptFreePredictOptions::default()
		.with_control_adapter(ControlAdapter::None)
		.with_seed(1)
		.with_steps(10)
		.callback_progress(1, move |step, _timestep| {
			counter.set(counter.get() + 1);
			step < 2
		});
	let images = options.run(&mut pipeline, &source_image(), None).unwrap();
	// stopped after the third call, well before the 10 requested steps
	assert_eq!(calls.get(), 3);
	assert_eq!(images.len(), 1);
}

#[test]
fn zero_trained_encoders_get_a_zero_unconditional_baseline() {
	let dir = tempfile::tempdir().unwrap();
	let pipeline = pipeline_in(dir.path());

	let control = source_image();
	let conditioning = pipeline.assemble_conditioning(&source_image(), Some(&control), None, 512, 512, 1).unwrap();
	assert!(conditioning.control.is_some(), "default configuration carries a control adapter");
	assert_eq!(conditioning.uncond.dims(), conditioning.context.dims());
	let uncond = conditioning.uncond.flatten_all().unwrap().to_vec1::<f32>().unwrap();
	assert!(uncond.iter().all(|v| *v == 0.));
	let context = conditioning.context.flatten_all().unwrap().to_vec1::<f32>().unwrap();
	assert!(context.iter().any(|v| *v != 0.));
}

#[test]
fn asset_backed_encoders_pad_their_unconditional_embedding() {
	let dir = tempfile::tempdir().unwrap();
	common::seed_weights(dir.path());
	let asset = HashMap::from([("uncond".to_string(), Tensor::full(3f32, (2, 8), &Device::Cpu).unwrap())]);
	let asset_path = dir.path().join("assets/anime_ug.safetensors");
	std::fs::create_dir_all(asset_path.parent().unwrap()).unwrap();
	candle_core::safetensors::save(&asset, &asset_path).unwrap();

	let mut manifest = WeightManifest::default();
	manifest.uncond_embeddings.insert(ContextEncoder::SeeCoderAnime, PathBuf::from("assets/anime_ug.safetensors"));
	let registry = WeightRegistry::with_manifest(dir.path(), manifest);
	let configuration = ActiveConfiguration {
		context_encoder: ContextEncoder::SeeCoderAnime,
		control_adapter: ControlAdapter::None,
		..ActiveConfiguration::default()
	};
	let pipeline = PromptFreePipeline::new(ToyNetwork::new(), registry, configuration).unwrap();

	let conditioning = pipeline.assemble_conditioning(&source_image(), None, None, 512, 512, 1).unwrap();
	// the 2-row asset is zero-padded up to the encoder's 4-row sequence length
	assert_eq!(conditioning.uncond.dims(), conditioning.context.dims());
	let rows = conditioning.uncond.get(0).unwrap().to_vec2::<f32>().unwrap();
	assert!(rows[0].iter().all(|v| *v == 3.));
	assert!(rows[1].iter().all(|v| *v == 3.));
	assert!(rows[2].iter().all(|v| *v == 0.));
	assert!(rows[3].iter().all(|v| *v == 0.));
}

#[test]
fn generated_images_save_as_png() {
	let dir = tempfile::tempdir().unwrap();
	let mut pipeline = pipeline_in(dir.path());

	let options = PromptFreePredictOptions::default()
		.with_control_adapter(ControlAdapter::None)
		.with_seed(5)
		.with_steps(2);
	let images = options.run(&mut pipeline, &source_image(), None).unwrap();
	let target = dir.path().join("result.png");
	images[0].clone().into_rgb8().save(&target).unwrap();
	assert!(target.metadata().unwrap().len() > 0);
}
