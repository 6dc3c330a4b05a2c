//! Diffusion pipelines.

mod prompt_free;

pub use self::prompt_free::*;
