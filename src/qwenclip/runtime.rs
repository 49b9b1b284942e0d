use anyhow::Result;
use image::DynamicImage;
use std::path::Path;

/// Loads a vision-language model from a local directory.
///
/// Both methods block; callers run them on the blocking thread pool.
pub trait ModelRuntime: Send + Sync {
    fn load(&self, model_dir: &Path) -> Result<Box<dyn LoadedModel>>;
}

/// A loaded model and tokenizer. Dropping it releases its memory.
pub trait LoadedModel: Send {
    /// Answer `prompt` about `image`, returning the decoded text.
    fn generate(&mut self, image: &DynamicImage, prompt: &str) -> Result<String>;
}
