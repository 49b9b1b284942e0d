use anyhow::{anyhow, bail, Context, Result};
use image::DynamicImage;
use ndarray::{s, Array2, Array3, Array4, Ix3, Ix4};
use ort::{
    session::builder::GraphOptimizationLevel,
    session::Session,
    value::{Tensor, TensorRef},
};
use rand::Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;

#[cfg(target_os = "macos")]
use ort::{
    execution_providers::coreml::CoreMLComputeUnits,
    execution_providers::CoreMLExecutionProvider,
};

#[cfg(target_os = "windows")]
use ort::{execution_providers::CPUExecutionProvider, execution_providers::CUDAExecutionProvider};

use super::qwenclip_image_process::VlmImageProcessor;
use super::runtime::{LoadedModel, ModelRuntime};

pub const VISION_ENCODER_FILE: &str = "vision_encoder.onnx";
pub const EMBED_TOKENS_FILE: &str = "embed_tokens.onnx";
pub const DECODER_FILE: &str = "decoder_model_merged.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const CONFIG_FILE: &str = "config.json";
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

const FEATURE_OUTPUTS: &[&str] = &["image_features", "last_hidden_state", "output"];

/// Sampling and prompt settings for caption generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    /// Image features beyond this many tokens are dropped before fusion.
    pub max_image_tokens: usize,
    pub system_prompt: String,
    pub image_placeholder: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_k: 50,
            top_p: 0.95,
            max_image_tokens: 256,
            system_prompt: "You are a helpful vision assistant that writes accurate \
                            text-to-image prompts for the image you are shown."
                .to_string(),
            image_placeholder: "<image>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(i64),
    Many(Vec<i64>),
}

#[derive(Debug, Default, Deserialize)]
struct TextConfig {
    num_hidden_layers: Option<usize>,
    num_attention_heads: Option<usize>,
    num_key_value_heads: Option<usize>,
    hidden_size: Option<usize>,
    head_dim: Option<usize>,
    eos_token_id: Option<TokenIds>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelConfig {
    #[serde(flatten)]
    top: TextConfig,
    text_config: Option<TextConfig>,
    image_token_index: Option<i64>,
    image_token_id: Option<i64>,
}

/// Decoder geometry needed to build the empty KV cache, plus special tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderSpec {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub eos_token_ids: Vec<i64>,
    pub image_token_id: i64,
}

impl Default for DecoderSpec {
    /// Qwen2-0.5B geometry with the `<|im_end|>` / `<image>` ids.
    fn default() -> Self {
        Self {
            num_layers: 24,
            num_kv_heads: 2,
            head_dim: 64,
            eos_token_ids: vec![151645],
            image_token_id: 151646,
        }
    }
}

impl DecoderSpec {
    pub fn from_config_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn from_json(text: &str) -> Result<Self> {
        let config: ModelConfig = serde_json::from_str(text)?;
        let nested = config.text_config.unwrap_or_default();
        let top = config.top;
        let defaults = Self::default();

        let pick = |a: Option<usize>, b: Option<usize>| a.or(b);
        let num_heads = pick(nested.num_attention_heads, top.num_attention_heads);
        let hidden = pick(nested.hidden_size, top.hidden_size);
        let head_dim = pick(nested.head_dim, top.head_dim)
            .or_else(|| Some(hidden? / num_heads?))
            .unwrap_or(defaults.head_dim);

        let eos_token_ids = match nested.eos_token_id.or(top.eos_token_id) {
            Some(TokenIds::One(id)) => vec![id],
            Some(TokenIds::Many(ids)) if !ids.is_empty() => ids,
            _ => defaults.eos_token_ids,
        };

        Ok(Self {
            num_layers: pick(nested.num_hidden_layers, top.num_hidden_layers)
                .unwrap_or(defaults.num_layers),
            num_kv_heads: pick(nested.num_key_value_heads, top.num_key_value_heads)
                .or(num_heads)
                .unwrap_or(defaults.num_kv_heads),
            head_dim,
            eos_token_ids,
            image_token_id: config
                .image_token_id
                .or(config.image_token_index)
                .unwrap_or(defaults.image_token_id),
        })
    }
}

/// `ModelRuntime` backed by ONNX Runtime: vision encoder, token embedder and
/// a merged decoder with KV cache, exported the way `onnx-community` does.
#[derive(Debug, Clone, Default)]
pub struct OnnxVlmRuntime {
    config: GenerationConfig,
}

impl OnnxVlmRuntime {
    pub fn new(config: GenerationConfig) -> Self {
        Self { config }
    }
}

impl ModelRuntime for OnnxVlmRuntime {
    fn load(&self, model_dir: &Path) -> Result<Box<dyn LoadedModel>> {
        Ok(Box::new(OnnxVlm::load(model_dir, self.config.clone())?))
    }
}

pub struct OnnxVlm {
    tokenizer: Tokenizer,
    vision_encoder: Session,
    embed_tokens: Session,
    decoder: Session,
    spec: DecoderSpec,
    config: GenerationConfig,
    image_processor: VlmImageProcessor,
}

impl OnnxVlm {
    pub fn load(model_dir: &Path, config: GenerationConfig) -> Result<Self> {
        let started = Instant::now();
        tracing::info!("Loading ONNX VLM from {}", model_dir.display());

        let _ = ort::init().with_name("qwen-clip").commit().map_err(|e| {
            tracing::debug!("ONNX Runtime already initialized or failed: {:?}", e);
        });

        let spec = match locate(model_dir, CONFIG_FILE) {
            Ok(path) => DecoderSpec::from_config_file(&path)?,
            Err(_) => {
                tracing::warn!("{} not found, using default decoder geometry", CONFIG_FILE);
                DecoderSpec::default()
            }
        };
        tracing::debug!("Decoder spec: {:?}", spec);

        let image_processor = match locate(model_dir, PREPROCESSOR_CONFIG_FILE) {
            Ok(path) => VlmImageProcessor::from_config_file(&path)?,
            Err(_) => VlmImageProcessor::default(),
        };

        let tokenizer = Tokenizer::from_file(locate(model_dir, TOKENIZER_FILE)?)
            .map_err(|e| anyhow!("Error loading tokenizer: {:?}", e))?;

        let vision_encoder = create_session(&locate(model_dir, VISION_ENCODER_FILE)?)?;
        let embed_tokens = create_session(&locate(model_dir, EMBED_TOKENS_FILE)?)?;
        let decoder = create_session(&locate(model_dir, DECODER_FILE)?)?;

        tracing::info!(
            "ONNX VLM loaded in {:.2}ms",
            started.elapsed().as_millis()
        );

        Ok(Self {
            tokenizer,
            vision_encoder,
            embed_tokens,
            decoder,
            spec,
            config,
            image_processor,
        })
    }

    fn format_chat(&self, prompt: &str) -> String {
        format!(
            "<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n{}\n{}<|im_end|>\n<|im_start|>assistant\n",
            self.config.system_prompt, self.config.image_placeholder, prompt
        )
    }

    fn image_features(&mut self, image: &DynamicImage) -> Result<Array3<f32>> {
        let pixel_values = self.image_processor.preprocess(image);
        tracing::debug!("Vision encoder input shape: {:?}", pixel_values.shape());

        let outputs = self.vision_encoder.run(ort::inputs![
            "pixel_values" => Tensor::from_array(pixel_values)?,
        ])?;

        let name = match FEATURE_OUTPUTS.iter().find(|n| outputs.contains_key(**n)) {
            Some(n) => n.to_string(),
            None => outputs
                .keys()
                .next()
                .ok_or_else(|| anyhow!("vision encoder produced no outputs"))?
                .to_string(),
        };

        let view = outputs[name.as_str()].try_extract_array::<f32>()?;
        let features = match view.ndim() {
            2 => {
                let shape = view.shape();
                view.to_shape((1, shape[0], shape[1]))?.to_owned()
            }
            3 => view.into_dimensionality::<Ix3>()?.to_owned(),
            n => bail!("Unexpected vision encoder output dimensionality: {}", n),
        };
        tracing::debug!("Image features shape: {:?}", features.shape());
        Ok(features)
    }

    fn token_embeddings(&mut self, input_ids: &[i64]) -> Result<Array3<f32>> {
        let ids = Array2::from_shape_vec((1, input_ids.len()), input_ids.to_vec())?;
        let outputs = self.embed_tokens.run(ort::inputs![
            "input_ids" => TensorRef::from_array_view(&ids)?,
        ])?;
        let embeds = outputs["inputs_embeds"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?
            .to_owned();
        Ok(embeds)
    }

    /// Autoregressive decoding with a growing KV cache.
    fn decode(&mut self, prompt_embeds: Array3<f32>) -> Result<Vec<u32>> {
        let layers = self.spec.num_layers;
        let seq_len = prompt_embeds.shape()[1];

        let mut embeds = prompt_embeds;
        let mut attention_mask: Array2<i64> = Array2::ones((1, seq_len));
        let mut position_ids: Array2<i64> = Array2::from_shape_fn((1, seq_len), |(_, i)| i as i64);
        let mut past: Vec<Array4<f32>> = (0..layers * 2)
            .map(|_| Array4::<f32>::zeros((1, self.spec.num_kv_heads, 0, self.spec.head_dim)))
            .collect();

        let mut rng = rand::rng();
        let mut generated = Vec::with_capacity(self.config.max_new_tokens);

        for step in 0..self.config.max_new_tokens {
            let mut inputs = ort::inputs![
                "inputs_embeds" => TensorRef::from_array_view(&embeds)?,
                "position_ids" => TensorRef::from_array_view(&position_ids)?,
                "attention_mask" => TensorRef::from_array_view(&attention_mask)?,
            ];
            for layer in 0..layers {
                inputs.push((
                    format!("past_key_values.{}.key", layer).into(),
                    TensorRef::from_array_view(&past[layer * 2])?.into(),
                ));
                inputs.push((
                    format!("past_key_values.{}.value", layer).into(),
                    TensorRef::from_array_view(&past[layer * 2 + 1])?.into(),
                ));
            }

            let outputs = self.decoder.run(inputs)?;

            let logits = outputs["logits"]
                .try_extract_array::<f32>()?
                .into_dimensionality::<Ix3>()?;
            let last = logits.shape()[1] - 1;
            let row: Vec<f32> = logits.slice(s![0, last, ..]).iter().copied().collect();
            let next = sample_token(
                &row,
                &self.config,
                Some(self.spec.image_token_id as usize),
                rng.random::<f32>(),
            ) as i64;

            let mut present = Vec::with_capacity(layers * 2);
            for layer in 0..layers {
                for kind in ["key", "value"] {
                    present.push(
                        outputs[format!("present.{}.{}", layer, kind)]
                            .try_extract_array::<f32>()?
                            .into_dimensionality::<Ix4>()?
                            .to_owned(),
                    );
                }
            }
            drop(outputs);

            if self.spec.eos_token_ids.contains(&next) {
                tracing::debug!("End token at step {}", step + 1);
                break;
            }
            generated.push(next as u32);
            past = present;

            embeds = self.token_embeddings(&[next])?;
            let total = attention_mask.shape()[1];
            attention_mask = Array2::ones((1, total + 1));
            position_ids = Array2::from_elem((1, 1), total as i64);
        }

        Ok(generated)
    }
}

impl LoadedModel for OnnxVlm {
    fn generate(&mut self, image: &DynamicImage, prompt: &str) -> Result<String> {
        let started = Instant::now();

        let image_features = self.image_features(image)?;
        let chat = self.format_chat(prompt);
        let encoding = self
            .tokenizer
            .encode(chat, true)
            .map_err(|e| anyhow!("Error encoding prompt: {:?}", e))?;
        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();

        let image_pos = input_ids
            .iter()
            .position(|&id| id == self.spec.image_token_id)
            .ok_or_else(|| {
                anyhow!(
                    "tokenized prompt has no image token {} ({})",
                    self.spec.image_token_id,
                    self.config.image_placeholder
                )
            })?;

        let text_embeds = self.token_embeddings(&input_ids)?;
        let fused = fuse_embeddings(
            &text_embeds,
            &image_features,
            image_pos,
            self.config.max_image_tokens,
        )?;

        let tokens = self.decode(fused)?;
        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("Decode error: {:?}", e))?;

        tracing::info!(
            "Generated {} tokens in {:.2}ms",
            tokens.len(),
            started.elapsed().as_millis()
        );
        Ok(text.trim().to_string())
    }
}

fn create_session(path: &Path) -> Result<Session> {
    let started = Instant::now();
    #[allow(unused_mut)]
    let mut builder = Session::builder()
        .map_err(|e| anyhow!("Session builder error: {:?}", e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| anyhow!("Optimization level error: {:?}", e))?;

    #[cfg(target_os = "macos")]
    {
        builder = builder
            .with_execution_providers([CoreMLExecutionProvider::default()
                .with_compute_units(CoreMLComputeUnits::CPUAndGPU)
                .build()])
            .map_err(|e| anyhow!("CoreML execution provider error: {:?}", e))?;
    }

    #[cfg(target_os = "windows")]
    {
        builder = builder
            .with_execution_providers([
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| anyhow!("CUDA/CPU execution provider error: {:?}", e))?;
    }

    let session = builder
        .commit_from_file(path)
        .map_err(|e| anyhow!("Model loading error for {}: {:?}", path.display(), e))?;
    tracing::info!(
        "Model {} loaded in {:.2}ms",
        path.display(),
        started.elapsed().as_millis()
    );
    Ok(session)
}

/// `dir/name`, or `dir/onnx/name` as laid out in HuggingFace ONNX exports.
fn locate(dir: &Path, name: &str) -> Result<PathBuf> {
    [dir.join(name), dir.join("onnx").join(name)]
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow!("{} not found in {}", name, dir.display()))
}

/// Replace the image placeholder token at `image_pos` with the image features.
pub(crate) fn fuse_embeddings(
    text: &Array3<f32>,
    image: &Array3<f32>,
    image_pos: usize,
    max_image_tokens: usize,
) -> Result<Array3<f32>> {
    let (text_len, hidden) = (text.shape()[1], text.shape()[2]);
    if image.shape()[2] != hidden {
        bail!(
            "Image feature dimension {} doesn't match text dimension {}",
            image.shape()[2],
            hidden
        );
    }
    if image_pos >= text_len {
        bail!("image token position {} outside prompt of {} tokens", image_pos, text_len);
    }

    let image_len = image.shape()[1].min(max_image_tokens);
    let mut fused = Array3::<f32>::zeros((1, text_len - 1 + image_len, hidden));
    fused
        .slice_mut(s![.., ..image_pos, ..])
        .assign(&text.slice(s![.., ..image_pos, ..]));
    fused
        .slice_mut(s![.., image_pos..image_pos + image_len, ..])
        .assign(&image.slice(s![.., ..image_len, ..]));
    fused
        .slice_mut(s![.., image_pos + image_len.., ..])
        .assign(&text.slice(s![.., image_pos + 1.., ..]));
    Ok(fused)
}

/// Temperature + top-k + top-p sampling. `r` is a uniform draw in [0, 1).
/// A non-positive temperature means greedy decoding.
pub(crate) fn sample_token(
    logits: &[f32],
    config: &GenerationConfig,
    banned: Option<usize>,
    r: f32,
) -> usize {
    let by_logit_desc = |a: &(usize, f32), b: &(usize, f32)| b.1.total_cmp(&a.1);

    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .copied()
        .enumerate()
        .filter(|&(i, l)| Some(i) != banned && l.is_finite())
        .collect();
    if candidates.is_empty() {
        return 0;
    }

    let k = if config.temperature <= 0.0 { 1 } else { config.top_k.max(1) };
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, by_logit_desc);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(by_logit_desc);
    if k == 1 {
        return candidates[0].0;
    }

    let max_logit = candidates[0].1;
    let mut probs: Vec<(usize, f32)> = candidates
        .into_iter()
        .map(|(i, l)| (i, ((l - max_logit) / config.temperature).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|(_, p)| p).sum();
    for (_, p) in probs.iter_mut() {
        *p /= sum;
    }

    let mut cumulative = 0.0;
    let mut keep = probs.len();
    for (n, (_, p)) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= config.top_p {
            keep = n + 1;
            break;
        }
    }
    probs.truncate(keep);

    let mass: f32 = probs.iter().map(|(_, p)| p).sum();
    let target = r * mass;
    let mut acc = 0.0;
    for &(i, p) in &probs {
        acc += p;
        if target < acc {
            return i;
        }
    }
    probs[probs.len() - 1].0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_spec_from_nested_config() {
        let spec = DecoderSpec::from_json(
            r#"{
                "image_token_index": 151646,
                "text_config": {
                    "num_hidden_layers": 28,
                    "num_attention_heads": 12,
                    "num_key_value_heads": 2,
                    "hidden_size": 1536,
                    "eos_token_id": [151645, 151643]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(spec.num_layers, 28);
        assert_eq!(spec.num_kv_heads, 2);
        assert_eq!(spec.head_dim, 128);
        assert_eq!(spec.eos_token_ids, vec![151645, 151643]);
        assert_eq!(spec.image_token_id, 151646);
    }

    #[test]
    fn test_decoder_spec_top_level_and_defaults() {
        let spec = DecoderSpec::from_json(
            r#"{"num_hidden_layers": 2, "eos_token_id": 7, "image_token_id": 9}"#,
        )
        .unwrap();
        assert_eq!(spec.num_layers, 2);
        assert_eq!(spec.num_kv_heads, 2);
        assert_eq!(spec.head_dim, 64);
        assert_eq!(spec.eos_token_ids, vec![7]);
        assert_eq!(spec.image_token_id, 9);
    }

    #[test]
    fn test_fuse_replaces_image_token() {
        // 4 text tokens, hidden 2, image token at position 1
        let text = Array3::from_shape_fn((1, 4, 2), |(_, t, _)| t as f32);
        let image = Array3::from_elem((1, 3, 2), -1.0);

        let fused = fuse_embeddings(&text, &image, 1, 256).unwrap();
        assert_eq!(fused.shape(), &[1, 6, 2]);
        let column: Vec<f32> = fused.slice(s![0, .., 0]).to_vec();
        assert_eq!(column, vec![0.0, -1.0, -1.0, -1.0, 2.0, 3.0]);

        let capped = fuse_embeddings(&text, &image, 1, 2).unwrap();
        assert_eq!(capped.shape(), &[1, 5, 2]);
    }

    #[test]
    fn test_fuse_rejects_mismatched_hidden_size() {
        let text = Array3::<f32>::zeros((1, 4, 2));
        let image = Array3::<f32>::zeros((1, 3, 5));
        assert!(fuse_embeddings(&text, &image, 0, 256).is_err());
        let image = Array3::<f32>::zeros((1, 3, 2));
        assert!(fuse_embeddings(&text, &image, 4, 256).is_err());
    }

    #[test]
    fn test_greedy_sampling() {
        let config = GenerationConfig {
            temperature: 0.0,
            ..GenerationConfig::default()
        };
        let logits = [0.1, 3.0, 2.0, f32::NAN];
        assert_eq!(sample_token(&logits, &config, None, 0.99), 1);
        assert_eq!(sample_token(&logits, &config, Some(1), 0.99), 2);
    }

    #[test]
    fn test_top_k_one_is_argmax() {
        let config = GenerationConfig {
            top_k: 1,
            ..GenerationConfig::default()
        };
        let logits = [5.0, 1.0, 4.0];
        for r in [0.0, 0.5, 0.999] {
            assert_eq!(sample_token(&logits, &config, None, r), 0);
        }
    }

    #[test]
    fn test_top_p_cuts_the_tail() {
        let config = GenerationConfig {
            temperature: 1.0,
            top_k: 50,
            top_p: 0.5,
            ..GenerationConfig::default()
        };
        // token 2 dominates, so the nucleus holds only it
        let logits = [0.0, 0.0, 10.0, 0.0];
        for r in [0.0, 0.5, 0.999] {
            assert_eq!(sample_token(&logits, &config, None, r), 2);
        }

        let flat = GenerationConfig {
            top_p: 1.0,
            ..config
        };
        let uniform = [1.0, 1.0];
        assert_ne!(
            sample_token(&uniform, &flat, None, 0.1),
            sample_token(&uniform, &flat, None, 0.9)
        );
    }
}
