//! The caption node as the host sees it: metadata plus `generate_caption`.

use ndarray::ArrayView4;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::caption_parser::{parse_caption, ParseResult};
use super::error::{CaptionError, CaptionResult};
use super::model_manager::{model_type_options, ModelManager, CUSTOM_MODEL};
use super::prompt::DetailLevel;
use super::qwenclip_image_process::tensor_to_image;
use super::runtime::ModelRuntime;
use super::session::{ModelSession, DEFAULT_LOAD_TIMEOUT};

pub const NODE_IMAGE: &str = "IMAGE";
pub const NODE_STRING: &str = "STRING";

pub const NODE_CLASS: &str = "QwenClipNode";
pub const NODE_DISPLAY_NAME: &str = "图片提示词反推 (Qwen-CLIP)";
pub const NODE_CATEGORY: &str = "QwenCLIP";
pub const NODE_FUNCTION: &str = "generate_caption";
pub const RETURN_NAMES: [&str; 2] = ["caption_chinese", "caption_english"];

/// Node metadata in the shape the host registers.
pub fn node_metadata() -> Value {
    let modes: Vec<&str> = DetailLevel::ALL.iter().map(|d| d.as_str()).collect();
    json!({
        "class": NODE_CLASS,
        "display_name": NODE_DISPLAY_NAME,
        "category": NODE_CATEGORY,
        "function": NODE_FUNCTION,
        "input_types": {
            "required": {
                "image": [NODE_IMAGE],
                "model_type": [model_type_options()],
                "mode": [modes, { "default": DetailLevel::default().as_str() }],
            },
            "optional": {
                "custom_model_path": [NODE_STRING, { "default": "", "multiline": false }],
            },
        },
        "return_types": [NODE_STRING, NODE_STRING],
        "return_names": RETURN_NAMES,
    })
}

pub fn node_class_mappings() -> Value {
    json!({ NODE_CLASS: node_metadata() })
}

pub fn node_display_name_mappings() -> Value {
    json!({ NODE_CLASS: NODE_DISPLAY_NAME })
}

#[derive(Debug, Clone)]
pub struct QwenClipConfig {
    pub load_timeout: Duration,
}

impl Default for QwenClipConfig {
    fn default() -> Self {
        Self {
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptionOutput {
    pub chinese: String,
    pub english: String,
    #[serde(skip)]
    pub parse: ParseResult,
    pub processing_time_ms: u128,
}

impl CaptionOutput {
    /// The node's two outputs, Chinese first.
    pub fn into_pair(self) -> (String, String) {
        (self.chinese, self.english)
    }
}

pub struct QwenClipNode {
    manager: ModelManager,
    runtime: Arc<dyn ModelRuntime>,
    config: QwenClipConfig,
}

impl QwenClipNode {
    pub fn new(manager: ModelManager, runtime: Arc<dyn ModelRuntime>, config: QwenClipConfig) -> Self {
        Self {
            manager,
            runtime,
            config,
        }
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    /// Resolve the directory to load: a caller-supplied path for `custom`,
    /// otherwise the catalog model, downloaded when missing.
    pub async fn resolve_model_dir(
        &self,
        model_type: &str,
        custom_model_path: Option<&str>,
    ) -> CaptionResult<PathBuf> {
        if model_type == CUSTOM_MODEL {
            let path = custom_model_path.map(str::trim).unwrap_or_default();
            let dir = Path::new(path);
            if path.is_empty() || !dir.is_dir() {
                return Err(CaptionError::ModelNotFound(dir.to_path_buf()));
            }
            return Ok(dir.to_path_buf());
        }
        if custom_model_path.is_some_and(|p| !p.trim().is_empty()) {
            warn!("custom_model_path ignored for model type {}", model_type);
        }
        self.manager.ensure_model(model_type).await
    }

    pub async fn generate_caption(
        &self,
        image: ArrayView4<'_, f32>,
        model_type: &str,
        custom_model_path: Option<&str>,
        mode: DetailLevel,
    ) -> CaptionResult<CaptionOutput> {
        let started = Instant::now();
        let picture = tensor_to_image(image)?;
        let model_dir = self.resolve_model_dir(model_type, custom_model_path).await?;

        let mut session =
            ModelSession::acquire(self.runtime.clone(), &model_dir, self.config.load_timeout)
                .await?;

        // the session moves into the blocking task and is dropped there on every path
        let raw = tokio::task::spawn_blocking(move || session.generate(&picture, mode.prompt()))
            .await
            .map_err(|e| CaptionError::Generation(e.into()))??;

        let parse = parse_caption(&raw);
        let elapsed = started.elapsed();
        info!(
            "Caption generated in {:.2}s ({:?})",
            elapsed.as_secs_f32(),
            parse.format
        );
        Ok(CaptionOutput {
            chinese: parse.chinese.clone(),
            english: parse.english.clone(),
            parse,
            processing_time_ms: elapsed.as_millis(),
        })
    }
}
