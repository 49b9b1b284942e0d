//! Qwen-CLIP - 图片提示词反推库
//!
//! 从图片反推中英文双语提示词：自动下载（支持断点续传）视觉语言模型，
//! 基于 ONNX Runtime 推理，并把模型回答解析为中文和英文两段提示词。
//!
//! ## 使用示例
//!
//! ```no_run
//! use qwen_clip::{create_caption_node, DetailLevel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. 创建节点（模型缺失时自动下载到默认目录）
//!     let node = create_caption_node(None)?;
//!
//!     // 2. 读取图片并转换为 (batch, height, width, channels) 张量
//!     let image = image::open("image.jpg")?;
//!     let tensor = qwen_clip::qwenclip::qwenclip_image_process::image_to_tensor(&image);
//!
//!     // 3. 生成双语提示词
//!     let output = node
//!         .generate_caption(tensor.view(), "fastvlm-0.5b", None, DetailLevel::Detailed)
//!         .await?;
//!     let (chinese, english) = output.into_pair();
//!     println!("中文: {}\n英文: {}", chinese, english);
//!
//!     Ok(())
//! }
//! ```

pub mod qwenclip;

pub use qwenclip::{
    get_default_model_dir, CaptionError, CaptionOutput, CaptionResult, DetailLevel,
    DownloadError, DownloadTarget, Downloader, GenerationConfig, ModelManager, OnnxVlmRuntime,
    QwenClipConfig, QwenClipNode,
};

use std::path::PathBuf;
use std::sync::Arc;

/// 便捷函数：使用默认 ONNX 运行时创建节点
///
/// `models_dir` 为 None 时使用 [`get_default_model_dir`]。
pub fn create_caption_node(models_dir: Option<PathBuf>) -> CaptionResult<QwenClipNode> {
    let manager = match models_dir {
        Some(dir) => ModelManager::new(dir)?,
        None => ModelManager::with_default_dir()?,
    };
    Ok(QwenClipNode::new(
        manager,
        Arc::new(OnnxVlmRuntime::default()),
        QwenClipConfig::default(),
    ))
}
