pub mod caption_parser;
pub mod download;
pub mod error;
pub mod model_manager;
pub mod node;
pub mod onnx_vlm;
pub mod prompt;
pub mod qwenclip_image_process;
pub mod runtime;
pub mod session;

pub use caption_parser::{parse_caption, ParseFormat, ParseResult};
pub use download::{DownloadProgress, DownloadTarget, Downloader};
pub use error::{CaptionError, CaptionResult, DownloadError};
pub use model_manager::{get_default_model_dir, ModelManager, CUSTOM_MODEL, MODEL_CATALOG};
pub use node::{CaptionOutput, QwenClipConfig, QwenClipNode};
pub use onnx_vlm::{GenerationConfig, OnnxVlmRuntime};
pub use prompt::DetailLevel;
pub use runtime::{LoadedModel, ModelRuntime};
pub use session::ModelSession;
