use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qwen_clip::qwenclip::download::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES};
use qwen_clip::qwenclip::model_manager::MODEL_CATALOG;
use qwen_clip::qwenclip::node::node_class_mappings;
use qwen_clip::qwenclip::qwenclip_image_process::image_to_tensor;
use qwen_clip::qwenclip::CUSTOM_MODEL;
use qwen_clip::{
    DetailLevel, DownloadTarget, Downloader, ModelManager, OnnxVlmRuntime, QwenClipConfig,
    QwenClipNode,
};

#[derive(Parser)]
#[command(name = "qwen-clip-cli", version, about = "图片提示词反推工具 (Qwen-CLIP)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a single URL with resume and retries
    Fetch {
        url: String,
        destination: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
        max_retries: u32,
        /// Seconds to wait between attempts
        #[arg(long, default_value_t = 5)]
        retry_delay: u64,
    },
    /// Download a catalog model into the models directory
    Download {
        #[arg(long, default_value = "fastvlm-0.5b")]
        model: String,
        #[arg(long, env = "QWEN_CLIP_MODELS_DIR")]
        models_dir: Option<PathBuf>,
        /// Model hub base URL, e.g. a mirror
        #[arg(long, env = "HF_ENDPOINT")]
        endpoint: Option<String>,
    },
    /// Generate Chinese and English prompts for images
    Caption {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, default_value = "fastvlm-0.5b")]
        model: String,
        /// Local model directory; implies the custom model type
        #[arg(long)]
        model_path: Option<PathBuf>,
        #[arg(long, default_value = "simple")]
        mode: DetailLevel,
        #[arg(long, env = "QWEN_CLIP_MODELS_DIR")]
        models_dir: Option<PathBuf>,
        /// Seconds to wait for the model to load
        #[arg(long, default_value_t = 300)]
        load_timeout: u64,
    },
    /// Print the node registration metadata as JSON
    NodeInfo,
}

fn model_manager(models_dir: Option<PathBuf>) -> Result<ModelManager> {
    let manager = match models_dir {
        Some(dir) => ModelManager::new(dir)?,
        None => ModelManager::with_default_dir()?,
    };
    Ok(manager)
}

/// Per-image timings for a caption run.
#[derive(Default)]
struct ProcessingStats {
    succeeded: Vec<Duration>,
    failed: usize,
}

impl ProcessingStats {
    fn print_summary(&self) {
        let total = self.succeeded.len() + self.failed;
        println!("\n📊 处理统计报告");
        println!("{}", "=".repeat(50));
        println!("   • 总图片数量: {}", total);
        println!("   • 成功处理: {} 张", self.succeeded.len());
        println!("   • 处理失败: {} 张", self.failed);
        if let (Some(min), Some(max)) = (self.succeeded.iter().min(), self.succeeded.iter().max()) {
            let sum: Duration = self.succeeded.iter().sum();
            println!(
                "   • 平均处理时间: {:.2}秒",
                (sum / self.succeeded.len() as u32).as_secs_f32()
            );
            println!("   • 最快处理时间: {:.2}秒", min.as_secs_f32());
            println!("   • 最慢处理时间: {:.2}秒", max.as_secs_f32());
        }
        println!("{}", "=".repeat(50));
    }
}

async fn caption(
    images: Vec<PathBuf>,
    model: String,
    model_path: Option<PathBuf>,
    mode: DetailLevel,
    models_dir: Option<PathBuf>,
    load_timeout: u64,
) -> Result<()> {
    let config = QwenClipConfig {
        load_timeout: Duration::from_secs(load_timeout),
    };
    let node = QwenClipNode::new(
        model_manager(models_dir)?,
        Arc::new(OnnxVlmRuntime::default()),
        config,
    );
    let (model_type, custom_path) = match &model_path {
        Some(path) => (CUSTOM_MODEL, Some(path.to_string_lossy().into_owned())),
        None => (model.as_str(), None),
    };

    println!("🚀 开始批量处理 {} 张图片", images.len());
    let mut stats = ProcessingStats::default();
    for (i, path) in images.iter().enumerate() {
        println!("\n--- 处理第 {} 张图片: {} ---", i + 1, path.display());
        let started = Instant::now();
        let result = async {
            let image =
                image::open(path).with_context(|| format!("无法打开图片 {}", path.display()))?;
            let tensor = image_to_tensor(&image);
            let output = node
                .generate_caption(tensor.view(), model_type, custom_path.as_deref(), mode)
                .await?;
            Ok::<_, anyhow::Error>(output)
        }
        .await;

        match result {
            Ok(output) => {
                println!("中文提示词: {}", output.chinese);
                println!("英文提示词: {}", output.english);
                stats.succeeded.push(started.elapsed());
            }
            Err(e) => {
                println!("❌ 处理失败: {:#}", e);
                stats.failed += 1;
            }
        }
    }
    stats.print_summary();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Fetch {
            url,
            destination,
            chunk_size,
            max_retries,
            retry_delay,
        } => {
            let target = DownloadTarget::new(url, &destination)
                .with_chunk_size(chunk_size)
                .with_max_retries(max_retries)
                .with_retry_delay(Duration::from_secs(retry_delay));
            Downloader::new()?.download(&target).await?;
            println!("✅ 下载完成: {}", destination.display());
        }
        Command::Download {
            model,
            models_dir,
            endpoint,
        } => {
            let mut manager = model_manager(models_dir)?;
            if let Some(endpoint) = endpoint {
                manager = manager.with_endpoint(endpoint);
            }
            let dir = manager.ensure_model(&model).await?;
            println!("✅ 模型已就绪: {}", dir.display());
        }
        Command::Caption {
            images,
            model,
            model_path,
            mode,
            models_dir,
            load_timeout,
        } => caption(images, model, model_path, mode, models_dir, load_timeout).await?,
        Command::NodeInfo => {
            println!("{}", serde_json::to_string_pretty(&node_class_mappings())?);
            for spec in MODEL_CATALOG {
                eprintln!(
                    "{}: {} ({:.1} MB)",
                    spec.key,
                    spec.display_name,
                    spec.total_size_mb()
                );
            }
        }
    }
    Ok(())
}
