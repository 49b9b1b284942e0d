use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

use super::download::{
    DownloadTarget, Downloader, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY,
};
use super::error::{CaptionError, CaptionResult};

/// Model type meaning "use the directory the caller supplies".
pub const CUSTOM_MODEL: &str = "custom";

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const PARTIAL_SUFFIX: &str = "part";

/// One file of a model repository.
#[derive(Debug)]
pub struct ModelFile {
    /// Path inside the remote repository.
    pub remote: &'static str,
    /// File name inside the local model directory.
    pub name: &'static str,
    pub size_mb: f32,
}

#[derive(Debug)]
pub struct ModelSpec {
    pub key: &'static str,
    pub display_name: &'static str,
    pub repo: &'static str,
    pub files: &'static [ModelFile],
}

impl ModelSpec {
    pub fn total_size_mb(&self) -> f32 {
        self.files.iter().map(|f| f.size_mb).sum()
    }
}

pub const MODEL_CATALOG: &[ModelSpec] = &[ModelSpec {
    key: "fastvlm-0.5b",
    display_name: "FastVLM-0.5B",
    repo: "onnx-community/FastVLM-0.5B-ONNX",
    files: &[
        ModelFile {
            remote: "config.json",
            name: "config.json",
            size_mb: 0.01,
        },
        ModelFile {
            remote: "tokenizer.json",
            name: "tokenizer.json",
            size_mb: 2.2,
        },
        ModelFile {
            remote: "onnx/embed_tokens.onnx",
            name: "embed_tokens.onnx",
            size_mb: 12.0,
        },
        ModelFile {
            remote: "onnx/vision_encoder.onnx",
            name: "vision_encoder.onnx",
            size_mb: 450.0,
        },
        ModelFile {
            remote: "onnx/decoder_model_merged.onnx",
            name: "decoder_model_merged.onnx",
            size_mb: 920.0,
        },
    ],
}];

/// Keys offered to the node's `model_type` input, `custom` last.
pub fn model_type_options() -> Vec<&'static str> {
    MODEL_CATALOG
        .iter()
        .map(|spec| spec.key)
        .chain(std::iter::once(CUSTOM_MODEL))
        .collect()
}

pub fn find_model(key: &str) -> CaptionResult<&'static ModelSpec> {
    MODEL_CATALOG
        .iter()
        .find(|spec| spec.key == key)
        .ok_or_else(|| CaptionError::UnknownModel(key.to_string()))
}

/// Resolves model directories and fetches missing models file by file.
///
/// Each file is downloaded to `<name>.part` and renamed once complete, so a
/// file without the suffix is always whole and an interrupted download is
/// resumed on the next call.
pub struct ModelManager {
    models_dir: PathBuf,
    endpoint: String,
    chunk_size: usize,
    max_retries: u32,
    retry_delay: Duration,
    downloader: Downloader,
}

impl ModelManager {
    pub fn new(models_dir: impl Into<PathBuf>) -> CaptionResult<Self> {
        let models_dir = models_dir.into();
        std::fs::create_dir_all(&models_dir)?;
        let downloader = Downloader::new()?;
        Ok(Self {
            models_dir,
            endpoint: std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            downloader,
        })
    }

    pub fn with_default_dir() -> CaptionResult<Self> {
        Self::new(get_default_model_dir())
    }

    /// Base URL of the model hub, e.g. a mirror.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, chunk_size: usize, max_retries: u32, retry_delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_dir(&self, spec: &ModelSpec) -> PathBuf {
        self.models_dir.join(spec.display_name)
    }

    pub fn file_url(&self, spec: &ModelSpec, file: &ModelFile) -> String {
        format!("{}/{}/resolve/main/{}", self.endpoint, spec.repo, file.remote)
    }

    /// The model directory, if every file of the model is fully present.
    pub fn get_model_path(&self, key: &str) -> Option<PathBuf> {
        let spec = find_model(key).ok()?;
        let dir = self.model_dir(spec);
        spec.files
            .iter()
            .all(|f| dir.join(f.name).is_file())
            .then_some(dir)
    }

    pub fn is_model_downloaded(&self, key: &str) -> bool {
        self.get_model_path(key).is_some()
    }

    /// Return the model directory, downloading the model first if needed.
    pub async fn ensure_model(&self, key: &str) -> CaptionResult<PathBuf> {
        match self.get_model_path(key) {
            Some(dir) => Ok(dir),
            None => self.download_model(key).await,
        }
    }

    pub async fn download_model(&self, key: &str) -> CaptionResult<PathBuf> {
        let spec = find_model(key)?;
        let dir = self.model_dir(spec);
        std::fs::create_dir_all(&dir)?;

        println!(
            "📦 正在准备下载模型: {} ({:.1} MB, {} files)",
            spec.display_name,
            spec.total_size_mb(),
            spec.files.len()
        );
        info!("Downloading {} to {}", spec.display_name, dir.display());

        for (index, file) in spec.files.iter().enumerate() {
            let final_path = dir.join(file.name);
            if final_path.is_file() {
                println!("✅ {} already exists, skipping", file.name);
                continue;
            }

            println!(
                "📥 [{}/{}] {} ({:.1} MB)",
                index + 1,
                spec.files.len(),
                file.name,
                file.size_mb
            );
            let partial = dir.join(format!("{}.{}", file.name, PARTIAL_SUFFIX));
            let target = DownloadTarget::new(self.file_url(spec, file), &partial)
                .with_chunk_size(self.chunk_size)
                .with_max_retries(self.max_retries)
                .with_retry_delay(self.retry_delay);

            if let Err(source) = self.downloader.download(&target).await {
                error!("Failed to download {}: {}", file.name, source);
                return Err(CaptionError::ModelDownload {
                    model: spec.display_name.to_string(),
                    dir,
                    source,
                });
            }
            std::fs::rename(&partial, &final_path)?;
        }

        println!("🎉 模型 {} 下载完成: {}", spec.display_name, dir.display());
        Ok(dir)
    }
}

/// Default directory holding model folders.
///
/// `QWEN_CLIP_MODELS_DIR` wins, then the host's `COMFYUI_MODELS_DIR/clip`,
/// then the platform data directory.
pub fn get_default_model_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("QWEN_CLIP_MODELS_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = std::env::var_os("COMFYUI_MODELS_DIR") {
        return PathBuf::from(dir).join("clip");
    }

    let model_dir = if cfg!(target_os = "macos") {
        dirs::cache_dir().map(|cache| cache.join("QwenClip").join("models"))
    } else if cfg!(target_os = "windows") {
        dirs::config_dir().map(|config| config.join("QwenClip").join("models"))
    } else {
        dirs::data_local_dir().map(|data| data.join("qwen-clip").join("models"))
    }
    .unwrap_or_else(|| PathBuf::from("models/clip"));

    if let Err(e) = std::fs::create_dir_all(&model_dir) {
        info!(
            "Could not create model directory {}, falling back to local: {}",
            model_dir.display(),
            e
        );
        return PathBuf::from("models/clip");
    }
    model_dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qwenclip::download::test_server::{resource, serve, Reply};
    use crate::qwenclip::download::REQUEST_TIMEOUT;
    use reqwest::Client;

    fn quiet_downloader() -> Downloader {
        let client = Client::builder()
            .no_proxy()
            .read_timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap();
        Downloader::with_client(client).quiet()
    }

    fn manager(dir: &Path, endpoint: &str) -> ModelManager {
        ModelManager::new(dir)
            .unwrap()
            .with_endpoint(endpoint)
            .with_retry_policy(4096, 1, Duration::from_millis(10))
            .with_downloader(quiet_downloader())
    }

    /// Body for each remote file, distinct per path.
    fn body_for(path: &str) -> Vec<u8> {
        let mut body = path.as_bytes().to_vec();
        body.extend(resource(2000));
        body
    }

    #[test]
    fn test_catalog_lookup() {
        assert_eq!(find_model("fastvlm-0.5b").unwrap().display_name, "FastVLM-0.5B");
        assert!(matches!(find_model(CUSTOM_MODEL), Err(CaptionError::UnknownModel(_))));
        assert_eq!(model_type_options().last(), Some(&CUSTOM_MODEL));
    }

    #[test]
    fn test_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let m = ModelManager::new(dir.path()).unwrap().with_endpoint("https://hf-mirror.com/");
        let spec = find_model("fastvlm-0.5b").unwrap();
        assert_eq!(
            m.file_url(spec, &spec.files[2]),
            "https://hf-mirror.com/onnx-community/FastVLM-0.5B-ONNX/resolve/main/onnx/embed_tokens.onnx"
        );
    }

    #[tokio::test]
    async fn test_download_model_fetches_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = serve(|req| {
            let body = body_for(&req.path);
            Reply::ranged(&body, req.range_start)
        })
        .await;
        let m = manager(dir.path(), &server.base);
        assert!(!m.is_model_downloaded("fastvlm-0.5b"));

        let model_dir = m.ensure_model("fastvlm-0.5b").await.unwrap();
        let spec = find_model("fastvlm-0.5b").unwrap();
        assert_eq!(model_dir, dir.path().join("FastVLM-0.5B"));
        for file in spec.files {
            let expected = body_for(&format!("/{}/resolve/main/{}", spec.repo, file.remote));
            assert_eq!(std::fs::read(model_dir.join(file.name)).unwrap(), expected);
            assert!(!model_dir.join(format!("{}.part", file.name)).exists());
        }
        assert!(m.is_model_downloaded("fastvlm-0.5b"));

        let requests = server.requests();
        assert_eq!(requests, spec.files.len());
        m.ensure_model("fastvlm-0.5b").await.unwrap();
        assert_eq!(server.requests(), requests);
    }

    #[tokio::test]
    async fn test_partial_checkpoint_is_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let spec = find_model("fastvlm-0.5b").unwrap();
        let model_dir = dir.path().join(spec.display_name);
        std::fs::create_dir_all(&model_dir).unwrap();

        // every file but the tokenizer is already complete
        for file in spec.files.iter().filter(|f| f.name != "tokenizer.json") {
            std::fs::write(model_dir.join(file.name), b"done").unwrap();
        }
        let tokenizer_body = body_for(&format!("/{}/resolve/main/tokenizer.json", spec.repo));
        std::fs::write(model_dir.join("tokenizer.json.part"), &tokenizer_body[..700]).unwrap();

        let server = serve(|req| {
            let body = body_for(&req.path);
            Reply::ranged(&body, req.range_start)
        })
        .await;
        let m = manager(dir.path(), &server.base);
        assert_eq!(m.get_model_path("fastvlm-0.5b"), None);

        m.download_model("fastvlm-0.5b").await.unwrap();

        assert_eq!(server.ranges(), vec![700]);
        assert_eq!(
            std::fs::read(model_dir.join("tokenizer.json")).unwrap(),
            tokenizer_body
        );
    }

    #[tokio::test]
    async fn test_download_failure_names_model_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let server = serve(|_| Reply::status(404)).await;
        let m = manager(dir.path(), &server.base);

        let err = m.download_model("fastvlm-0.5b").await.unwrap_err();
        match &err {
            CaptionError::ModelDownload { model, dir: target, source } => {
                assert_eq!(model, "FastVLM-0.5B");
                assert_eq!(target, &dir.path().join("FastVLM-0.5B"));
                assert!(matches!(source, crate::qwenclip::error::DownloadError::RetriesExhausted { attempts: 2, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("手动下载"));
        assert_eq!(server.requests(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let m = ModelManager::new(dir.path()).unwrap();
        assert!(matches!(
            m.download_model("qwen-vl-9000").await,
            Err(CaptionError::UnknownModel(_))
        ));
    }
}
