use std::path::PathBuf;
use std::time::Duration;

/// Errors raised by the resumable downloader.
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    /// The request could not be sent or its headers were not received.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The body stream broke before EOF.
    #[error("error reading download stream: {0}")]
    Stream(#[source] reqwest::Error),

    /// The server answered with a status other than 200/206.
    #[error("download failed with status: {0}")]
    Status(reqwest::StatusCode),

    /// Local filesystem failure. Never retried.
    #[error("filesystem error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every attempt failed; `source` is the last cause.
    #[error(
        "failed to download {} after {attempts} attempts: {source}. \
         You can download the file manually and place it at this path.",
        .path.display()
    )]
    RetriesExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },
}

impl DownloadError {
    /// Whether the retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Request { .. } | DownloadError::Stream(_) | DownloadError::Status(_)
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the caption node and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum CaptionError {
    #[error("不支持的模型类型: {0}")]
    UnknownModel(String),

    #[error("模型目录不存在: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error(
        "模型下载失败 ({model}): {source}\n\
         请确保网络连接正常并可以访问 Hugging Face。\
         如果下载持续失败，可以手动下载模型文件并放置到 {} 目录下。",
        .dir.display()
    )]
    ModelDownload {
        model: String,
        dir: PathBuf,
        #[source]
        source: DownloadError,
    },

    #[error("模型加载失败: {0:#}")]
    ModelLoad(anyhow::Error),

    #[error("模型加载超时 ({}s)", .0.as_secs())]
    LoadTimeout(Duration),

    #[error("生成描述失败: {0:#}")]
    Generation(anyhow::Error),

    #[error("无效的图像张量: {0}")]
    InvalidImage(String),

    #[error("HTTP 客户端初始化失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("文件读写错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type CaptionResult<T> = std::result::Result<T, CaptionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_errors_keep_their_kind() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        let err = CaptionError::from(err);
        assert!(matches!(err, CaptionError::Http(_)));
        assert!(err.to_string().starts_with("HTTP 客户端初始化失败"));
    }

    #[test]
    fn test_caption_errors_read_in_chinese() {
        let not_found = CaptionError::ModelNotFound(PathBuf::from("/models/x"));
        assert_eq!(not_found.to_string(), "模型目录不存在: /models/x");
        let image = CaptionError::InvalidImage("empty".to_string());
        assert_eq!(image.to_string(), "无效的图像张量: empty");
        let io = CaptionError::from(std::io::Error::other("disk full"));
        assert_eq!(io.to_string(), "文件读写错误: disk full");
    }
}
