use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::DownloadError;

pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Connect and read timeout applied to every request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One file to fetch. Immutable for the duration of a `download` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub url: String,
    pub destination_path: PathBuf,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl DownloadTarget {
    pub fn new(url: impl Into<String>, destination_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination_path: destination_path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Snapshot handed to the progress sink after every written chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
}

impl DownloadProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.downloaded as f64 / self.total as f64 * 100.0
        }
    }
}

pub type ProgressSink = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Mutable bookkeeping for a single `download` call.
///
/// Nothing here outlives the call: the partial file on disk is the only
/// checkpoint, and `bytes_on_disk` is always re-read from it after a failure.
#[derive(Debug, Default, Clone, Copy)]
struct DownloadState {
    bytes_on_disk: u64,
    total_expected: u64,
    attempt: u32,
}

/// HTTP downloader that resumes from the partial file with `Range` requests.
pub struct Downloader {
    client: Client,
    progress: Option<ProgressSink>,
}

impl Downloader {
    /// Downloader with the fixed 30s timeouts and console progress output.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .read_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            progress: Some(console_progress()),
        }
    }

    pub fn with_progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(&DownloadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(sink));
        self
    }

    /// Disable progress reporting entirely.
    pub fn quiet(mut self) -> Self {
        self.progress = None;
        self
    }

    /// Fetch `target.url` into `target.destination_path`, appending to any
    /// partial content already there.
    ///
    /// Network failures and unexpected statuses are retried up to
    /// `max_retries` times with a fixed `retry_delay` in between. Filesystem
    /// errors abort immediately. The partial file is never removed, so a later
    /// call resumes where this one stopped.
    pub async fn download(&self, target: &DownloadTarget) -> Result<(), DownloadError> {
        let path = target.destination_path.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let mut state = DownloadState {
            bytes_on_disk: on_disk_len(path).await?,
            ..Default::default()
        };
        if state.bytes_on_disk > 0 {
            println!(
                "发现已下载部分文件，尝试续传: {} ({} bytes)",
                path.display(),
                state.bytes_on_disk
            );
            info!(
                "Resuming {} from byte {}",
                path.display(),
                state.bytes_on_disk
            );
        }

        loop {
            let err = match self.attempt(target, &mut state).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            state.attempt += 1;
            state.bytes_on_disk = on_disk_len(path).await?;
            println!(
                "下载失败 (尝试 {}/{}): {}",
                state.attempt, target.max_retries, err
            );
            warn!(
                "Download attempt {} of {} for {} failed: {}",
                state.attempt,
                target.max_retries + 1,
                target.url,
                err
            );

            if state.attempt > target.max_retries {
                return Err(DownloadError::RetriesExhausted {
                    path: path.to_path_buf(),
                    attempts: state.attempt,
                    source: Box::new(err),
                });
            }

            println!("{}秒后重试...", target.retry_delay.as_secs_f32());
            tokio::time::sleep(target.retry_delay).await;
        }
    }

    async fn attempt(
        &self,
        target: &DownloadTarget,
        state: &mut DownloadState,
    ) -> Result<(), DownloadError> {
        let path = target.destination_path.as_path();
        let offset = state.bytes_on_disk;

        let response = self
            .client
            .get(&target.url)
            .header(RANGE, format!("bytes={}-", offset))
            .send()
            .await
            .map_err(|source| DownloadError::Request {
                url: target.url.clone(),
                source,
            })?;

        let status = response.status();
        let remaining = response.content_length();
        debug!(
            "GET {} (offset {}): {} content-length {:?}",
            target.url, offset, status, remaining
        );

        match status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if offset > 0 && remaining == Some(0) => {
                info!("{} is already complete", path.display());
                return Ok(());
            }
            StatusCode::OK if offset > 0 => {
                // Range was ignored and the whole resource is coming back.
                warn!(
                    "Server ignored Range for {}, restarting from byte 0",
                    target.url
                );
                tokio::fs::File::create(path)
                    .await
                    .map_err(|e| DownloadError::io(path, e))?;
                state.bytes_on_disk = 0;
            }
            StatusCode::OK => {}
            StatusCode::RANGE_NOT_SATISFIABLE
                if offset > 0 && content_range_total(response.headers()) == Some(offset) =>
            {
                info!("{} is already complete", path.display());
                return Ok(());
            }
            other => return Err(DownloadError::Status(other)),
        }

        let base = state.bytes_on_disk;
        state.total_expected = remaining.map_or(0, |r| r + base);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;

        let mut downloaded = base;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(DownloadError::Stream)?;
            for piece in chunk.chunks(target.chunk_size.max(1)) {
                file.write_all(piece)
                    .await
                    .map_err(|e| DownloadError::io(path, e))?;
                file.flush().await.map_err(|e| DownloadError::io(path, e))?;

                downloaded += piece.len() as u64;
                state.bytes_on_disk = downloaded;

                if state.total_expected > 0 {
                    self.report(&DownloadProgress {
                        downloaded,
                        total: state.total_expected,
                    });
                }
            }
        }

        info!(
            "Downloaded {} ({} bytes)",
            path.display(),
            state.bytes_on_disk
        );
        Ok(())
    }

    fn report(&self, progress: &DownloadProgress) {
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }
}

async fn on_disk_len(path: &Path) -> Result<u64, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

/// Total length from a `Content-Range: bytes */N` (or `bytes a-b/N`) header.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Suppresses repeated console lines for the same tenth of a percent.
///
/// A finished download is always reported and resets the throttle, so the
/// next file starts fresh even when one sink serves several downloads.
struct ConsoleThrottle {
    last: AtomicU64,
}

impl ConsoleThrottle {
    fn new() -> Self {
        Self {
            last: AtomicU64::new(u64::MAX),
        }
    }

    fn should_print(&self, p: &DownloadProgress) -> bool {
        if p.downloaded >= p.total {
            self.last.store(u64::MAX, Ordering::Relaxed);
            return true;
        }
        let permille = (p.percent() * 10.0) as u64;
        self.last.swap(permille, Ordering::Relaxed) != permille
    }
}

/// Progress sink printing a single updating line to stdout.
pub fn console_progress() -> ProgressSink {
    let throttle = ConsoleThrottle::new();
    Arc::new(move |p: &DownloadProgress| {
        if !throttle.should_print(p) {
            return;
        }
        print!(
            "\r下载进度: {:.1}% ({}/{} bytes)",
            p.percent(),
            p.downloaded,
            p.total
        );
        if p.downloaded >= p.total {
            println!();
        }
        let _ = std::io::stdout().flush();
    })
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP/1.1 server for exercising the downloader.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub struct Reply {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
        pub declared_length: Option<usize>,
        pub cut_after: Option<usize>,
    }

    impl Reply {
        pub fn new(status: u16, body: Vec<u8>) -> Self {
            let len = body.len();
            Self {
                status,
                headers: Vec::new(),
                body,
                declared_length: Some(len),
                cut_after: None,
            }
        }

        pub fn status(status: u16) -> Self {
            Self::new(status, Vec::new())
        }

        /// 200 for a request from byte 0, 206 with the tail otherwise.
        pub fn ranged(resource: &[u8], start: u64) -> Self {
            let start = (start as usize).min(resource.len());
            if start == 0 {
                Self::new(200, resource.to_vec())
            } else {
                Self::new(206, resource[start..].to_vec()).header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, resource.len() - 1, resource.len()),
                )
            }
        }

        pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
            self.headers.push((name.to_string(), value.into()));
            self
        }

        /// Send the body without a `Content-Length` header.
        pub fn without_length(mut self) -> Self {
            self.declared_length = None;
            self
        }

        /// Close the connection after `n` body bytes while still declaring the full length.
        pub fn cut_after(mut self, n: usize) -> Self {
            self.cut_after = Some(n);
            self
        }
    }

    pub struct TestServer {
        pub base: String,
        pub url: String,
        requests: Arc<AtomicUsize>,
        ranges: Arc<Mutex<Vec<u64>>>,
    }

    impl TestServer {
        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        /// Range start of every request received, in order.
        pub fn ranges(&self) -> Vec<u64> {
            self.ranges.lock().unwrap().clone()
        }
    }

    pub struct Request {
        pub index: usize,
        pub path: String,
        pub range_start: u64,
    }

    /// Serve every connection with `handler`, one response per connection.
    pub async fn serve<F>(handler: F) -> TestServer
    where
        F: Fn(&Request) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let url = format!("{}/f.bin", base);
        let requests = Arc::new(AtomicUsize::new(0));
        let ranges = Arc::new(Mutex::new(Vec::new()));

        let (req_count, seen) = (requests.clone(), ranges.clone());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let head = read_head(&mut socket).await;
                let request = Request {
                    index: req_count.fetch_add(1, Ordering::SeqCst),
                    path: head.split_whitespace().nth(1).unwrap_or("/").to_string(),
                    range_start: range_start(&head),
                };
                seen.lock().unwrap().push(request.range_start);

                let reply = handler(&request);
                let mut out = format!("HTTP/1.1 {} Test\r\nConnection: close\r\n", reply.status);
                if let Some(len) = reply.declared_length {
                    out.push_str(&format!("Content-Length: {}\r\n", len));
                }
                for (name, value) in &reply.headers {
                    out.push_str(&format!("{}: {}\r\n", name, value));
                }
                out.push_str("\r\n");

                let body_len = reply.cut_after.unwrap_or(reply.body.len()).min(reply.body.len());
                let _ = socket.write_all(out.as_bytes()).await;
                let _ = socket.write_all(&reply.body[..body_len]).await;
                let _ = socket.flush().await;
                let _ = socket.shutdown().await;
            }
        });

        TestServer {
            base,
            url,
            requests,
            ranges,
        }
    }

    async fn read_head(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn range_start(head: &str) -> u64 {
        head.lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if !name.eq_ignore_ascii_case("range") {
                    return None;
                }
                value.trim().strip_prefix("bytes=")?.trim_end_matches('-').parse().ok()
            })
            .unwrap_or(0)
    }

    pub fn resource(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }
}
