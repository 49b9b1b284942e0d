//! Scoped ownership of the loaded model.
//!
//! A [`ModelSession`] holds the only live model handle in the process.
//! Dropping the session releases both the handle and the process-wide slot,
//! so a caption request cannot leak the model on an error path.

use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

use super::error::{CaptionError, CaptionResult};
use super::runtime::{LoadedModel, ModelRuntime};

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(300);

static SESSION_SLOT: Semaphore = Semaphore::const_new(1);

pub struct ModelSession {
    // field order matters: the model is dropped before the slot is freed
    model: Box<dyn LoadedModel>,
    model_dir: PathBuf,
    _slot: SemaphorePermit<'static>,
}

impl ModelSession {
    /// Load the model in `model_dir` on the blocking pool.
    ///
    /// Waiting for the slot and loading share one `load_timeout`. If the wait
    /// expires the load keeps running in the background and its handle is
    /// dropped as soon as it finishes.
    pub async fn acquire(
        runtime: Arc<dyn ModelRuntime>,
        model_dir: &Path,
        load_timeout: Duration,
    ) -> CaptionResult<Self> {
        let started = Instant::now();
        let dir = model_dir.to_path_buf();

        let load = async move {
            let slot = SESSION_SLOT
                .acquire()
                .await
                .map_err(|e| CaptionError::ModelLoad(e.into()))?;
            tracing::info!("正在加载模型: {}", dir.display());

            let handle = tokio::task::spawn_blocking(move || {
                let model = runtime.load(&dir)?;
                Ok::<_, anyhow::Error>(ModelSession {
                    model,
                    model_dir: dir,
                    _slot: slot,
                })
            });
            match handle.await {
                Ok(Ok(session)) => Ok::<_, CaptionError>(session),
                Ok(Err(e)) => Err(CaptionError::ModelLoad(e)),
                Err(join) => Err(CaptionError::ModelLoad(join.into())),
            }
        };

        match tokio::time::timeout(load_timeout, load).await {
            Ok(Ok(session)) => {
                tracing::info!(
                    "模型加载完成 ({:.2}s)",
                    started.elapsed().as_secs_f32()
                );
                Ok(session)
            }
            Ok(Err(e)) => {
                tracing::error!("{}", e);
                Err(e)
            }
            Err(_) => {
                tracing::error!("Model load exceeded {}s", load_timeout.as_secs());
                Err(CaptionError::LoadTimeout(load_timeout))
            }
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn generate(&mut self, image: &DynamicImage, prompt: &str) -> CaptionResult<String> {
        self.model
            .generate(image, prompt)
            .map_err(CaptionError::Generation)
    }
}

impl Drop for ModelSession {
    fn drop(&mut self) {
        tracing::info!("模型已卸载: {}", self.model_dir.display());
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime double that counts live handles and can be told to fail.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub response: String,
        pub load_delay: Duration,
        pub fail_load: bool,
        pub fail_generate: bool,
        pub loads: Arc<AtomicUsize>,
        pub live: Arc<AtomicUsize>,
        pub prompts: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl FakeRuntime {
        pub fn answering(response: &str) -> Self {
            Self {
                response: response.to_string(),
                ..Default::default()
            }
        }

        pub fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    struct FakeModel {
        response: String,
        fail: bool,
        live: Arc<AtomicUsize>,
        prompts: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl ModelRuntime for FakeRuntime {
        fn load(&self, _model_dir: &Path) -> Result<Box<dyn LoadedModel>> {
            std::thread::sleep(self.load_delay);
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_load {
                return Err(anyhow!("weights are corrupt"));
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeModel {
                response: self.response.clone(),
                fail: self.fail_generate,
                live: self.live.clone(),
                prompts: self.prompts.clone(),
            }))
        }
    }

    impl LoadedModel for FakeModel {
        fn generate(&mut self, _image: &DynamicImage, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                return Err(anyhow!("out of memory"));
            }
            Ok(self.response.clone())
        }
    }

    impl Drop for FakeModel {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
