// Checkpoint resolution.
// A checkpoint is either a filename ComfyUI can already see, or a URL we need to fetch first.
// Fetched checkpoints are cached by filename under models_dir, forever; there's no
// integrity or freshness check.

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info};
use reqwest::Url;

use crate::{config::FetchConfig, error::PredictError};

/// Downloads `url` to `dest`, returning once the file is complete.
pub trait Fetcher {
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<()>> + Send;
}

/// Runs an external download tool (pget, by default) as `<program> <args..> <url> <dest>`.
pub struct CommandFetcher {
    config: FetchConfig,
}

impl CommandFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }
}

impl Fetcher for CommandFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.config.program);
        command.args(&self.config.args).arg(url).arg(dest);
        debug!("Running {:?}", &command);
        let status = command
            .status()
            .await
            .with_context(|| format!("failed to run {}", self.config.program))?;
        if !status.success() {
            return Err(PredictError::CheckpointFetch {
                url: url.to_owned(),
                status,
            }
            .into());
        }
        Ok(())
    }
}

/// True for http(s) URLs, whatever the case of the scheme.
pub fn is_url(reference: &str) -> bool {
    Url::parse(reference).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

/// The local filename for a checkpoint URL: its last path segment.
pub fn url_filename(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid checkpoint URL {url}"))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| PredictError::InvalidCheckpointUrl(url.to_owned()).into())
}

pub struct CheckpointResolver<F> {
    models_dir: PathBuf,
    fetcher: F,
}

impl<F: Fetcher> CheckpointResolver<F> {
    pub fn new(models_dir: PathBuf, fetcher: F) -> Self {
        Self { models_dir, fetcher }
    }

    /// Returns the filename to put in the loader node.
    pub async fn resolve(&self, reference: &str) -> Result<String> {
        if !is_url(reference) {
            return Ok(reference.to_owned());
        }
        let filename = url_filename(reference)?;
        let dest = self.models_dir.join(&filename);
        let cached = tokio::fs::try_exists(&dest)
            .await
            .with_context(|| format!("failed to check for {}", dest.display()))?;
        if cached {
            info!("Checkpoint {} already present at {}", filename, dest.display());
            return Ok(filename);
        }

        tokio::fs::create_dir_all(&self.models_dir)
            .await
            .with_context(|| format!("failed to create {}", self.models_dir.display()))?;
        // Only complete downloads get the real name.
        let partial = self.models_dir.join(format!("{filename}.part"));
        info!("Downloading {} to {}", reference, dest.display());
        let fetched = self.fetcher.fetch(reference, &partial).await;
        if let Err(e) = fetched {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.context(format!("failed to download checkpoint {reference}")));
        }
        tokio::fs::rename(&partial, &dest)
            .await
            .with_context(|| format!("failed to move {} into place", partial.display()))?;
        info!("Downloaded {}", filename);
        Ok(filename)
    }
}
