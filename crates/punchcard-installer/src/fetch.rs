use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use punchcard_core::{RegistryConfig, TransferConfig};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use tracing::{debug, warn};

const RETRY_BACKOFF: Duration = Duration::from_millis(750);

pub trait ArtifactFetcher: Send + Sync {
    /// Downloads `url` to `dst` and returns the number of bytes written.
    fn fetch(&self, url: &str, dst: &Path) -> Result<u64>;
}

pub struct HttpFetcher {
    client: Client,
    max_attempts: u32,
}

impl HttpFetcher {
    pub fn new(registry: &RegistryConfig, transfer: &TransferConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("punchcard/{}", env!("CARGO_PKG_VERSION")))
                .context("invalid user agent header")?,
        );
        if let Some(token) = &registry.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("registry token contains characters not allowed in a header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(transfer.timeout())
            .default_headers(headers)
            .build()
            .context("failed to build download client")?;
        Ok(Self {
            client,
            max_attempts: transfer.max_attempts.max(1),
        })
    }

    fn fetch_once(&self, url: &str, part_path: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("download of {url} returned HTTP {status}"));
        }
        let expected = response.content_length();

        let file = File::create(part_path)
            .with_context(|| format!("failed to create {}", part_path.display()))?;
        let mut writer = BufWriter::new(file);
        let written = response
            .copy_to(&mut writer)
            .with_context(|| format!("download of {url} was interrupted"))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", part_path.display()))?;

        if let Some(expected) = expected {
            if expected != written {
                return Err(anyhow!(
                    "download of {url} ended after {written} of {expected} bytes"
                ));
            }
        }
        Ok(written)
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dst: &Path) -> Result<u64> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let part_path = dst.with_file_name(format!(
            "{}.part",
            dst.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("artifact")
        ));

        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            debug!(attempt, url, "downloading artifact");
            match self.fetch_once(url, &part_path) {
                Ok(written) => {
                    fs::rename(&part_path, dst).with_context(|| {
                        format!("failed to move downloaded artifact to {}", dst.display())
                    })?;
                    return Ok(written);
                }
                Err(err) => {
                    let _ = fs::remove_file(&part_path);
                    warn!(attempt, max_attempts = self.max_attempts, "download failed: {err:#}");
                    last_err = Some(err);
                    if attempt < self.max_attempts {
                        thread::sleep(RETRY_BACKOFF * attempt);
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow!("download of {url} was not attempted"))
            .context(format!(
                "download failed after {} attempt(s)",
                self.max_attempts
            )))
    }
}
