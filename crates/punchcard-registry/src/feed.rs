use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use punchcard_core::{RegistryConfig, ReleaseDescriptor};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRelease {
    pub descriptor: ReleaseDescriptor,
    pub draft: bool,
    pub prerelease: bool,
}

pub trait ReleaseFeed: Send + Sync {
    fn latest_release(&self) -> Result<PublishedRelease>;
}

#[derive(Debug, Deserialize)]
struct GitHubReleasePayload {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    zipball_url: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAssetPayload>,
}

#[derive(Debug, Deserialize)]
struct GitHubAssetPayload {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubErrorPayload {
    message: String,
}

#[derive(Debug, Clone)]
pub struct GitHubReleaseFeed {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl GitHubReleaseFeed {
    pub fn new(config: &RegistryConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self {
            client,
            endpoint: latest_release_endpoint(config),
            token: config.token.clone(),
        })
    }
}

impl ReleaseFeed for GitHubReleaseFeed {
    fn latest_release(&self) -> Result<PublishedRelease> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .header(ACCEPT, "application/vnd.github+json")
            .header(
                USER_AGENT,
                format!("punchcard/{}", env!("CARGO_PKG_VERSION")),
            );
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .with_context(|| format!("failed to reach release registry: {}", self.endpoint))?;
        let status = response.status();
        debug!(endpoint = %self.endpoint, %status, "release registry responded");
        let body = response
            .text()
            .with_context(|| format!("failed to read registry response: {}", self.endpoint))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<GitHubErrorPayload>(&body)
                .map(|payload| payload.message)
                .unwrap_or_else(|_| body.chars().take(200).collect());
            return Err(anyhow!(
                "release registry returned {status} for {}: {detail}",
                self.endpoint
            ));
        }

        parse_github_release(&body)
    }
}

pub fn latest_release_endpoint(config: &RegistryConfig) -> String {
    format!(
        "{}/repos/{}/{}/releases/latest",
        config.api_base.trim_end_matches('/'),
        config.owner.trim(),
        config.repository.trim()
    )
}

pub fn parse_github_release(raw: &str) -> Result<PublishedRelease> {
    let payload: GitHubReleasePayload =
        serde_json::from_str(raw).context("malformed release payload")?;

    if payload.tag_name.trim().is_empty() {
        return Err(anyhow!("release payload has an empty tag_name"));
    }

    let published_at = match payload.published_at.as_deref() {
        Some(raw) if !raw.trim().is_empty() => Some(
            DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid published_at timestamp '{raw}'"))?
                .with_timezone(&Utc),
        ),
        _ => None,
    };

    let archive_asset = payload.assets.iter().find(|asset| is_archive_name(&asset.name));
    let (artifact_url, artifact_size, artifact_sha256) = match archive_asset {
        Some(asset) => (
            asset.browser_download_url.clone(),
            asset.size,
            asset
                .digest
                .as_deref()
                .and_then(|digest| digest.strip_prefix("sha256:"))
                .map(str::to_string),
        ),
        None => match payload.zipball_url.clone() {
            Some(url) if !url.trim().is_empty() => (url, None, None),
            _ => {
                return Err(anyhow!(
                    "release '{}' has no downloadable archive",
                    payload.tag_name
                ));
            }
        },
    };

    let descriptor = ReleaseDescriptor {
        tag: payload.tag_name.trim().to_string(),
        name: payload.name.unwrap_or_default(),
        notes: payload.body.unwrap_or_default(),
        published_at,
        artifact_url,
        artifact_size,
        artifact_sha256,
    };
    descriptor
        .version()
        .context("release tag is not a semantic version")?;

    Ok(PublishedRelease {
        descriptor,
        draft: payload.draft,
        prerelease: payload.prerelease,
    })
}

fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".zip") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz")
}
