use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use cloudshell_core::{Error, Result, env::env_string_or};

use crate::artifact::{Artifact, fetch_artifact};

pub const DEFAULT_REPO: &str = "cocoa-xu/cheribuild";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_DOWNLOAD_BASE: &str = "https://github.com";
pub const PINNED_TAG: &str = "v2024.02.28-400ab789";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagMode {
    /// Deterministic: never touches the network.
    Pinned(String),
    /// Ask the release listing API for the newest tag.
    Latest,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    git_ref: String,
}

/// Where release artifacts come from, and how the tag is chosen.
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    pub repo: String,
    pub api_base: String,
    pub download_base: String,
    pub mode: TagMode,
    client: reqwest::Client,
}

impl ReleaseSource {
    pub fn new(
        repo: impl Into<String>,
        api_base: impl Into<String>,
        download_base: impl Into<String>,
        mode: TagMode,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cloudshell-provision/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(format!("build http client: {e}")))?;

        Ok(Self {
            repo: repo.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            download_base: download_base.into().trim_end_matches('/').to_string(),
            mode,
            client,
        })
    }

    pub fn from_env(production: bool) -> Result<Self> {
        let mode = if production {
            TagMode::Latest
        } else {
            TagMode::Pinned(PINNED_TAG.to_string())
        };
        Self::new(
            env_string_or("CLOUDSHELL_RELEASE_REPO", DEFAULT_REPO),
            env_string_or("CLOUDSHELL_GITHUB_API", DEFAULT_API_BASE),
            env_string_or("CLOUDSHELL_DOWNLOAD_BASE", DEFAULT_DOWNLOAD_BASE),
            mode,
        )
    }

    pub fn tags_url(&self) -> String {
        format!("{}/repos/{}/git/refs/tags", self.api_base, self.repo)
    }

    pub fn artifact_url(&self, tag: &str, remote_name: &str) -> String {
        format!(
            "{}/{}/releases/download/{}/{}",
            self.download_base, self.repo, tag, remote_name
        )
    }

    pub async fn resolve_latest_tag(&self) -> Result<String> {
        match &self.mode {
            TagMode::Pinned(tag) => Ok(tag.clone()),
            TagMode::Latest => {
                let url = self.tags_url();
                let refs: Vec<GitRef> = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::Network(format!("list tags {url}: {e}")))?
                    .error_for_status()
                    .map_err(|e| Error::Network(format!("list tags {url}: {e}")))?
                    .json()
                    .await
                    .map_err(|e| Error::Network(format!("parse tag listing: {e}")))?;

                let tags: Vec<String> = refs
                    .into_iter()
                    .map(|r| {
                        r.git_ref
                            .strip_prefix("refs/tags/")
                            .unwrap_or(&r.git_ref)
                            .to_string()
                    })
                    .collect();

                select_latest_tag(&tags).ok_or_else(|| {
                    Error::Network(format!("no dated release tags among {} refs", tags.len()))
                })
            }
        }
    }

    /// Fetch one artifact of `tag` into `cache_dir`.
    pub async fn fetch(&self, tag: &str, artifact: &Artifact, cache_dir: &Path) -> Result<PathBuf> {
        let url = self.artifact_url(tag, &artifact.remote_name);
        fetch_artifact(&self.client, &url, &cache_dir.join(&artifact.cache_name)).await
    }
}

/// Sort key for `v<YYYY>.<MM>.<DD>-<suffix>` tags.
fn release_key(tag: &str) -> Option<(u32, u32, u32, &str)> {
    let rest = tag.strip_prefix('v')?;
    let (date, suffix) = rest.split_once('-').unwrap_or((rest, ""));
    let mut parts = date.split('.');
    let y = parts.next()?.parse().ok()?;
    let m = parts.next()?.parse().ok()?;
    let d = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((y, m, d, suffix))
}

/// Pick the newest dated tag regardless of listing order. Undated tags are ignored.
pub fn select_latest_tag(tags: &[String]) -> Option<String> {
    tags.iter()
        .filter_map(|t| release_key(t).map(|k| (k, t)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, t)| t.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn picks_newest_regardless_of_order() {
        let got = select_latest_tag(&tags(&[
            "v2024.02.28-400ab789",
            "v2024.11.03-aa11bb22",
            "v2023.12.31-ffffffff",
        ]));
        assert_eq!(got.as_deref(), Some("v2024.11.03-aa11bb22"));
    }

    #[test]
    fn compares_numerically_not_lexically() {
        let got = select_latest_tag(&tags(&["v2024.9.1-a", "v2024.10.1-b"]));
        assert_eq!(got.as_deref(), Some("v2024.10.1-b"));
    }

    #[test]
    fn ignores_undated_tags() {
        let got = select_latest_tag(&tags(&["nightly", "v2024.01.02-abc", "release-2"]));
        assert_eq!(got.as_deref(), Some("v2024.01.02-abc"));
        assert_eq!(select_latest_tag(&tags(&["nightly"])), None);
        assert_eq!(select_latest_tag(&[]), None);
    }

    #[test]
    fn artifact_url_is_deterministic() {
        let src = ReleaseSource::new(
            DEFAULT_REPO,
            DEFAULT_API_BASE,
            "https://github.com/",
            TagMode::Latest,
        )
        .unwrap();
        assert_eq!(
            src.artifact_url("v2024.02.28-400ab789", "qemu-x86_64-linux-gnu.tar.xz"),
            "https://github.com/cocoa-xu/cheribuild/releases/download/v2024.02.28-400ab789/qemu-x86_64-linux-gnu.tar.xz"
        );
        assert_eq!(
            src.tags_url(),
            "https://api.github.com/repos/cocoa-xu/cheribuild/git/refs/tags"
        );
    }

    #[tokio::test]
    async fn pinned_mode_needs_no_network() {
        let src = ReleaseSource::new(
            DEFAULT_REPO,
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            TagMode::Pinned(PINNED_TAG.to_string()),
        )
        .unwrap();
        assert_eq!(src.resolve_latest_tag().await.unwrap(), PINNED_TAG);
    }

    #[tokio::test]
    async fn latest_mode_reads_listing() {
        use axum::{Json, Router, routing::get};

        let app = Router::new().route(
            "/repos/cocoa-xu/cheribuild/git/refs/tags",
            get(|| async {
                Json(serde_json::json!([
                    { "ref": "refs/tags/v2024.11.03-aa11bb22" },
                    { "ref": "refs/tags/v2024.02.28-400ab789" },
                ]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let src = ReleaseSource::new(
            DEFAULT_REPO,
            format!("http://{addr}"),
            "http://127.0.0.1:9",
            TagMode::Latest,
        )
        .unwrap();
        assert_eq!(src.resolve_latest_tag().await.unwrap(), "v2024.11.03-aa11bb22");
    }

    #[tokio::test]
    async fn listing_failure_is_network_error() {
        let src = ReleaseSource::new(
            DEFAULT_REPO,
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            TagMode::Latest,
        )
        .unwrap();
        let err = src.resolve_latest_tag().await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
