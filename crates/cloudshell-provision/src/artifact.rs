use std::path::{Path, PathBuf};

use cloudshell_core::{Error, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

pub const IMAGE_STEM: &str = "cheribsd-morello-purecap";

/// One downloadable release file and where it lands locally.
///
/// Presence of `cache_name` / `decompressed_name` on disk is the only record
/// that a step already ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub remote_name: String,
    pub cache_name: String,
    pub decompressed_name: String,
}

impl Artifact {
    pub fn image(tag: &str) -> Self {
        Self {
            remote_name: format!("{IMAGE_STEM}.img.xz"),
            cache_name: format!("{IMAGE_STEM}-{tag}.img.xz"),
            decompressed_name: format!("{IMAGE_STEM}-{tag}.img"),
        }
    }

    pub fn emulator(tag: &str, triplet: &str) -> Self {
        Self {
            remote_name: format!("qemu-{triplet}.tar.xz"),
            cache_name: format!("qemu-{triplet}-{tag}.tar.xz"),
            decompressed_name: format!("qemu-{triplet}-{tag}"),
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.part", path.display()))
}

/// Download `url` into `cache_path` unless the file is already there.
///
/// The body is streamed into `<cache_path>.part` and renamed on completion,
/// so a failed transfer never leaves a file that looks cached. No retries.
pub async fn fetch_artifact(
    client: &reqwest::Client,
    url: &str,
    cache_path: &Path,
) -> Result<PathBuf> {
    if cache_path.exists() {
        tracing::info!(path = %cache_path.display(), "artifact cached, skipping download");
        return Ok(cache_path.to_path_buf());
    }

    if let Some(parent) = cache_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }

    tracing::info!(%url, path = %cache_path.display(), "downloading artifact");
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Network(format!("download {url}: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Network(format!("download {url}: {e}")))?;

    let tmp = tmp_path_for(cache_path);
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| Error::io(&tmp, e))?;
    let mut total: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                drop(f);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(Error::Network(format!("read body of {url}: {e}")));
            }
        };
        total = total.saturating_add(chunk.len() as u64);
        f.write_all(&chunk).await.map_err(|e| Error::io(&tmp, e))?;
    }
    f.flush().await.map_err(|e| Error::io(&tmp, e))?;
    drop(f);

    tokio::fs::rename(&tmp, cache_path)
        .await
        .map_err(|e| Error::io(cache_path, e))?;
    tracing::info!(bytes = total, path = %cache_path.display(), "artifact downloaded");
    Ok(cache_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, extract::State, http::StatusCode, http::Uri, response::IntoResponse};
    use std::sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    };
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "cloudshell-artifact-{test_name}-{}-{n}-{ts}",
            std::process::id()
        ))
    }

    async fn file_server(hits: Arc<AtomicUsize>) -> String {
        async fn serve(State(hits): State<Arc<AtomicUsize>>, uri: Uri) -> impl IntoResponse {
            hits.fetch_add(1, Ordering::SeqCst);
            if uri.path().ends_with("/missing.img.xz") {
                (StatusCode::NOT_FOUND, Vec::new())
            } else {
                (StatusCode::OK, b"artifact-bytes".to_vec())
            }
        }

        let app = Router::new().fallback(serve).with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn artifact_names_are_tag_qualified() {
        let img = Artifact::image("v2024.02.28-400ab789");
        assert_eq!(img.remote_name, "cheribsd-morello-purecap.img.xz");
        assert_eq!(
            img.cache_name,
            "cheribsd-morello-purecap-v2024.02.28-400ab789.img.xz"
        );
        assert_eq!(img.decompressed_name, "cheribsd-morello-purecap-v2024.02.28-400ab789.img");

        let emu = Artifact::emulator("v1", "x86_64-linux-gnu");
        assert_eq!(emu.remote_name, "qemu-x86_64-linux-gnu.tar.xz");
        assert_eq!(emu.cache_name, "qemu-x86_64-linux-gnu-v1.tar.xz");
        assert_eq!(emu.decompressed_name, "qemu-x86_64-linux-gnu-v1");
    }

    #[tokio::test]
    async fn downloads_once_then_serves_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = file_server(hits.clone()).await;
        let dir = temp_dir_for("once");
        let path = dir.join("image.img.xz");
        let client = reqwest::Client::new();
        let url = format!("{base}/image.img.xz");

        let got = fetch_artifact(&client, &url, &path).await.unwrap();
        assert_eq!(got, path);
        assert_eq!(std::fs::read(&path).unwrap(), b"artifact-bytes");
        assert!(!tmp_path_for(&path).exists());

        fetch_artifact(&client, &url, &path).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn http_error_is_network_error_and_leaves_no_file() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = file_server(hits).await;
        let dir = temp_dir_for("404");
        let path = dir.join("missing.img.xz");
        let client = reqwest::Client::new();

        let err = fetch_artifact(&client, &format!("{base}/missing.img.xz"), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(!path.exists());
        assert!(!tmp_path_for(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let dir = temp_dir_for("unreachable");
        let path = dir.join("x.img.xz");
        let client = reqwest::Client::new();
        let err = fetch_artifact(&client, "http://127.0.0.1:9/x.img.xz", &path)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn existing_cache_file_skips_network() {
        let dir = temp_dir_for("cached");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cheribsd-morello-purecap-v2024.02.28-400ab789.img.xz");
        std::fs::write(&path, b"already here").unwrap();

        // Port 9 (discard) is never listening in test environments.
        let client = reqwest::Client::new();
        let got = fetch_artifact(&client, "http://127.0.0.1:9/never", &path)
            .await
            .unwrap();
        assert_eq!(got, path);
        assert_eq!(std::fs::read(&path).unwrap(), b"already here");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
