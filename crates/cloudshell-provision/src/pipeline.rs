use std::{path::PathBuf, time::Duration};

use cloudshell_core::{
    Config, Error, Result,
    config::config_path,
    env::{env_bool, env_string, env_string_or, env_u64},
};

use crate::{
    artifact::Artifact,
    extract::{decompress_image, extract_emulator},
    release::ReleaseSource,
    setup::{DEFAULT_SETUP_HOST, DEFAULT_SETUP_SCRIPT, ImageSetup, SetupTarget, run_image_setup},
    triplet::machine_triplet,
};

const DEFAULT_SETUP_BOOT_TIMEOUT_SEC: u64 = 30 * 60;

/// Fetch, unpack and prepare one release, then record it in the config file.
///
/// Steps run strictly in order and the first failure aborts the run. Every
/// step skips itself when its output already exists, so re-running after a
/// partial failure resumes where it stopped.
#[derive(Debug, Clone)]
pub struct Provisioner {
    pub cache_dir: PathBuf,
    pub config_path: PathBuf,
    pub source: ReleaseSource,
    pub setup: ImageSetup,
    pub setup_target: SetupTarget,
    pub host_os: String,
    pub host_arch: String,
}

pub fn is_production() -> bool {
    env_string("CLOUDSHELL_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production"))
}

impl Provisioner {
    pub fn from_env() -> Result<Self> {
        let production = is_production();
        let setup = if env_bool("CLOUDSHELL_SKIP_IMAGE_SETUP").unwrap_or(false) {
            ImageSetup::Skip
        } else if production {
            ImageSetup::Boot {
                marker: cloudshell_process::readiness::boot_marker(),
                boot_timeout: Duration::from_secs(
                    env_u64("CLOUDSHELL_SETUP_BOOT_TIMEOUT_SEC")
                        .map(|v| v.clamp(10, 24 * 60 * 60))
                        .unwrap_or(DEFAULT_SETUP_BOOT_TIMEOUT_SEC),
                ),
            }
        } else {
            // Dev mode: the guest is expected to be up already.
            ImageSetup::Attach
        };

        Ok(Self {
            cache_dir: PathBuf::from(env_string_or("CLOUDSHELL_CACHE_DIR", ".")),
            config_path: config_path(),
            source: ReleaseSource::from_env(production)?,
            setup,
            setup_target: SetupTarget {
                host: env_string_or("CLOUDSHELL_SETUP_HOST", DEFAULT_SETUP_HOST),
                script: PathBuf::from(env_string_or(
                    "CLOUDSHELL_SETUP_SCRIPT",
                    DEFAULT_SETUP_SCRIPT,
                )),
            },
            host_os: std::env::consts::OS.to_string(),
            host_arch: std::env::consts::ARCH.to_string(),
        })
    }

    pub async fn run(&self) -> Result<Config> {
        // Unsupported hosts fail here, before anything is downloaded.
        let triplet = machine_triplet(&self.host_os, &self.host_arch)?;
        tracing::info!(triplet, "detected host");

        let tag = self.source.resolve_latest_tag().await?;
        tracing::info!(%tag, "using release");

        let image = Artifact::image(&tag);
        let image_archive = self.source.fetch(&tag, &image, &self.cache_dir).await?;
        let image_path =
            decompress_image(&image_archive, &self.cache_dir.join(&image.decompressed_name))
                .await?;

        let emulator = Artifact::emulator(&tag, triplet);
        let emulator_archive = self.source.fetch(&tag, &emulator, &self.cache_dir).await?;
        let qemu_root = extract_emulator(
            &emulator_archive,
            &self.cache_dir.join(&emulator.decompressed_name),
        )
        .await?;

        let config = Config {
            image: std::path::absolute(&image_path).map_err(|e| Error::io(&image_path, e))?,
            qemu: std::path::absolute(&qemu_root).map_err(|e| Error::io(&qemu_root, e))?,
        };

        run_image_setup(&self.setup, &self.setup_target, &config.image, &config.qemu).await?;

        config.persist(&self.config_path)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::EMULATOR_ARCHIVE_ROOT;
    use crate::release::{PINNED_TAG, TagMode};
    use axum::{Router, extract::State, http::Uri};
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    };
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "cloudshell-pipeline-{test_name}-{}-{n}-{ts}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Release server that records every requested path.
    async fn release_server() -> (String, Arc<Mutex<Vec<String>>>) {
        release_server_with(b"payload".to_vec(), b"payload".to_vec()).await
    }

    /// Serves `image` for `.img.xz` paths and `emulator` for everything else.
    async fn release_server_with(
        image: Vec<u8>,
        emulator: Vec<u8>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        #[derive(Clone)]
        struct Fixture {
            log: Arc<Mutex<Vec<String>>>,
            image: Arc<Vec<u8>>,
            emulator: Arc<Vec<u8>>,
        }

        async fn serve(State(fx): State<Fixture>, uri: Uri) -> Vec<u8> {
            fx.log.lock().unwrap().push(uri.path().to_string());
            if uri.path().ends_with(".img.xz") {
                fx.image.to_vec()
            } else {
                fx.emulator.to_vec()
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let fixture = Fixture {
            log: log.clone(),
            image: Arc::new(image),
            emulator: Arc::new(emulator),
        };
        let app = Router::new().fallback(serve).with_state(fixture);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), log)
    }

    /// `(image.xz, emulator.tar.xz)` bytes built with the real tools.
    fn release_archives(dir: &std::path::Path) -> (Vec<u8>, Vec<u8>) {
        let build = dir.join("build");
        std::fs::create_dir_all(build.join("sdk/bin")).unwrap();
        std::fs::write(build.join("disk.img"), b"cheribsd disk").unwrap();
        std::fs::write(build.join("sdk/bin/qemu-system-morello"), b"#!qemu").unwrap();

        let xz = std::process::Command::new("xz")
            .arg("-z")
            .arg(build.join("disk.img"))
            .status()
            .unwrap();
        assert!(xz.success());
        let tar = std::process::Command::new("tar")
            .arg("-cJf")
            .arg(build.join("emu.tar.xz"))
            .arg("-C")
            .arg(&build)
            .arg("sdk")
            .status()
            .unwrap();
        assert!(tar.success());

        let out = (
            std::fs::read(build.join("disk.img.xz")).unwrap(),
            std::fs::read(build.join("emu.tar.xz")).unwrap(),
        );
        std::fs::remove_dir_all(&build).unwrap();
        out
    }

    fn modified(path: &std::path::Path) -> SystemTime {
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    fn provisioner(dir: &std::path::Path, base: &str, os: &str, arch: &str) -> Provisioner {
        Provisioner {
            cache_dir: dir.to_path_buf(),
            config_path: dir.join("cloudshell.json"),
            source: ReleaseSource::new(
                "cocoa-xu/cheribuild",
                "http://127.0.0.1:9",
                base,
                TagMode::Pinned(PINNED_TAG.to_string()),
            )
            .unwrap(),
            setup: ImageSetup::Skip,
            setup_target: SetupTarget::default(),
            host_os: os.to_string(),
            host_arch: arch.to_string(),
        }
    }

    #[tokio::test]
    async fn second_run_does_no_work() {
        let dir = temp_dir_for("idempotent");
        let (base, log) = release_server().await;
        let p = provisioner(&dir, &base, "linux", "x86_64");

        // Unpacked outputs exist; only the downloads are missing.
        std::fs::write(dir.join(format!("cheribsd-morello-purecap-{PINNED_TAG}.img")), b"disk")
            .unwrap();
        std::fs::create_dir_all(dir.join(format!("qemu-x86_64-linux-gnu-{PINNED_TAG}")).join("bin"))
            .unwrap();

        let first = p.run().await.unwrap();
        {
            let paths = log.lock().unwrap();
            assert_eq!(
                *paths,
                vec![
                    format!(
                        "/cocoa-xu/cheribuild/releases/download/{PINNED_TAG}/cheribsd-morello-purecap.img.xz"
                    ),
                    format!(
                        "/cocoa-xu/cheribuild/releases/download/{PINNED_TAG}/qemu-x86_64-linux-gnu.tar.xz"
                    ),
                ]
            );
        }

        let second = p.run().await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(first, second);
        assert!(first.image.is_absolute());
        assert!(first.qemu.is_absolute());
        assert_eq!(Config::load(&dir.join("cloudshell.json")).unwrap(), first);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn fresh_cache_unpacks_once() {
        let dir = temp_dir_for("fresh");
        let (image, emulator) = release_archives(&dir);
        let (base, log) = release_server_with(image, emulator).await;
        let p = provisioner(&dir, &base, "linux", "x86_64");

        let first = p.run().await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(std::fs::read(&first.image).unwrap(), b"cheribsd disk");
        assert_eq!(
            std::fs::read(first.qemu.join("bin/qemu-system-morello")).unwrap(),
            b"#!qemu"
        );
        let image_mtime = modified(&first.image);
        let qemu_mtime = modified(&first.qemu.join("bin/qemu-system-morello"));

        let second = p.run().await.unwrap();
        assert_eq!(second, first);
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(modified(&second.image), image_mtime);
        assert_eq!(modified(&second.qemu.join("bin/qemu-system-morello")), qemu_mtime);
        assert!(!dir.join(EMULATOR_ARCHIVE_ROOT).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unsupported_host_fails_before_download() {
        let dir = temp_dir_for("detect");
        let (base, log) = release_server().await;
        let p = provisioner(&dir, &base, "windows", "x86_64");

        let err = p.run().await.unwrap_err();
        assert!(matches!(err, Error::Detection { .. }));
        assert!(log.lock().unwrap().is_empty());
        assert!(!dir.join("cloudshell.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cached_image_skips_download_but_still_decompresses() {
        let dir = temp_dir_for("pinned-cache");
        let (base, log) = release_server().await;
        let p = provisioner(&dir, &base, "darwin", "arm64");

        let cached = dir.join("cheribsd-morello-purecap-v2024.02.28-400ab789.img.xz");
        std::fs::write(&cached, b"not an xz stream").unwrap();

        // The target is absent, so decompression runs and rejects the bogus archive.
        let err = p.run().await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert!(log.lock().unwrap().is_empty());
        assert!(!dir.join("cloudshell.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn network_failure_aborts_before_config() {
        let dir = temp_dir_for("network");
        let p = provisioner(&dir, "http://127.0.0.1:9", "linux", "arm64");

        let err = p.run().await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(!dir.join("cloudshell.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
