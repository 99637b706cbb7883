//! Image acquisition. Each source in the fallback chain can be switched
//! off, and concurrent sessions asking for the same image serialize on
//! a per-image lock so the archive is only downloaded and loaded once.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use webtask_core::{cache_dir, Service};

use crate::runtime::ContainerRuntime;

/// Which sources `ensure_image` may try, in order: local image, registry
/// pull, Dockerfile build, cached archive, archive download.
#[derive(Debug, Clone)]
pub struct ImagePolicy {
    pub use_local: bool,
    pub pull: bool,
    pub load_cached_archive: bool,
    pub download_archive: bool,
    pub build_dockerfile: bool,
    /// Directory holding one build context per service name, for the
    /// images we build rather than fetch.
    pub build_root: Option<PathBuf>,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        ImagePolicy {
            use_local: true,
            pull: true,
            load_cached_archive: true,
            download_archive: true,
            build_dockerfile: true,
            build_root: None,
        }
    }
}

impl ImagePolicy {
    /// No network: local images and cached archives only.
    pub fn offline() -> Self {
        ImagePolicy {
            pull: false,
            download_archive: false,
            ..ImagePolicy::default()
        }
    }
}

static IMAGE_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn image_lock(image: &str) -> Arc<Mutex<()>> {
    let mut locks = IMAGE_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(image.to_string()).or_default().clone()
}

fn archive_path(service: Service) -> PathBuf {
    cache_dir().join(format!("{}.tar", service.name()))
}

/// Make `service.image()` available to the runtime, walking the policy's
/// fallback chain. Errors report every source that was tried.
pub fn ensure_image(
    runtime: &dyn ContainerRuntime,
    service: Service,
    policy: &ImagePolicy,
) -> Result<()> {
    let image = service.image();
    let lock = image_lock(image);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    let mut attempts: Vec<String> = Vec::new();

    if policy.use_local {
        if runtime.image_exists(image)? {
            debug!(image, "image already present");
            return Ok(());
        }
        attempts.push("not present locally".to_string());
    }

    if policy.pull {
        info!(image, "pulling image");
        match runtime.pull_image(image) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(image, error = %e, "pull failed");
                attempts.push(format!("pull: {e}"));
            }
        }
    }

    if policy.build_dockerfile {
        if let Some(root) = &policy.build_root {
            let context = root.join(service.name());
            if context.join("Dockerfile").exists() {
                info!(image, context = %context.display(), "building image");
                match runtime.build_image(image, &context) {
                    Ok(()) => return Ok(()),
                    Err(e) => attempts.push(format!("build: {e}")),
                }
            } else {
                attempts.push(format!("no build context at {}", context.display()));
            }
        } else {
            attempts.push("no build root configured".to_string());
        }
    }

    if policy.load_cached_archive {
        let path = archive_path(service);
        if path.exists() {
            info!(image, path = %path.display(), "loading cached archive");
            match runtime.load_archive(&path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(image, error = %e, "cached archive load failed");
                    attempts.push(format!("cached archive: {e}"));
                }
            }
        } else {
            attempts.push("no cached archive".to_string());
        }
    }

    if policy.download_archive {
        if let Some(url) = service.download_url() {
            info!(image, url, "downloading image archive");
            match download_archive(service, url) {
                Ok(path) => match runtime.load_archive(&path) {
                    Ok(()) => return Ok(()),
                    Err(e) => attempts.push(format!("downloaded archive load: {e}")),
                },
                Err(e) => {
                    warn!(image, error = %e, "archive download failed");
                    attempts.push(format!("download: {e}"));
                }
            }
        } else {
            attempts.push("no archive published".to_string());
        }
    }

    Err(anyhow!(
        "could not obtain image '{}' for service '{}': {}",
        image,
        service.name(),
        attempts.join("; ")
    ))
}

fn download_archive(service: Service, url: &str) -> Result<PathBuf> {
    let path = archive_path(service);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating cache dir {}", parent.display()))?;
    }
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("fetching {url}"))?;
    let bytes = response.bytes().context("reading archive body")?;
    let tmp = path.with_extension("tar.partial");
    fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("moving archive into {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSpec, ExecOutput};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ScriptedRuntime {
        calls: StdMutex<Vec<String>>,
        local: bool,
        pull_ok: bool,
    }

    impl ScriptedRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl ContainerRuntime for ScriptedRuntime {
        fn image_exists(&self, _image: &str) -> Result<bool> {
            self.record("inspect");
            Ok(self.local)
        }
        fn pull_image(&self, _image: &str) -> Result<()> {
            self.record("pull");
            if self.pull_ok {
                Ok(())
            } else {
                Err(anyhow!("manifest unknown"))
            }
        }
        fn load_archive(&self, _path: &Path) -> Result<()> {
            self.record("load");
            Ok(())
        }
        fn build_image(&self, _tag: &str, _context: &Path) -> Result<()> {
            self.record("build");
            Ok(())
        }
        fn create_network(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn remove_network(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn connect_network(&self, _network: &str, _container: &str) -> Result<()> {
            Ok(())
        }
        fn disconnect_network(&self, _network: &str, _container: &str) -> Result<()> {
            Ok(())
        }
        fn run_detached(&self, _spec: &ContainerSpec) -> Result<String> {
            Ok("id".to_string())
        }
        fn exec(&self, _container: &str, _command: &[&str]) -> Result<ExecOutput> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        fn remove_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn local_image_short_circuits() {
        let runtime = ScriptedRuntime {
            local: true,
            ..Default::default()
        };
        ensure_image(&runtime, Service::SimpleWeb, &ImagePolicy::offline()).unwrap();
        assert_eq!(runtime.calls(), vec!["inspect"]);
    }

    #[test]
    fn pull_is_tried_after_local_miss() {
        let runtime = ScriptedRuntime {
            pull_ok: true,
            ..Default::default()
        };
        ensure_image(&runtime, Service::SimpleWeb, &ImagePolicy::default()).unwrap();
        assert_eq!(runtime.calls(), vec!["inspect", "pull"]);
    }

    #[test]
    fn exhausted_chain_reports_every_attempt() {
        let runtime = ScriptedRuntime::default();
        let policy = ImagePolicy {
            pull: false,
            load_cached_archive: false,
            download_archive: false,
            build_dockerfile: false,
            ..ImagePolicy::default()
        };
        let err = ensure_image(&runtime, Service::Homepage, &policy).unwrap_err();
        assert!(err.to_string().contains("webtask-homepage"));
        assert!(err.to_string().contains("not present locally"));
    }

    #[test]
    fn offline_policy_never_touches_the_network() {
        let runtime = ScriptedRuntime::default();
        // Loading fails only because there is no cached archive and no
        // build context, never because a pull was attempted.
        let policy = ImagePolicy {
            load_cached_archive: false,
            ..ImagePolicy::offline()
        };
        let _ = ensure_image(&runtime, Service::Wikipedia, &policy);
        assert!(!runtime.calls().contains(&"pull".to_string()));
    }
}
