//! Session lifecycle: provision a private network, start every container
//! a task needs, wait until each answers, and tear the whole lot down
//! when the session ends or fails to come up.
//!
//! The session is the single owner of its containers. Environments hold
//! a [`webtask_core::Service`] id and go through [`ContainerSession::exec`]
//! rather than holding container handles of their own. The container set
//! only changes during `enter`, `reset_service`, and `close`, so the
//! session can be shared behind an `Arc` while task attempts run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use webtask_core::{Service, DEFAULT_BRIDGE_API_KEY, DEFAULT_NETWORK};

pub mod images;
pub mod runtime;

pub use images::ImagePolicy;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerCli, ExecOutput};

/// Docker's default bridge, used to grant a container temporary
/// outbound access during task setup.
const OUTBOUND_NETWORK: &str = "bridge";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the network the session creates and removes.
    pub network: String,
    /// Secret the browser bridge requires on every request.
    pub bridge_api_key: String,
    pub image_policy: ImagePolicy,
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    /// Pause after a service's post-start commands, so config rewrites
    /// like the shopping base-URL change settle before first use.
    pub post_start_settle: Duration,
    /// Publish container ports on the host. Off by default: the harness
    /// reaches services through the network, host ports are a debugging
    /// aid.
    pub publish_ports: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            network: DEFAULT_NETWORK.to_string(),
            bridge_api_key: DEFAULT_BRIDGE_API_KEY.to_string(),
            image_policy: ImagePolicy::default(),
            readiness_timeout: Duration::from_secs(180),
            readiness_poll_interval: Duration::from_secs(2),
            post_start_settle: Duration::from_secs(5),
            publish_ports: false,
        }
    }
}

/// A running set of task containers on a private network.
pub struct ContainerSession {
    runtime: Arc<dyn ContainerRuntime>,
    config: SessionConfig,
    /// Services with a live container, in start order.
    containers: Mutex<Vec<Service>>,
    network_created: AtomicBool,
}

impl ContainerSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_runtime(Arc::new(DockerCli), config)
    }

    pub fn with_runtime(runtime: Arc<dyn ContainerRuntime>, config: SessionConfig) -> Self {
        ContainerSession {
            runtime,
            config,
            containers: Mutex::new(Vec::new()),
            network_created: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn containers(&self) -> std::sync::MutexGuard<'_, Vec<Service>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Container names carry the network prefix so concurrent sessions
    /// on one host cannot collide. DNS inside the network still uses
    /// the bare service name, via the container hostname.
    fn container_name(&self, service: Service) -> String {
        format!("{}_{}", self.config.network, service.name())
    }

    pub fn is_running(&self, service: Service) -> bool {
        self.containers().contains(&service)
    }

    /// Bring up the network and every listed service. If anything fails,
    /// containers started so far and the network are removed before the
    /// error is returned, so a failed `enter` never leaks resources.
    pub fn enter(&self, services: &[Service]) -> Result<()> {
        match self.enter_inner(services) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "session startup failed, tearing down");
                self.close();
                Err(e)
            }
        }
    }

    fn enter_inner(&self, services: &[Service]) -> Result<()> {
        // A name clash usually means a crashed run left its network
        // behind. Surface it instead of reusing the stale network.
        self.runtime
            .create_network(&self.config.network)
            .with_context(|| {
                format!(
                    "creating network '{}' (remove it manually if a previous run left it behind)",
                    self.config.network
                )
            })?;
        self.network_created.store(true, Ordering::SeqCst);
        for &service in services {
            self.start_service(service)?;
        }
        for &service in services {
            self.wait_ready(service)?;
        }
        for &service in services {
            self.run_post_start(service)?;
        }
        info!(network = %self.config.network, count = services.len(), "session up");
        Ok(())
    }

    fn start_service(&self, service: Service) -> Result<()> {
        if self.is_running(service) {
            return Err(anyhow!(
                "service '{}' is already registered in this session",
                service
            ));
        }
        images::ensure_image(self.runtime.as_ref(), service, &self.config.image_policy)?;
        let mut spec = ContainerSpec {
            name: self.container_name(service),
            hostname: service.name().to_string(),
            image: service.image().to_string(),
            network: self.config.network.clone(),
            ..ContainerSpec::default()
        };
        if self.config.publish_ports {
            if let (Some(external), Some(internal)) =
                (service.external_port(), service.internal_port())
            {
                spec.ports.push((external, internal));
            }
        }
        match service {
            // Nothing keeps a bare shell image alive on its own.
            Service::Bash => {
                spec.command = vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
            }
            Service::BrowserBridge => {
                spec.env.push((
                    "BRIDGE_API_KEY".to_string(),
                    self.config.bridge_api_key.clone(),
                ));
            }
            _ => {}
        }
        info!(service = %service, image = %spec.image, "starting container");
        let id = self.runtime.run_detached(&spec)?;
        debug!(service = %service, id = %id, "container started");
        self.containers().push(service);
        Ok(())
    }

    /// Poll the service from inside its own container until it answers
    /// HTTP. Services without a probe port count as ready immediately.
    fn wait_ready(&self, service: Service) -> Result<()> {
        let Some(port) = service.probe_port() else {
            return Ok(());
        };
        let url = format!("http://localhost:{port}");
        let deadline = Instant::now() + self.config.readiness_timeout;
        loop {
            let out = self.runtime.exec(
                &self.container_name(service),
                &["wget", "--spider", "-q", &url],
            )?;
            if out.success() {
                debug!(service = %service, "ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "service '{}' did not become ready within {:?}",
                    service.name(),
                    self.config.readiness_timeout
                ));
            }
            std::thread::sleep(self.config.readiness_poll_interval);
        }
    }

    fn run_post_start(&self, service: Service) -> Result<()> {
        let commands = service.post_start_commands();
        if commands.is_empty() {
            return Ok(());
        }
        for command in &commands {
            let out = self
                .runtime
                .exec(&self.container_name(service), &["/bin/sh", "-c", command])?;
            if !out.success() {
                return Err(anyhow!(
                    "post-start command failed for '{}': {}",
                    service.name(),
                    out.stderr.trim()
                ));
            }
        }
        std::thread::sleep(self.config.post_start_settle);
        Ok(())
    }

    /// Restart one service's container with fresh image state.
    pub fn reset_service(&self, service: Service) -> Result<()> {
        {
            let mut containers = self.containers();
            if let Some(pos) = containers.iter().position(|s| *s == service) {
                containers.remove(pos);
                self.runtime.remove_container(&self.container_name(service))?;
            }
        }
        self.start_service(service)?;
        self.wait_ready(service)?;
        self.run_post_start(service)
    }

    /// Run a command in a service's container.
    pub fn exec(&self, service: Service, command: &[&str]) -> Result<ExecOutput> {
        if !self.is_running(service) {
            return Err(anyhow!("service '{}' is not part of this session", service));
        }
        self.runtime.exec(&self.container_name(service), command)
    }

    /// Attach the container to the host bridge so setup commands can
    /// reach the internet. Pair with [`Self::disable_outbound`].
    pub fn enable_outbound(&self, service: Service) -> Result<()> {
        self.runtime
            .connect_network(OUTBOUND_NETWORK, &self.container_name(service))
    }

    pub fn disable_outbound(&self, service: Service) -> Result<()> {
        self.runtime
            .disconnect_network(OUTBOUND_NETWORK, &self.container_name(service))
    }

    /// Remove every container and the network. Individual removal
    /// failures are logged, not propagated, so one stuck container does
    /// not leave the rest behind. Safe to call more than once.
    pub fn close(&self) {
        let drained: Vec<Service> = {
            let mut containers = self.containers();
            containers.drain(..).rev().collect()
        };
        for service in drained {
            if let Err(e) = self.runtime.remove_container(&self.container_name(service)) {
                warn!(service = %service, error = %e, "failed to remove container");
            }
        }
        if self.network_created.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.runtime.remove_network(&self.config.network) {
                warn!(network = %self.config.network, error = %e, "failed to remove network");
            }
        }
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// Records every runtime call; readiness probes fail for services
    /// listed in `never_ready`.
    #[derive(Default)]
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        hostnames: Mutex<Vec<String>>,
        never_ready: Vec<&'static str>,
    }

    impl FakeRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn image_exists(&self, _image: &str) -> Result<bool> {
            Ok(true)
        }
        fn pull_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }
        fn load_archive(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        fn build_image(&self, _tag: &str, _context: &Path) -> Result<()> {
            Ok(())
        }
        fn create_network(&self, name: &str) -> Result<()> {
            self.record(format!("network create {name}"));
            Ok(())
        }
        fn remove_network(&self, name: &str) -> Result<()> {
            self.record(format!("network rm {name}"));
            Ok(())
        }
        fn connect_network(&self, network: &str, container: &str) -> Result<()> {
            self.record(format!("network connect {network} {container}"));
            Ok(())
        }
        fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
            self.record(format!("network disconnect {network} {container}"));
            Ok(())
        }
        fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
            self.record(format!("run {}", spec.name));
            self.hostnames.lock().unwrap().push(spec.hostname.clone());
            Ok(format!("id-{}", spec.name))
        }
        fn exec(&self, container: &str, command: &[&str]) -> Result<ExecOutput> {
            self.record(format!("exec {container} {}", command.join(" ")));
            let ready = !self.never_ready.iter().any(|s| container.ends_with(s));
            Ok(ExecOutput {
                exit_code: if ready { 0 } else { 1 },
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        fn remove_container(&self, name: &str) -> Result<()> {
            self.record(format!("rm {name}"));
            Ok(())
        }
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            readiness_timeout: Duration::from_millis(0),
            readiness_poll_interval: Duration::from_millis(0),
            post_start_settle: Duration::from_millis(0),
            ..SessionConfig::default()
        }
    }

    /// Container name as the session builds it for the default network.
    fn cname(service: &str) -> String {
        format!("{DEFAULT_NETWORK}_{service}")
    }

    #[test]
    fn enter_starts_network_then_containers() {
        let runtime = Arc::new(FakeRuntime::default());
        let session = ContainerSession::with_runtime(runtime.clone(), quick_config());
        session
            .enter(&[Service::SimpleWeb, Service::BrowserBridge])
            .unwrap();
        let calls = runtime.calls();
        assert_eq!(calls[0], format!("network create {DEFAULT_NETWORK}"));
        assert!(calls.contains(&format!("run {}", cname("simple-web"))));
        assert!(calls.contains(&format!("run {}", cname("browser-bridge"))));
        assert!(session.is_running(Service::SimpleWeb));
        // Hostnames stay unprefixed so in-network DNS uses service names.
        let hostnames = runtime.hostnames.lock().unwrap().clone();
        assert!(hostnames.contains(&"simple-web".to_string()));
    }

    #[test]
    fn bash_needs_no_readiness_probe() {
        let runtime = Arc::new(FakeRuntime::default());
        let session = ContainerSession::with_runtime(runtime.clone(), quick_config());
        session.enter(&[Service::Bash]).unwrap();
        assert!(!runtime.calls().iter().any(|c| c.contains("wget")));
    }

    #[test]
    fn failed_readiness_tears_down_everything_once() {
        let runtime = Arc::new(FakeRuntime {
            never_ready: vec!["simple-web"],
            ..Default::default()
        });
        let session = ContainerSession::with_runtime(runtime.clone(), quick_config());
        let err = session
            .enter(&[Service::SimpleWeb, Service::Bash])
            .unwrap_err();
        assert!(err.to_string().contains("did not become ready"));
        let rm_web = format!("rm {}", cname("simple-web"));
        let rm_bash = format!("rm {}", cname("bash"));
        let calls = runtime.calls();
        assert_eq!(calls.iter().filter(|c| **c == rm_web).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == rm_bash).count(), 1);
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("network rm")).count(),
            1
        );
        assert!(!session.is_running(Service::SimpleWeb));
        drop(session);
        // Drop after the failed enter must not remove anything again.
        let calls = runtime.calls();
        assert_eq!(calls.iter().filter(|c| **c == rm_web).count(), 1);
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("network rm")).count(),
            1
        );
    }

    #[test]
    fn post_start_commands_settle_before_the_session_reports_up() {
        let runtime = Arc::new(FakeRuntime::default());
        let config = SessionConfig {
            post_start_settle: Duration::from_millis(25),
            ..quick_config()
        };
        let session = ContainerSession::with_runtime(runtime.clone(), config);
        let begin = Instant::now();
        session.enter(&[Service::Shopping]).unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(25));
        assert!(runtime.calls().iter().any(|c| c.contains("magento")));
        // Services without post-start commands take no settle pause.
        let runtime = Arc::new(FakeRuntime::default());
        let config = SessionConfig {
            network: "webtask_settle".to_string(),
            post_start_settle: Duration::from_secs(60),
            ..quick_config()
        };
        let session = ContainerSession::with_runtime(runtime, config);
        let begin = Instant::now();
        session.enter(&[Service::Bash]).unwrap();
        assert!(begin.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let runtime = Arc::new(FakeRuntime::default());
        let session = ContainerSession::with_runtime(runtime, quick_config());
        let err = session.enter(&[Service::Bash, Service::Bash]).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn exec_rejects_services_outside_the_session() {
        let runtime = Arc::new(FakeRuntime::default());
        let session = ContainerSession::with_runtime(runtime, quick_config());
        assert!(session.exec(Service::Bash, &["true"]).is_err());
    }

    #[test]
    fn reset_service_replaces_the_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let session = ContainerSession::with_runtime(runtime.clone(), quick_config());
        session.enter(&[Service::Bash]).unwrap();
        session.reset_service(Service::Bash).unwrap();
        let calls = runtime.calls();
        let rm = format!("rm {}", cname("bash"));
        let run = format!("run {}", cname("bash"));
        assert_eq!(calls.iter().filter(|c| **c == rm).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == run).count(), 2);
        assert!(session.is_running(Service::Bash));
    }

    #[test]
    fn close_removes_in_reverse_start_order() {
        let runtime = Arc::new(FakeRuntime::default());
        let session = ContainerSession::with_runtime(runtime.clone(), quick_config());
        session.enter(&[Service::SimpleWeb, Service::Bash]).unwrap();
        session.close();
        let calls = runtime.calls();
        let rm_bash = calls
            .iter()
            .position(|c| *c == format!("rm {}", cname("bash")))
            .unwrap();
        let rm_web = calls
            .iter()
            .position(|c| *c == format!("rm {}", cname("simple-web")))
            .unwrap();
        assert!(rm_bash < rm_web);
    }
}
