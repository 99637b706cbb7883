//! Thin seam over the container engine. Production code drives the
//! `docker` CLI; tests substitute an in-memory fake.

use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Result};

/// What to run and how to wire it onto the session network.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    /// Network hostname. Defaults to the container name when empty.
    pub hostname: String,
    pub image: String,
    pub network: String,
    /// (host, container) port pairs to publish.
    pub ports: Vec<(u16, u16)>,
    pub env: Vec<(String, String)>,
    /// Override the image entrypoint, e.g. a keep-alive for shell
    /// containers. Empty means run the image as-is.
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait ContainerRuntime: Send + Sync {
    fn image_exists(&self, image: &str) -> Result<bool>;
    fn pull_image(&self, image: &str) -> Result<()>;
    fn load_archive(&self, path: &Path) -> Result<()>;
    fn build_image(&self, tag: &str, context: &Path) -> Result<()>;
    fn create_network(&self, name: &str) -> Result<()>;
    fn remove_network(&self, name: &str) -> Result<()>;
    fn connect_network(&self, network: &str, container: &str) -> Result<()>;
    fn disconnect_network(&self, network: &str, container: &str) -> Result<()>;
    /// Start a detached container and return its id.
    fn run_detached(&self, spec: &ContainerSpec) -> Result<String>;
    fn exec(&self, container: &str, command: &[&str]) -> Result<ExecOutput>;
    fn remove_container(&self, name: &str) -> Result<()>;
}

/// Drives a local `docker` binary through its CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerCli;

fn run_checked(mut cmd: Command, step: &str) -> Result<std::process::Output> {
    let out = cmd.output()?;
    if out.status.success() {
        return Ok(out);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        "command exited non-zero".to_string()
    };
    Err(anyhow!("{}: {}", step, detail))
}

impl ContainerRuntime for DockerCli {
    fn image_exists(&self, image: &str) -> Result<bool> {
        let out = Command::new("docker")
            .args(["image", "inspect", image])
            .output()?;
        Ok(out.status.success())
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["pull", image]);
        run_checked(cmd, "docker pull failed")?;
        Ok(())
    }

    fn load_archive(&self, path: &Path) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.arg("load").arg("-i").arg(path);
        run_checked(cmd, "docker load failed")?;
        Ok(())
    }

    fn build_image(&self, tag: &str, context: &Path) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["build", "-t", tag]).arg(context);
        run_checked(cmd, "docker build failed")?;
        Ok(())
    }

    fn create_network(&self, name: &str) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["network", "create", name]);
        run_checked(cmd, "docker network create failed")?;
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["network", "rm", name]);
        run_checked(cmd, "docker network rm failed")?;
        Ok(())
    }

    fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["network", "connect", network, container]);
        run_checked(cmd, "docker network connect failed")?;
        Ok(())
    }

    fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["network", "disconnect", network, container]);
        run_checked(cmd, "docker network disconnect failed")?;
        Ok(())
    }

    fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &spec.name, "--network", &spec.network]);
        let hostname = if spec.hostname.is_empty() {
            &spec.name
        } else {
            &spec.hostname
        };
        cmd.args(["--hostname", hostname]);
        for (host, container) in &spec.ports {
            cmd.args(["-p", &format!("{host}:{container}")]);
        }
        for (key, value) in &spec.env {
            cmd.args(["-e", &format!("{key}={value}")]);
        }
        cmd.arg(&spec.image);
        for part in &spec.command {
            cmd.arg(part);
        }
        let out = run_checked(cmd, "docker run failed")?;
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if id.is_empty() {
            return Err(anyhow!("docker run failed: missing container id"));
        }
        Ok(id)
    }

    fn exec(&self, container: &str, command: &[&str]) -> Result<ExecOutput> {
        let mut cmd = Command::new("docker");
        cmd.arg("exec").arg(container);
        for part in command {
            cmd.arg(part);
        }
        let out = cmd.output()?;
        Ok(ExecOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["rm", "-f", name]);
        run_checked(cmd, "docker rm failed")?;
        Ok(())
    }
}
