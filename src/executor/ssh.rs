use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing;

use crate::config::settings::SshSettings;
use crate::executor::quote::shell_quote;

pub type BoxReader<'a> = Box<dyn AsyncRead + Unpin + Send + 'a>;
pub type BoxWriter<'a> = Box<dyn AsyncWrite + Unpin + Send + 'a>;

/// Result of running a script on a remote host. A non-zero exit code is
/// reported here, not as an error.
#[derive(Debug, Clone, Default)]
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

/// Per-call options. When a writer is given for stdout or stderr, output is
/// streamed to it and the matching buffer in `ExecOutput` stays empty.
#[derive(Default)]
pub struct ExecOptions<'a> {
    identity: Option<PathBuf>,
    proxy_host: Option<String>,
    stdin: Option<BoxReader<'a>>,
    stdout: Option<BoxWriter<'a>>,
    stderr: Option<BoxWriter<'a>>,
}

impl<'a> ExecOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Some(path.into());
        self
    }

    /// Reach the target through `host` (containers are not directly
    /// routable).
    pub fn proxy_host(mut self, host: Option<&str>) -> Self {
        self.proxy_host = host.map(str::to_string);
        self
    }

    pub fn stdin(mut self, r: impl AsyncRead + Unpin + Send + 'a) -> Self {
        self.stdin = Some(Box::new(r));
        self
    }

    pub fn stdout(mut self, w: impl AsyncWrite + Unpin + Send + 'a) -> Self {
        self.stdout = Some(Box::new(w));
        self
    }

    pub fn stderr(mut self, w: impl AsyncWrite + Unpin + Send + 'a) -> Self {
        self.stderr = Some(Box::new(w));
        self
    }
}

// ─── Runner ─────────────────────────────────────────────────────────────────

/// Runs scripts on remote hosts as root through `ssh`. Cheap to clone; all
/// clones share the per-host session throttle.
#[derive(Debug, Clone)]
pub struct SshRunner {
    settings: SshSettings,
    throttle: Arc<HostThrottle>,
}

impl SshRunner {
    pub fn new(settings: &SshSettings) -> Self {
        Self {
            settings: settings.clone(),
            throttle: Arc::new(HostThrottle::new(settings.max_per_host)),
        }
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }

    /// Run `script` under `sudo -n bash -c` on `addr`.
    pub async fn run(
        &self,
        addr: &str,
        script: &str,
        opts: ExecOptions<'_>,
    ) -> Result<ExecOutput> {
        let throttle_key = opts.proxy_host.clone().unwrap_or_else(|| addr.to_string());
        let _permit = self
            .throttle
            .acquire(&throttle_key, self.settings.acquire_timeout)
            .await?;

        let mut args = self.common_args(opts.identity.as_deref(), opts.proxy_host.as_deref());
        args.push(format!("{}@{}", self.settings.user, addr));
        args.extend(
            ["sudo", "-n", "bash", "-c"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(shell_quote(script));

        tracing::debug!(host = addr, proxy = ?opts.proxy_host, "Running remote script");

        let mut cmd = Command::new(&self.settings.ssh_binary);
        cmd.args(&args)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to run {} for {}", self.settings.ssh_binary, addr))?;

        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take().context("ssh stdout not captured")?;
        let child_stderr = child.stderr.take().context("ssh stderr not captured")?;

        let feed = feed_stdin(opts.stdin, child_stdin);
        let out = pump(child_stdout, opts.stdout);
        let err = pump(child_stderr, opts.stderr);
        let (_, stdout, stderr) = tokio::try_join!(feed, out, err)
            .with_context(|| format!("transferring data over ssh to {}", addr))?;

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for ssh to {}", addr))?;
        let Some(exit_code) = status.code() else {
            bail!("ssh to {} terminated by signal", addr);
        };

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Copy local files into `dest` on the remote host with `scp -C`.
    pub async fn copy_to(
        &self,
        sources: &[&Path],
        addr: &str,
        dest: &str,
        identity: Option<&Path>,
        proxy_host: Option<&str>,
    ) -> Result<()> {
        let throttle_key = proxy_host.unwrap_or(addr).to_string();
        let _permit = self
            .throttle
            .acquire(&throttle_key, self.settings.acquire_timeout)
            .await?;

        let mut args = vec!["-C".to_string()];
        args.extend(self.common_args(identity, proxy_host));
        for source in sources {
            args.push(source.display().to_string());
        }
        args.push(format!("{}@{}:{}", self.settings.user, addr, dest));

        tracing::debug!(host = addr, dest = dest, files = sources.len(), "Copying files");

        let output = Command::new(&self.settings.scp_binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.settings.scp_binary))?;

        if !output.status.success() {
            bail!(
                "copying files to {}: scp exited {}: {}",
                addr,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn common_args(&self, identity: Option<&Path>, proxy_host: Option<&str>) -> Vec<String> {
        // v1 never populated host keys.
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ];
        if let Some(identity) = identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(host) = proxy_host {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={}", self.proxy_command(host, identity)));
        }
        args
    }

    fn proxy_command(&self, host: &str, identity: Option<&Path>) -> String {
        let mut words = vec![self.settings.ssh_binary.clone(), "-q".to_string()];
        if let Some(identity) = identity {
            words.push("-i".to_string());
            words.push(identity.display().to_string());
        }
        words.push("-o".to_string());
        words.push("StrictHostKeyChecking no".to_string());
        words.push("-o".to_string());
        words.push("UserKnownHostsFile /dev/null".to_string());
        words.push(format!("{}@{}", self.settings.user, host));
        words.push("nc %h %p".to_string());
        crate::executor::quote::shell_join(&words)
    }
}

async fn feed_stdin(
    input: Option<BoxReader<'_>>,
    child_stdin: Option<tokio::process::ChildStdin>,
) -> std::io::Result<()> {
    let (Some(mut input), Some(mut stdin)) = (input, child_stdin) else {
        return Ok(());
    };
    match tokio::io::copy(&mut input, &mut stdin).await {
        Ok(_) => {}
        // The remote side may exit before consuming everything.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
        Err(e) => return Err(e),
    }
    stdin.shutdown().await.or_else(|e| {
        if e.kind() == std::io::ErrorKind::BrokenPipe {
            Ok(())
        } else {
            Err(e)
        }
    })
}

async fn pump<R: AsyncRead + Unpin>(
    mut source: R,
    sink: Option<BoxWriter<'_>>,
) -> std::io::Result<Vec<u8>> {
    match sink {
        Some(mut sink) => {
            tokio::io::copy(&mut source, &mut sink).await?;
            sink.flush().await?;
            Ok(Vec::new())
        }
        None => {
            let mut buf = Vec::new();
            source.read_to_end(&mut buf).await?;
            Ok(buf)
        }
    }
}

// ─── Throttle ───────────────────────────────────────────────────────────────

/// Caps concurrent sessions per host. Proxied container sessions count
/// against their host machine.
#[derive(Debug)]
pub struct HostThrottle {
    max_per_host: usize,
    hosts: DashMap<String, Arc<Semaphore>>,
}

impl HostThrottle {
    pub fn new(max_per_host: usize) -> Self {
        Self {
            max_per_host: max_per_host.max(1),
            hosts: DashMap::new(),
        }
    }

    pub async fn acquire(
        &self,
        host: &str,
        timeout: std::time::Duration,
    ) -> Result<OwnedSemaphorePermit> {
        let semaphore = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone();

        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => bail!("SSH throttle for {:?} closed", host),
            Err(_) => bail!("timed out waiting for SSH throttling to {:?}", host),
        }
    }

    /// Permits currently free for `host`.
    pub fn available(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|s| s.available_permits())
            .unwrap_or(self.max_per_host)
    }
}
