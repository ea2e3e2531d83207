//! Subprocess lifecycle for installed services.
//!
//! Each instance moves through Stopped -> Starting -> Running ->
//! Stopped. `pid` is set exactly while a handshake-confirmed
//! subprocess is alive, and the `starting` state on the instance
//! guarantees at most one launch attempt is outstanding at a time.
//!
//! The startup protocol is line oriented: the manager writes one JSON
//! object to the child's stdin (suggested port, working directory,
//! locker URL) and the child answers with one JSON object on stdout
//! acknowledging the port it actually listens on. Everything after
//! that first line, and the whole of stderr, is treated as opaque log
//! text relabeled with the service title.

use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::registry::{InstalledService, SharedRegistry, StartingState};
use crate::shutdown::ShutdownCoordinator;

/// Startup payload written to the child's stdin as a single line.
#[derive(Debug, Serialize)]
struct StartupRequest<'a> {
    /// Suggested port; the child may answer with a different one.
    port: u32,
    #[serde(rename = "workingDirectory")]
    working_directory: String,
    #[serde(rename = "lockerUrl")]
    locker_url: &'a str,
}

pub struct ProcessSupervisor {
    registry: SharedRegistry,
    config: Arc<Config>,
    shutdown: Arc<ShutdownCoordinator>,
    /// Monotonic suggested-port counter, seeded from configuration
    /// and shared process-wide. Values are never reused.
    next_port: AtomicU32,
}

impl ProcessSupervisor {
    pub fn new(
        registry: SharedRegistry,
        config: Arc<Config>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let next_port = AtomicU32::new(config.service_port_seed());
        Self {
            registry,
            config,
            shutdown,
            next_port,
        }
    }

    /// Request that the service with `id` be started. An unknown id
    /// is logged and ignored. If the service is already running this
    /// is a no-op and `notify` is dropped without firing; callers
    /// should check `is_running` first. If a spawn attempt is already
    /// in flight, `notify` joins the FIFO queue served when the
    /// handshake completes.
    pub async fn spawn(self: &Arc<Self>, id: &str, notify: Option<oneshot::Sender<()>>) {
        {
            let mut registry = self.registry.lock().await;
            let Some(service) = registry.installed.get_mut(id) else {
                error!("Attempting to spawn an unknown service {}", id);
                return;
            };

            if service.pid.is_some() {
                debug!("{} is already running", id);
                return;
            }

            if let Some(starting) = service.starting.as_mut() {
                info!("{} is still spawning, adding waiter to queue", id);
                if let Some(tx) = notify {
                    starting.waiters.push_back(tx);
                }
                return;
            }

            service.starting = Some(StartingState::new(notify));
        }

        self.clone().start_attempt(id.to_string()).await;
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.registry.lock().await.is_running(id)
    }

    pub async fn is_installed(&self, id: &str) -> bool {
        self.registry.lock().await.is_installed(id)
    }

    pub async fn meta_info(&self, id: &str) -> Option<InstalledService> {
        self.registry
            .lock()
            .await
            .meta_info(id)
            .map(|s| s.sterilized())
    }

    /// One launch attempt. Allocates the next suggested port, spawns
    /// the subprocess from the descriptor's source directory, persists
    /// the record (without pid) and hands the child the startup
    /// request on stdin. The handshake itself is awaited by the
    /// monitor task.
    async fn start_attempt(self: Arc<Self>, id: String) {
        let mut registry = self.registry.lock().await;
        let me_dir = registry.me_dir().to_path_buf();
        let Some(service) = registry.installed.get_mut(&id) else {
            return;
        };
        if service.pid.is_some() || service.starting.is_none() {
            return;
        }

        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        service.port = Some(port);

        let working_directory = me_dir.join(&id).to_string_lossy().into_owned();
        let locker_url = self.config.locker_url();
        let request = StartupRequest {
            port,
            working_directory,
            locker_url: &locker_url,
        };

        let mut parts = service.descriptor.run.split_whitespace();
        let Some(program) = parts.next() else {
            error!("{} has an empty run command", id);
            service.starting = None;
            return;
        };
        let args: Vec<&str> = parts.collect();

        info!("Spawning {} into {}/{}", id, me_dir.display(), id);
        let mut child = match Command::new(program)
            .args(&args)
            .current_dir(&service.descriptor.src_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to launch {}: {}", id, e);
                // Waiters are dropped with the starting state, which
                // signals them that the start failed.
                service.starting = None;
                return;
            }
        };

        let token = CancellationToken::new();
        service.term = Some(token.clone());

        if let Err(e) = service.persist(&me_dir).await {
            warn!("Could not persist record for {}: {}", id, e);
        }

        let label = service.log_label();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        drop(registry);

        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(label.clone(), stderr));
        }

        let mut stdin = match stdin {
            Some(stdin) => stdin,
            None => {
                error!("No stdin pipe for {}", id);
                let _ = child.start_kill();
                return;
            }
        };
        match serde_json::to_string(&request) {
            Ok(line) => {
                if let Err(e) = stdin.write_all(format!("{}\n", line).as_bytes()).await {
                    warn!("Could not write startup request to {}: {}", id, e);
                }
            }
            Err(e) => warn!("Could not encode startup request for {}: {}", id, e),
        }

        tokio::spawn(self.clone().supervise(id, label, child, stdin, stdout, token));
    }

    /// Own the child for its whole lifetime: await the handshake,
    /// relay the rest of stdout as logs, then handle the exit.
    async fn supervise(
        self: Arc<Self>,
        id: String,
        label: String,
        mut child: Child,
        stdin: ChildStdin,
        stdout: Option<ChildStdout>,
        token: CancellationToken,
    ) {
        let mut handshaken = false;
        let mut terminated = false;

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();

            // Phase 1: exactly one structured line under a deadline.
            match time::timeout(self.config.handshake_timeout(), lines.next_line()).await {
                Ok(Ok(Some(line))) => match parse_handshake(&line) {
                    Ok(confirmed_port) => {
                        self.complete_handshake(&id, child.id(), confirmed_port).await;
                        handshaken = true;
                    }
                    Err(reason) => {
                        // Stays Starting with its queue intact: no
                        // automatic retry on a malformed handshake.
                        error!(
                            "{} did not return valid startup information: {}",
                            id, reason
                        );
                        let _ = child.start_kill();
                    }
                },
                Ok(Ok(None)) => {
                    // The subprocess is already gone. End the starting
                    // episode so queued waiters fail and a later spawn
                    // can try again.
                    error!("{} closed stdout before its startup handshake", id);
                    self.fail_starting(&id).await;
                }
                Ok(Err(e)) => {
                    error!("Error reading startup handshake from {}: {}", id, e);
                    let _ = child.start_kill();
                }
                Err(_) => {
                    error!(
                        "{} missed its startup handshake deadline ({}s)",
                        id, self.config.handshake_timeout_seconds
                    );
                    let _ = child.start_kill();
                    self.fail_starting(&id).await;
                }
            }

            // Phase 2: plain log passthrough, never parsed again.
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if handshaken {
                                info!(service = %label, "{}", line);
                            }
                        }
                        _ => break,
                    },
                    _ = token.cancelled(), if !terminated => {
                        terminated = true;
                        if let Err(e) = child.start_kill() {
                            // Signal delivery failure is non-fatal;
                            // the process is likely already gone.
                            debug!("Could not terminate {}: {}", id, e);
                        }
                    }
                }
            }
        }

        // The read loop ends on stdout EOF, which a live child can
        // cause by closing its own stdout. Termination must still
        // reach the process until it is actually gone.
        let status = tokio::select! {
            status = child.wait() => status,
            _ = token.cancelled(), if !terminated => {
                if let Err(e) = child.start_kill() {
                    debug!("Could not terminate {}: {}", id, e);
                }
                child.wait().await
            }
        };
        drop(stdin);
        match status {
            Ok(status) => info!("{} process has ended ({})", id, status),
            Err(e) => warn!("{} process has ended (wait failed: {})", id, e),
        }
        self.handle_exit(&id).await;
    }

    /// The first stdout line parsed: the service is now Running. A
    /// reported port overrides the suggestion, pid is recorded and
    /// every queued waiter is notified in FIFO order.
    async fn complete_handshake(&self, id: &str, pid: Option<u32>, confirmed_port: Option<u32>) {
        let mut registry = self.registry.lock().await;
        let me_dir = registry.me_dir().to_path_buf();
        let Some(service) = registry.installed.get_mut(id) else {
            return;
        };

        if let Some(port) = confirmed_port {
            service.port = Some(port);
        }
        if let Some(port) = service.port {
            service.uri_local = Some(format!("http://localhost:{}/", port));
        }
        service.pid = pid;

        if let Err(e) = service.persist(&me_dir).await {
            warn!("Could not persist record for {}: {}", id, e);
        }

        info!("{} started, running startup callbacks", id);
        if let Some(mut starting) = service.starting.take() {
            while let Some(tx) = starting.waiters.pop_front() {
                let _ = tx.send(());
            }
        }
    }

    /// The starting episode failed before a handshake (deadline
    /// exceeded or the subprocess died): the queued waiters are
    /// failed and a later spawn can try again.
    async fn fail_starting(&self, id: &str) {
        let mut registry = self.registry.lock().await;
        if let Some(service) = registry.installed.get_mut(id) {
            service.starting = None;
        }
    }

    /// Subprocess exit, any code. Clears pid, persists and re-checks
    /// the shutdown barrier.
    async fn handle_exit(&self, id: &str) {
        {
            let mut registry = self.registry.lock().await;
            let me_dir = registry.me_dir().to_path_buf();
            let Some(service) = registry.installed.get_mut(id) else {
                return;
            };

            service.pid = None;
            service.term = None;

            if let Err(e) = service.persist(&me_dir).await {
                warn!("Could not persist record for {}: {}", id, e);
            }
        }

        self.shutdown.check(&self.registry).await;
    }
}

/// The first line must be exactly one JSON object; a `port` member,
/// when present, is the port the service actually listens on.
fn parse_handshake(line: &str) -> Result<Option<u32>, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| e.to_string())?;
    let object = value
        .as_object()
        .ok_or_else(|| "handshake is not a JSON object".to_string())?;
    Ok(object
        .get("port")
        .and_then(|v| v.as_u64())
        .map(|p| p as u32))
}

/// stderr is always unstructured log text, relabeled with the service
/// title for the entire subprocess lifetime.
async fn forward_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(service = %label, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_handshake;

    #[test]
    fn handshake_accepts_object_with_port() {
        assert_eq!(parse_handshake(r#"{"port": 18043}"#), Ok(Some(18043)));
    }

    #[test]
    fn handshake_accepts_object_without_port() {
        assert_eq!(parse_handshake(r#"{"ready": true}"#), Ok(None));
    }

    #[test]
    fn handshake_rejects_non_object() {
        assert!(parse_handshake("not-json").is_err());
        assert!(parse_handshake("[1, 2]").is_err());
    }
}
