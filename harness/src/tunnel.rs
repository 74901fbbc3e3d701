use crate::error::{self, Result};
use e2e_model::Settings;
use log::{debug, info, warn};
use snafu::ResultExt;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

const CONNECT_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TargetKind {
    Service,
    Pod,
}

impl Display for TargetKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Service => f.write_str("svc"),
            TargetKind::Pod => f.write_str("pod"),
        }
    }
}

/// The in-cluster end of a tunnel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TunnelTarget {
    pub namespace: String,
    pub kind: TargetKind,
    pub name: String,
    pub remote_port: u16,
}

impl TunnelTarget {
    pub fn service<S1, S2>(namespace: S1, name: S2, remote_port: u16) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            kind: TargetKind::Service,
            name: name.into(),
            remote_port,
        }
    }

    pub fn pod<S1, S2>(namespace: S1, name: S2, remote_port: u16) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            kind: TargetKind::Pod,
            name: name.into(),
            remote_port,
        }
    }
}

impl Display for TunnelTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.namespace, self.kind, self.name, self.remote_port
        )
    }
}

/// How tunnels are started and stopped.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TunnelOptions {
    /// The command line prefix that provides `port-forward`, e.g. `microk8s kubectl`.
    pub relay: Vec<String>,
    pub connect_timeout: Duration,
    /// Time the relay gets to exit after SIGTERM before it is killed.
    pub grace: Duration,
}

impl TunnelOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            relay: settings.kubectl.clone(),
            connect_timeout: settings.timeouts.tunnel_connect,
            grace: settings.timeouts.tunnel_grace,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TunnelState {
    Live,
    Terminated,
}

/// A local port relayed to a port inside the cluster by a `port-forward` child process. The
/// relay is killed when the handle is dropped, `close` stops it gracefully.
#[derive(Debug)]
pub struct Tunnel {
    target: TunnelTarget,
    local_port: u16,
    grace: Duration,
    child: Option<Child>,
}

impl Tunnel {
    /// Starts the relay and waits until the local port accepts connections. Without a
    /// `local_port` a free one is picked.
    pub async fn open(
        options: &TunnelOptions,
        target: TunnelTarget,
        local_port: Option<u16>,
    ) -> Result<Tunnel> {
        let local_port = match local_port {
            Some(port) => port,
            None => free_local_port()?,
        };
        let mut args = options.relay.iter();
        let program = args.next().map(String::as_str).unwrap_or("kubectl");
        let mut command = Command::new(program);
        command
            .args(args)
            .arg("port-forward")
            .arg("-n")
            .arg(&target.namespace)
            .arg(format!("{}/{}", target.kind, target.name))
            .arg(format!("{}:{}", local_port, target.remote_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Starting port forward {} on local port {}", target, local_port);
        let child = command.spawn().context(error::CommandSpawnSnafu {
            command: format!("{} port-forward", program),
        })?;
        let mut tunnel = Tunnel {
            target,
            local_port,
            grace: options.grace,
            child: Some(child),
        };

        let deadline = Instant::now() + options.connect_timeout;
        loop {
            if port_accepts(local_port).await {
                info!(
                    "Port forward {} ready on 127.0.0.1:{}",
                    tunnel.target, local_port
                );
                return Ok(tunnel);
            }
            let exited = tunnel
                .child
                .as_mut()
                .map(|child| matches!(child.try_wait(), Ok(Some(_))))
                .unwrap_or(true);
            if exited || Instant::now() >= deadline {
                break;
            }
            sleep(CONNECT_PROBE_INTERVAL).await;
        }

        let diagnostics = tunnel.abort().await;
        error::ConnectFailedSnafu {
            target: tunnel.target.to_string(),
            timeout: options.connect_timeout,
            diagnostics,
        }
        .fail()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn state(&self) -> TunnelState {
        if self.child.is_some() {
            TunnelState::Live
        } else {
            TunnelState::Terminated
        }
    }

    /// The local URL of `path` on the far side of the tunnel.
    pub fn url(&self, path: &str) -> String {
        local_url(self.local_port, path)
    }

    /// The process id of the relay while the tunnel is live.
    pub fn relay_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Stops the relay: SIGTERM first, SIGKILL once the grace period is over. Closing a tunnel
    /// whose relay has already exited, or closing twice, does nothing.
    pub async fn close(&mut self) {
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return,
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Port forward {} already exited: {}", self.target, status);
            return;
        }
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        if timeout(self.grace, child.wait()).await.is_err() {
            warn!(
                "Port forward {} ignored SIGTERM for {:?}, killing it",
                self.target, self.grace
            );
            if let Err(e) = child.kill().await {
                warn!("Unable to kill port forward {}: {}", self.target, e);
            }
        }
        debug!("Port forward {} closed", self.target);
    }

    /// Kills the relay and returns whatever it wrote to stderr.
    async fn abort(&mut self) -> String {
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return String::new(),
        };
        let _ = child.start_kill();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = timeout(self.grace, pipe.read_to_string(&mut stderr)).await;
        }
        let _ = timeout(self.grace, child.wait()).await;
        if stderr.trim().is_empty() {
            "(no output from port forward)".to_string()
        } else {
            stderr.trim().to_string()
        }
    }
}

/// Opens a tunnel, runs `body` with its local port and closes the tunnel afterwards, whatever
/// the body returned.
pub async fn with_tunnel<T, F, Fut>(
    options: &TunnelOptions,
    target: TunnelTarget,
    local_port: Option<u16>,
    body: F,
) -> Result<T>
where
    F: FnOnce(u16) -> Fut,
    Fut: Future<Output = T>,
{
    let mut tunnel = Tunnel::open(options, target, local_port).await?;
    let value = body(tunnel.local_port()).await;
    tunnel.close().await;
    Ok(value)
}

pub fn local_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", port, path)
}

/// Asks the OS for an unused local port. The port is released before it is returned, so another
/// process may take it first.
pub fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .context(error::LocalPortSnafu)?;
    Ok(listener.local_addr().context(error::LocalPortSnafu)?.port())
}

async fn port_accepts(port: u16) -> bool {
    matches!(
        timeout(
            CONNECT_PROBE_TIMEOUT,
            TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn options(script: &str) -> TunnelOptions {
        TunnelOptions {
            relay: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "relay".to_string(),
            ],
            connect_timeout: Duration::from_millis(500),
            grace: Duration::from_secs(2),
        }
    }

    fn pid_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn open_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = TunnelTarget::service("observability", "prometheus", 9090);
        let mut tunnel = Tunnel::open(&options("exec sleep 30"), target, Some(port))
            .await
            .unwrap();
        assert_eq!(tunnel.state(), TunnelState::Live);
        assert_eq!(
            tunnel.url("/api/v1/query"),
            format!("http://127.0.0.1:{}/api/v1/query", port)
        );
        let pid = tunnel.relay_pid().unwrap();
        assert!(pid_alive(pid));

        tunnel.close().await;
        assert_eq!(tunnel.state(), TunnelState::Terminated);
        assert!(!pid_alive(pid));
        tunnel.close().await;
        assert_eq!(tunnel.state(), TunnelState::Terminated);
    }

    #[tokio::test]
    async fn connect_failure_carries_relay_output() {
        let target = TunnelTarget::pod("security", "kapparmor-abc", 8080);
        let error = Tunnel::open(
            &options("echo 'error: unable to forward port' >&2; exec sleep 30"),
            target,
            None,
        )
        .await
        .unwrap_err();
        match error {
            error::Error::ConnectFailed {
                target,
                diagnostics,
                ..
            } => {
                assert_eq!(target, "security/pod/kapparmor-abc:8080");
                assert!(diagnostics.contains("unable to forward port"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn scoped_tunnel_is_closed_after_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pid_file = tempfile::NamedTempFile::new().unwrap();
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.path().display());
        let pid_path = pid_file.path().to_path_buf();
        let result: Result<std::result::Result<(), String>> = with_tunnel(
            &options(&script),
            TunnelTarget::service("observability", "prometheus", 9090),
            Some(port),
            |local_port| async move {
                assert_eq!(local_port, port);
                // Let the relay record its pid before it is stopped.
                for _ in 0..100 {
                    if !std::fs::read_to_string(&pid_path).unwrap().trim().is_empty() {
                        break;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                Err("query failed".to_string())
            },
        )
        .await;
        assert_eq!(result.unwrap(), Err("query failed".to_string()));

        let pid: u32 = std::fs::read_to_string(pid_file.path())
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn scoped_tunnel_reports_connect_failure() {
        let result = with_tunnel(
            &options("exec sleep 30"),
            TunnelTarget::pod("security", "kapparmor-abc", 8080),
            None,
            |port| async move { port },
        )
        .await;
        assert!(matches!(result, Err(error::Error::ConnectFailed { .. })));
    }
}
