//! End-to-end reachability checks through the tunnel.
//!
//! A live keeper process says nothing about whether the forward still
//! works; these probes go through the local end of the forward.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use gluelink_core::config::{ProbeKind, ProbeSettings};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

/// Errors from probing.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("{target} still unreachable after {}s", waited.as_secs())]
    WaitTimedOut { target: String, waited: Duration },

    #[error("Failed to build probe: {0}")]
    Build(String),
}

/// A reachability check. Any error means "unreachable".
pub trait Probe: Send + Sync {
    /// Human-readable description of what is probed.
    fn target(&self) -> String;

    fn check(&self) -> impl Future<Output = Result<(), ProbeError>> + Send;
}

/// HTTP GET through the forward; any response at all counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| ProbeError::Build(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Probe for HttpProbe {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn check(&self) -> Result<(), ProbeError> {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "HTTP probe answered");
                Ok(())
            }
            Err(e) => Err(ProbeError::Unreachable {
                target: self.url.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// TCP connect through the forward.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    pub const fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

impl Probe for TcpProbe {
    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn check(&self) -> Result<(), ProbeError> {
        let reason = match timeout(self.timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(_stream)) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {}s", self.timeout.as_secs()),
        };
        Err(ProbeError::Unreachable {
            target: self.target(),
            reason,
        })
    }
}

/// Probe selected by configuration.
#[derive(Debug, Clone)]
pub enum TunnelProbe {
    Http(HttpProbe),
    Tcp(TcpProbe),
}

impl TunnelProbe {
    /// Probe the local end of the forward on `local_port`.
    pub fn from_settings(settings: &ProbeSettings, local_port: u16) -> Result<Self, ProbeError> {
        let request_timeout = Duration::from_secs(settings.timeout_secs);
        Ok(match settings.kind {
            ProbeKind::Http => Self::Http(HttpProbe::new(
                format!("http://127.0.0.1:{local_port}{}", settings.path),
                request_timeout,
            )?),
            ProbeKind::Tcp => Self::Tcp(TcpProbe::new(
                SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)),
                request_timeout,
            )),
        })
    }
}

impl Probe for TunnelProbe {
    fn target(&self) -> String {
        match self {
            Self::Http(p) => p.target(),
            Self::Tcp(p) => p.target(),
        }
    }

    async fn check(&self) -> Result<(), ProbeError> {
        match self {
            Self::Http(p) => p.check().await,
            Self::Tcp(p) => p.check().await,
        }
    }
}

/// Poll `probe` every `interval` until it succeeds or `limit` elapses.
///
/// Returns how long it took.
pub async fn wait_until_reachable<P: Probe>(
    probe: &P,
    interval: Duration,
    limit: Duration,
) -> Result<Duration, ProbeError> {
    let start = Instant::now();
    info!(target = %probe.target(), "Waiting for tunnel to become reachable");
    loop {
        match probe.check().await {
            Ok(()) => {
                let waited = start.elapsed();
                info!(target = %probe.target(), waited_secs = waited.as_secs(), "Tunnel reachable");
                return Ok(waited);
            }
            Err(e) => {
                if start.elapsed() + interval > limit {
                    return Err(ProbeError::WaitTimedOut {
                        target: probe.target(),
                        waited: start.elapsed(),
                    });
                }
                warn!(error = %e, retry_in_secs = interval.as_secs(), "Tunnel not reachable yet");
                sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// A port with nothing listening on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Serve a single HTTP response with the given status line.
    async fn http_server(status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn http_probe_accepts_any_status() {
        let port = http_server("503 Service Unavailable").await;
        let probe =
            TunnelProbe::from_settings(&ProbeSettings::default(), port).unwrap();
        assert_eq!(probe.target(), format!("http://127.0.0.1:{port}/"));
        probe.check().await.unwrap();
    }

    #[tokio::test]
    async fn http_probe_fails_on_closed_port() {
        let port = closed_port().await;
        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/"), TIMEOUT).unwrap();
        let err = probe.check().await.unwrap_err();
        assert!(matches!(err, ProbeError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        TcpProbe::new(addr, TIMEOUT).check().await.unwrap();

        drop(listener);
        assert!(TcpProbe::new(addr, TIMEOUT).check().await.is_err());
    }

    #[tokio::test]
    async fn wait_returns_once_reachable() {
        let port = http_server("200 OK").await;
        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/"), TIMEOUT).unwrap();
        let waited = wait_until_reachable(&probe, Duration::from_millis(10), TIMEOUT)
            .await
            .unwrap();
        assert!(waited < TIMEOUT);
    }

    #[tokio::test]
    async fn wait_gives_up_after_limit() {
        let port = closed_port().await;
        let probe = TcpProbe::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), TIMEOUT);
        let err = wait_until_reachable(
            &probe,
            Duration::from_millis(20),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::WaitTimedOut { .. }));
    }
}
