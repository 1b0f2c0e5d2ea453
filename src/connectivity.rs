//! Online check performed before each send.
//!
//! [`TcpProbe`] opens (and immediately drops) a TCP connection to the
//! backend host. A refused connection still proves the network path works,
//! so only timeouts and unreachable/resolution errors count as offline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe `host:port` of a URL with a bounded TCP connect.
pub struct TcpProbe {
    target: Option<String>,
    timeout: Duration,
}

impl TcpProbe {
    /// Derive the probe target from the backend base URL. An unparseable URL
    /// yields a probe that always reports online, leaving failure detection
    /// to the actual request.
    pub fn for_url(base_url: &str, timeout: Duration) -> Self {
        Self {
            target: probe_target(base_url),
            timeout,
        }
    }
}

fn probe_target(base_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    // host_str() keeps the brackets around IPv6 literals
    Some(format!("{host}:{port}"))
}

#[async_trait]
impl Connectivity for TcpProbe {
    async fn is_online(&self) -> bool {
        let Some(target) = &self.target else {
            return true;
        };
        match tokio::time::timeout(self.timeout, TcpStream::connect(target.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => true,
            Ok(Err(e)) => {
                debug!("Connectivity: {target} unreachable: {e}");
                false
            }
            Err(_) => {
                debug!("Connectivity: {target} probe timed out");
                false
            }
        }
    }
}
