//! Network reachability checks

use crate::error::{BerthError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Checks whether something accepts connections on a host port
#[async_trait]
pub trait PortDialer: Send + Sync {
    /// Succeed if a connection to `host:port` can be established
    async fn dial(&self, host: &str, port: u16) -> Result<()>;
}

/// Dialer that opens a real TCP connection
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer giving up on a single connect after `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl PortDialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<()> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(BerthError::Probe(format!(
                "connect to {}:{} failed: {}",
                host, port, e
            ))),
            Err(_) => Err(BerthError::Probe(format!(
                "connect to {}:{} timed out",
                host, port
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = TcpDialer::default();
        assert!(dialer.dial("127.0.0.1", port).await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TcpDialer::default();
        assert!(matches!(
            dialer.dial("127.0.0.1", port).await,
            Err(BerthError::Probe(_))
        ));
    }
}
