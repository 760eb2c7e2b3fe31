//! Raw TCP forwarding.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use url::Url;

use super::backend::BackendResolver;
use super::listener::ListenerStats;
use super::pump::{pump, PumpStats};
use crate::error::{Result, RouterError};

/// Forwards accepted connections to one target.
pub struct TcpForwarder {
    target: Url,
    resolver: Arc<BackendResolver>,
    stats: Arc<ListenerStats>,
}

impl TcpForwarder {
    pub fn new(target: Url, resolver: Arc<BackendResolver>, stats: Arc<ListenerStats>) -> Self {
        Self {
            target,
            resolver,
            stats,
        }
    }

    /// Connect the backend and pump until either side closes.
    ///
    /// Target path errors surface here, per connection.
    pub async fn forward<S>(&self, client: S) -> Result<PumpStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let backend = match self.resolver.connect(&self.target).await {
            Ok(backend) => backend,
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        debug!(target = %self.target, backend = ?backend, "Connected to backend");

        let result = pump(client, backend, self.resolver.idle_timeout()).await;

        let stats = match &result {
            Ok(stats) => *stats,
            Err(e) => e.stats,
        };
        self.stats
            .bytes_to_backend
            .fetch_add(stats.to_b, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(stats.from_b, Ordering::Relaxed);

        let stats = result.map_err(|e| RouterError::Io(e.source))?;

        debug!(
            bytes_to_backend = stats.to_b,
            bytes_from_backend = stats.from_b,
            "Connection closed"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rackgate_rack::{LocalApp, LocalProcess, LocalRack};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_backend() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_through_local_rack() {
        let backend = echo_backend().await;
        let rack = LocalRack::new().with_app(
            "myapp",
            LocalApp {
                processes: vec![LocalProcess {
                    id: "p1".to_string(),
                    service: "web".to_string(),
                    host: "127.0.0.1".to_string(),
                }],
                ..Default::default()
            },
        );
        let resolver = Arc::new(BackendResolver::new(Arc::new(rack)));
        let stats = Arc::new(ListenerStats::default());
        let target = Url::parse(&format!("tcp://rack/myapp/service/web:{}", backend.port())).unwrap();
        let forwarder = TcpForwarder::new(target, resolver, Arc::clone(&stats));

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { forwarder.forward(proxy_side).await });

        client.write_all(b"hello rack").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello rack");

        drop(client);
        let pumped = task.await.unwrap().unwrap();
        assert_eq!(pumped.to_b, 10);
        assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_forward_counts_backend_failure() {
        let resolver = Arc::new(BackendResolver::new(Arc::new(LocalRack::new())));
        let stats = Arc::new(ListenerStats::default());
        let target = Url::parse("tcp://rack/missing/service/web:80").unwrap();
        let forwarder = TcpForwarder::new(target, resolver, Arc::clone(&stats));

        let (_client, proxy_side) = tokio::io::duplex(64);
        let err = forwarder.forward(proxy_side).await.unwrap_err();

        assert_eq!(err.reason_code(), "rack_error");
        assert_eq!(stats.backend_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_forward_counts_bytes_when_pump_fails() {
        // Backend that reads and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut sink = Vec::new();
                    let _ = stream.read_to_end(&mut sink).await;
                });
            }
        });

        let resolver = Arc::new(
            BackendResolver::new(Arc::new(LocalRack::new()))
                .with_idle_timeout(Some(std::time::Duration::from_millis(50))),
        );
        let stats = Arc::new(ListenerStats::default());
        let target = Url::parse(&format!("tcp://127.0.0.1:{}", backend.port())).unwrap();
        let forwarder = TcpForwarder::new(target, resolver, Arc::clone(&stats));

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        client.write_all(b"hello").await.unwrap();

        let err = forwarder.forward(proxy_side).await.unwrap_err();
        assert_eq!(err.reason_code(), "io_error");
        assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 5);
        assert_eq!(stats.bytes_from_backend.load(Ordering::Relaxed), 0);
        drop(client);
    }
}
