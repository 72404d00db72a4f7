//! TCP reachability probing.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

/// Future returned by [`ReachabilityProbe::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Checks whether a TCP port accepts connections.
pub trait ReachabilityProbe: Send + Sync {
    /// Resolves to `true` when `host:port` accepts a connection within
    /// `limit`.
    fn probe<'a>(&'a self, host: &'a str, port: u16, limit: Duration) -> ProbeFuture<'a>;
}

/// Probe that opens a real TCP connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpProbe;

impl ReachabilityProbe for TcpProbe {
    fn probe<'a>(&'a self, host: &'a str, port: u16, limit: Duration) -> ProbeFuture<'a> {
        Box::pin(async move {
            matches!(
                timeout(limit, TcpStream::connect((host, port))).await,
                Ok(Ok(_))
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_reports_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();

        assert!(
            TcpProbe
                .probe("127.0.0.1", port, Duration::from_secs(1))
                .await
        );
    }

    #[tokio::test]
    async fn tcp_probe_reports_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        assert!(
            !TcpProbe
                .probe("127.0.0.1", port, Duration::from_secs(1))
                .await
        );
    }
}
