//! A minimal capability set over a byte stream, so the protocol driver can
//! run against real TCP or an in-memory mock without caring which.

use super::{TransportError, TransportResult};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

const DIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Sealed over `AsyncRead + AsyncWrite + Unpin + Send` so any such type
/// (a `TcpStream`, one half of a `tokio::io::duplex`) is a `Connection` for
/// free; no per-method trampoline needed.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

pub(crate) type DialFuture<'a> = Pin<Box<dyn Future<Output = TransportResult<Box<dyn Connection>>> + Send + 'a>>;

/// Dials a remote peer and hands back something that implements
/// [`Connection`]. A trait (rather than a bare async fn) so tests can inject
/// a factory that yields mock connections instead of real sockets; the
/// future is boxed by hand so the trait stays object-safe for
/// `Arc<dyn ConnectionFactory>`.
pub trait ConnectionFactory: Send + Sync {
    fn dial(&self, addr: SocketAddr) -> DialFuture<'_>;
}

/// Production factory: real TCP, with a short dial timeout per spec.md §4.G.
pub struct TcpConnectionFactory;

impl ConnectionFactory for TcpConnectionFactory {
    fn dial(&self, addr: SocketAddr) -> DialFuture<'_> {
        Box::pin(async move {
            let connect = TcpStream::connect(addr);
            match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
                Ok(Ok(stream)) => Ok(Box::new(stream) as Box<dyn Connection>),
                Ok(Err(e)) => Err(TransportError::DialRefused(e)),
                Err(_) => Err(TransportError::DialTimeout),
            }
        })
    }
}

#[cfg(test)]
pub mod mock {
    //! Test-only `Connection` built on `tokio::io::duplex`. One half is
    //! handed to the code under test; the harness keeps the other half to
    //! push inbound bytes and observe what was written, per spec.md §4.G's
    //! "two channels" requirement.

    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    const BUF_SIZE: usize = 64 * 1024;

    /// The harness side of a mock connection: write to feed inbound bytes,
    /// `written` to observe what the code under test wrote.
    pub struct MockPeer {
        pub harness: DuplexStream,
        pub written: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// Wraps the code-under-test half of the duplex, tapping every write
    /// into an unbounded channel the harness can drain.
    pub struct TappedConnection {
        inner: DuplexStream,
        tap: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl AsyncRead for TappedConnection {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TappedConnection {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let n = match std::pin::Pin::new(&mut self.inner).poll_write(cx, buf) {
                std::task::Poll::Ready(Ok(n)) => n,
                other => return other,
            };
            let _ = self.tap.send(buf[..n].to_vec());
            std::task::Poll::Ready(Ok(n))
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    pub fn mock_pair() -> (TappedConnection, MockPeer) {
        let (a, b) = tokio::io::duplex(BUF_SIZE);
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        (
            TappedConnection { inner: a, tap: tap_tx },
            MockPeer {
                harness: b,
                written: tap_rx,
            },
        )
    }

    impl MockPeer {
        pub async fn send(&mut self, bytes: &[u8]) {
            self.harness.write_all(bytes).await.unwrap();
        }
    }

    #[tokio::test]
    async fn tapped_writes_are_observed_by_the_harness() {
        let (mut conn, mut peer) = mock_pair();
        conn.write_all(b"hello").await.unwrap();
        let observed = peer.written.recv().await.unwrap();
        assert_eq!(observed, b"hello");
    }

    #[tokio::test]
    async fn harness_writes_are_readable_by_the_connection() {
        let (mut conn, mut peer) = mock_pair();
        peer.send(b"world").await;
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }
}
