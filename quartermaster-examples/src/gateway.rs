//! Event gateway transport
//!
//! A long-lived feed connection in the style of an upstream event socket:
//! acquisition retries until the server is ready to accept us, and the read
//! loop consults the key's [`CloseIntent`] when the connection ends so a
//! coordinated teardown is never mistaken for an outage.

use std::sync::Arc;

use quartermaster::{
    retry_until_ready, AcquireError, CloseIntent, Lifecycle, ReleaseError, ResourceKey,
    RetryPolicy,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Key for the gateway transport resource.
pub const GATEWAY: ResourceKey<GatewayTransport> = ResourceKey::new("gateway");

/// Connection settings for the gateway feed.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address of the upstream feed, `host:port`.
    pub address: String,
    /// How to keep retrying while the feed is not accepting connections.
    pub connect_retry: RetryPolicy,
}

impl GatewayConfig {
    /// Settings for the feed at `address`, retried under the default policy.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_retry: RetryPolicy::default(),
        }
    }

    /// Replaces the connect retry policy.
    #[must_use]
    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }
}

/// Something the feed told us, or the end of the feed.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// One parsed frame from the server.
    Message(Value),
    /// The connection closed. `expected` is `true` when the teardown
    /// coordinator asked for the close, `false` when the server dropped us.
    Closed {
        /// Whether the close was requested by a coordinated teardown.
        expected: bool,
    },
}

/// Live connection to the gateway feed.
///
/// A background task reads newline-delimited JSON frames and hands them out
/// through [`next_event`](Self::next_event). When the stream ends the task
/// checks the close intent and reports the close as expected or unexpected.
pub struct GatewayTransport {
    events: Mutex<mpsc::Receiver<GatewayEvent>>,
    shutdown: Arc<Notify>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayTransport {
    fn start(stream: TcpStream, intent: CloseIntent) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let shutdown = Arc::new(Notify::new());
        let reader = tokio::spawn(read_loop(
            stream,
            intent,
            events_tx,
            Arc::clone(&shutdown),
        ));
        Self {
            events: Mutex::new(events_rx),
            shutdown,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Next event from the feed, `None` once the stream has closed and every
    /// buffered event has been handed out.
    pub async fn next_event(&self) -> Option<GatewayEvent> {
        self.events.lock().await.recv().await
    }

    /// Closes the connection and waits for the read loop to finish.
    pub async fn shutdown(&self) -> Result<(), ReleaseError> {
        self.shutdown.notify_one();
        let reader = self.reader.lock().await.take();
        if let Some(reader) = reader {
            reader.await.map_err(ReleaseError::with_source)?;
        }
        Ok(())
    }
}

/// Declares the gateway resource. Acquisition keeps dialing under the
/// config's retry policy while the feed refuses connections; release closes
/// the socket through [`GatewayTransport::shutdown`].
pub fn lifecycle(config: GatewayConfig) -> Lifecycle<GatewayTransport> {
    Lifecycle::with_context(move |context| {
        let config = config.clone();
        async move {
            let intent = context.close_intent();
            let stream = retry_until_ready(&config.connect_retry, "gateway.connect", || {
                connect(&config.address)
            })
            .await?;
            info!(address = %config.address, "[gateway.connect] feed connected");
            Ok(GatewayTransport::start(stream, intent))
        }
    })
    .with_release(|transport| async move { transport.shutdown().await })
}

async fn connect(address: &str) -> Result<TcpStream, AcquireError> {
    TcpStream::connect(address).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::ConnectionRefused {
            AcquireError::not_ready(format!("gateway at {address} refused the connection"))
        } else {
            AcquireError::with_source(error)
        }
    })
}

async fn read_loop(
    stream: TcpStream,
    intent: CloseIntent,
    events: mpsc::Sender<GatewayEvent>,
    shutdown: Arc<Notify>,
) {
    let mut lines = BufReader::new(stream).lines();
    let expected = loop {
        tokio::select! {
            () = shutdown.notified() => break intent.is_expected(),
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str(&line) {
                    Ok(frame) => {
                        if events.send(GatewayEvent::Message(frame)).await.is_err() {
                            break intent.is_expected();
                        }
                    }
                    Err(parse_error) => {
                        warn!(error = %parse_error, "[gateway.read] discarding malformed frame");
                    }
                },
                Ok(None) => break intent.is_expected(),
                Err(read_error) => {
                    warn!(error = %read_error, "[gateway.read] read failed");
                    break intent.is_expected();
                }
            }
        }
    };

    if expected {
        info!("[gateway.close] connection closed by coordinated teardown");
    } else {
        error!("[gateway.close] connection dropped unexpectedly");
    }
    let _ = events.send(GatewayEvent::Closed { expected }).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quartermaster::Registry;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn connected_pair(registry: &Registry) -> (Arc<GatewayTransport>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        registry
            .register(GATEWAY, lifecycle(GatewayConfig::new(&address)))
            .unwrap();

        let (transport, server) = tokio::join!(
            async { registry.provide_one(GATEWAY).await.unwrap() },
            async { listener.accept().await.unwrap().0 }
        );
        (transport, server)
    }

    #[tokio::test]
    async fn frames_arrive_and_a_dropped_server_reads_as_unexpected() {
        let registry = Registry::new();
        let (transport, mut server) = connected_pair(&registry).await;

        server.write_all(b"{\"kind\":\"ping\"}\n").await.unwrap();
        drop(server);

        match transport.next_event().await.unwrap() {
            GatewayEvent::Message(frame) => assert_eq!(frame["kind"], "ping"),
            other => panic!("expected a message, got {other:?}"),
        }
        match transport.next_event().await.unwrap() {
            GatewayEvent::Closed { expected } => assert!(!expected),
            other => panic!("expected a close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let registry = Registry::new();
        let (transport, mut server) = connected_pair(&registry).await;

        server.write_all(b"not json\n{\"kind\":\"pong\"}\n").await.unwrap();

        match transport.next_event().await.unwrap() {
            GatewayEvent::Message(frame) => assert_eq!(frame["kind"], "pong"),
            other => panic!("expected a message, got {other:?}"),
        }
        drop(server);
    }

    #[tokio::test]
    async fn teardown_reads_as_an_expected_close() {
        let registry = Registry::new();
        let (transport, server) = connected_pair(&registry).await;

        let failures = registry.cleanup().await;
        assert!(failures.is_empty());

        match transport.next_event().await.unwrap() {
            GatewayEvent::Closed { expected } => assert!(expected),
            other => panic!("expected a close, got {other:?}"),
        }
        drop(server);
    }

    #[tokio::test]
    async fn connecting_retries_until_the_server_listens() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = probe.local_addr().unwrap().to_string();
        drop(probe);

        let registry = Registry::new();
        let config = GatewayConfig::new(&address)
            .with_connect_retry(RetryPolicy::every(Duration::from_millis(25)));
        registry.register(GATEWAY, lifecycle(config)).unwrap();

        let provide = tokio::spawn({
            let registry = registry.clone();
            async move { registry.provide_one(GATEWAY).await }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        let listener = TcpListener::bind(address.as_str()).await.unwrap();
        let _server = listener.accept().await.unwrap().0;

        let transport = provide.await.unwrap().unwrap();
        drop(transport);
        assert!(registry.cleanup().await.is_empty());
    }
}
