//! The single outbound connection to the log intake.
//!
//! Records are handed over through a bounded queue and written as
//! `<api-key> <json>\n` lines once the TLS handshake has authorized the
//! peer. Delivery is fire-and-forget: anything queued while the link was
//! down is shed at the next authorization instead of carried over.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;

const RECORD_QUEUE_DEPTH: usize = 1024;

/// Pause between failed dial attempts. The end of an established connection
/// triggers an immediate redial; only a dead endpoint is paced.
const REDIAL_DELAY: Duration = Duration::from_secs(2);

pub(crate) trait IntakeConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IntakeConn for T {}

/// How the channel reaches the intake endpoint. Production uses
/// [`tls_dial`]; tests substitute in-memory pipes.
pub(crate) type Dial =
    Box<dyn Fn() -> BoxFuture<'static, io::Result<Box<dyn IntakeConn>>> + Send>;

/// TCP with Nagle off, then TLS against the public roots. The connection is
/// usable only once the handshake has authorized the peer.
pub(crate) fn tls_dial(host: &str, port: u16) -> anyhow::Result<Dial> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_owned())?;
    let host = host.to_owned();

    Ok(Box::new(move || {
        let host = host.clone();
        let server_name = server_name.clone();
        let connector = connector.clone();
        Box::pin(async move {
            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            tcp.set_nodelay(true)?;
            let tls = connector.connect(server_name, tcp).await?;
            Ok(Box::new(tls) as Box<dyn IntakeConn>)
        })
    }))
}

/// Write side handed to every record producer. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ForwardingHandle {
    tx: mpsc::Sender<String>,
}

impl ForwardingHandle {
    /// Non-blocking, best-effort. A full queue means the link cannot keep
    /// up and the record is dropped.
    pub(crate) fn forward(&self, payload: String) {
        if self.tx.try_send(payload).is_err() {
            tracing::debug!("dropping record, forwarding queue unavailable");
        }
    }
}

enum PumpExit {
    /// Connection ended or errored; redial immediately.
    LinkLost,
    /// Every producer handle is gone; shut down.
    Closed,
}

pub(crate) struct ForwardingChannel {
    api_key: String,
    dial: Dial,
    rx: mpsc::Receiver<String>,
    authorized_tx: watch::Sender<u64>,
}

impl ForwardingChannel {
    /// Returns the channel itself plus the producer handle and a watch that
    /// ticks on every successful (re-)authorization.
    pub(crate) fn new(
        api_key: String,
        dial: Dial,
    ) -> (Self, ForwardingHandle, watch::Receiver<u64>) {
        let (tx, rx) = mpsc::channel(RECORD_QUEUE_DEPTH);
        let (authorized_tx, authorized_rx) = watch::channel(0);
        (
            Self {
                api_key,
                dial,
                rx,
                authorized_tx,
            },
            ForwardingHandle { tx },
            authorized_rx,
        )
    }

    pub(crate) async fn run(mut self) {
        let mut sessions: u64 = 0;
        loop {
            let conn = self.establish().await;
            // records queued while the link was down are stale; shed them
            while self.rx.try_recv().is_ok() {}
            sessions += 1;
            tracing::info!("intake connection authorized");
            let _ = self.authorized_tx.send(sessions);

            match self.pump(conn).await {
                PumpExit::LinkLost => tracing::info!("intake connection lost, reconnecting"),
                PumpExit::Closed => return,
            }
        }
    }

    /// Dials until a handshake succeeds.
    async fn establish(&mut self) -> Box<dyn IntakeConn> {
        loop {
            tracing::info!("connecting to intake");
            match (self.dial)().await {
                Ok(conn) => return conn,
                Err(e) => tracing::warn!("intake connect failed: {e}"),
            }
            tokio::time::sleep(REDIAL_DELAY).await;
        }
    }

    async fn pump(&mut self, conn: Box<dyn IntakeConn>) -> PumpExit {
        // the intake never answers; the read half only detects close
        let (mut reader, mut writer) = tokio::io::split(conn);
        let mut peek = [0u8; 512];
        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(payload) => {
                        let line = frame_line(&self.api_key, &payload);
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            tracing::warn!("intake write failed: {e}");
                            return PumpExit::LinkLost;
                        }
                    }
                    None => return PumpExit::Closed,
                },
                result = reader.read(&mut peek) => match result {
                    Ok(0) => {
                        tracing::info!("intake connection ended");
                        return PumpExit::LinkLost;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("intake read failed: {e}");
                        return PumpExit::LinkLost;
                    }
                }
            }
        }
    }
}

fn frame_line(api_key: &str, payload: &str) -> String {
    format!("{api_key} {payload}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;

    fn pipe_dial(
        server_ends: mpsc::UnboundedSender<DuplexStream>,
        dials: Arc<AtomicUsize>,
    ) -> Dial {
        Box::new(move || {
            dials.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(4096);
            let _ = server_ends.send(server);
            Box::pin(async move { Ok(Box::new(client) as Box<dyn IntakeConn>) })
        })
    }

    #[test]
    fn line_is_token_space_payload_newline() {
        assert_eq!(frame_line("key", r#"{"a":1}"#), "key {\"a\":1}\n");
    }

    #[tokio::test]
    async fn writes_framed_records_once_authorized() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (channel, handle, mut authorized) =
            ForwardingChannel::new("key".into(), pipe_dial(server_tx, Arc::default()));
        tokio::spawn(channel.run());

        authorized.changed().await.unwrap();
        let mut server = server_rx.recv().await.unwrap();

        handle.forward(r#"{"a":1}"#.into());

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"key {\"a\":1}\n");
    }

    #[tokio::test]
    async fn records_sent_while_unready_are_dropped() {
        let (gate_tx, gate_rx) = oneshot::channel();
        let gate = std::sync::Mutex::new(Some(gate_rx));
        let (server_tx, mut server_rx) = mpsc::unbounded_channel::<DuplexStream>();
        let dial: Dial = Box::new(move || {
            let gate = gate.lock().unwrap().take();
            let (client, server) = tokio::io::duplex(4096);
            let _ = server_tx.send(server);
            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(Box::new(client) as Box<dyn IntakeConn>)
            })
        });
        let (channel, handle, mut authorized) = ForwardingChannel::new("key".into(), dial);
        tokio::spawn(channel.run());

        // the dial is stuck, so this record arrives while the link is down
        handle.forward(r#"{"lost":true}"#.into());
        gate_tx.send(()).unwrap();

        authorized.changed().await.unwrap();
        let mut server = server_rx.recv().await.unwrap();
        handle.forward(r#"{"kept":true}"#.into());

        // only the record sent after authorization comes through
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"key {\"kept\":true}\n");
    }

    #[tokio::test]
    async fn redials_after_connection_end_without_external_trigger() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let dials = Arc::new(AtomicUsize::new(0));
        let (channel, _handle, mut authorized) =
            ForwardingChannel::new("key".into(), pipe_dial(server_tx, Arc::clone(&dials)));
        tokio::spawn(channel.run());

        authorized.changed().await.unwrap();
        let server = server_rx.recv().await.unwrap();

        // remote close: the channel must come back on its own
        drop(server);
        authorized.changed().await.unwrap();

        assert!(dials.load(Ordering::SeqCst) >= 2);
        assert!(server_rx.recv().await.is_some());
    }
}
