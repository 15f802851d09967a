//! Notification transport.
//!
//! The listener talks to the database through two seams so tests can run
//! against an in-memory transport (see [`crate::testing`]):
//!
//! - [`Connector`] — creates the transport and hands back the inbound
//!   message stream; invoked lazily on the first `listen`.
//! - [`NotifyTransport`] — issues `LISTEN`/`UNLISTEN` commands.
//!
//! [`PgConnector`] is the production implementation: an actor task that
//! owns a `tokio_postgres` client, forwards async notifications into the
//! message stream, and reconnects with exponential backoff when the
//! connection drops. `LISTEN` subscriptions do not survive a reconnect;
//! the actor reports [`ConnMessage::ConnectionLost`] and the listener
//! resets every watcher rather than resubscribing over an unknown gap.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Socket};
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::error::WatchError;

/// One message from the transport to the listener's multiplex loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnMessage {
    /// An asynchronous notification.
    Notification {
        /// Channel the notification was sent on.
        channel: String,
        /// Raw payload string.
        payload: String,
    },
    /// The connection dropped; database-side `LISTEN` state is gone.
    ConnectionLost,
}

/// Command surface of the notification connection.
#[async_trait]
pub trait NotifyTransport: Send + Sync + 'static {
    /// Issues `LISTEN channel`.
    async fn listen(&self, channel: &str) -> Result<(), WatchError>;

    /// Issues `UNLISTEN channel`.
    async fn unlisten(&self, channel: &str) -> Result<(), WatchError>;

    /// Issues `UNLISTEN *`.
    async fn unlisten_all(&self) -> Result<(), WatchError>;

    /// Tears the connection down. The message stream ends after this.
    async fn close(&self);
}

/// Creates the notification transport on first use.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes the transport and returns it with its message stream.
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn NotifyTransport>, mpsc::UnboundedReceiver<ConnMessage>), WatchError>;
}

/// Production [`Connector`] backed by `tokio_postgres`.
pub struct PgConnector {
    config: ListenerConfig,
}

impl PgConnector {
    /// Creates a connector for the configured DSN.
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn NotifyTransport>, mpsc::UnboundedReceiver<ConnMessage>), WatchError> {
        // Establish the first connection before returning so the caller's
        // initial LISTEN cannot race a half-open connection; later
        // reconnects are the actor's business.
        let initial = tokio_postgres::connect(&self.config.dsn, NoTls)
            .await
            .map_err(|e| WatchError::Db(e.to_string()))?;
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(self.config.clone(), cmd_rx, msg_tx, initial));
        Ok((Arc::new(PgTransport { cmd_tx }), msg_rx))
    }
}

enum Command {
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<(), WatchError>>,
    },
    Close,
}

struct PgTransport {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl PgTransport {
    async fn execute(&self, sql: String) -> Result<(), WatchError> {
        let closed = || WatchError::Db("notification connection is closed".to_string());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Execute {
                sql,
                reply: reply_tx,
            })
            .map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())?
    }
}

#[async_trait]
impl NotifyTransport for PgTransport {
    async fn listen(&self, channel: &str) -> Result<(), WatchError> {
        self.execute(format!("LISTEN {}", quote_ident(channel))).await
    }

    async fn unlisten(&self, channel: &str) -> Result<(), WatchError> {
        self.execute(format!("UNLISTEN {}", quote_ident(channel)))
            .await
    }

    async fn unlisten_all(&self) -> Result<(), WatchError> {
        self.execute("UNLISTEN *".to_string()).await
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

/// Quotes a channel name as a Postgres identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn not_connected() -> WatchError {
    WatchError::Db("not connected to database".to_string())
}

/// Connection actor: serves `LISTEN`/`UNLISTEN` commands and forwards
/// notifications until closed, reconnecting with exponential backoff
/// after a loss.
///
/// Commands issued while disconnected fail immediately with a `Db` error
/// instead of queueing for the next connection: the listener holds its
/// registry lock across these commands, and a reconnect can take
/// arbitrarily long. The resulting failure feeds the listener's `reset`
/// path, which is the correct outcome anyway because the registry must
/// never believe a `LISTEN` is active on a connection that never heard it.
async fn run_connection(
    config: ListenerConfig,
    mut cmds: mpsc::UnboundedReceiver<Command>,
    msgs: mpsc::UnboundedSender<ConnMessage>,
    initial: (Client, Connection<Socket, NoTlsStream>),
) {
    let mut backoff = config.min_reconnect_interval;
    let mut next = Some(initial);

    'reconnect: loop {
        let (client, connection) = match next.take() {
            Some(pair) => pair,
            None => {
                let connect = tokio_postgres::connect(&config.dsn, NoTls);
                tokio::pin!(connect);
                let attempt = loop {
                    tokio::select! {
                        attempt = &mut connect => break attempt,
                        cmd = cmds.recv() => match cmd {
                            Some(Command::Execute { reply, .. }) => {
                                let _ = reply.send(Err(not_connected()));
                            }
                            Some(Command::Close) | None => return,
                        },
                    }
                };
                match attempt {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, delay = ?backoff, "notification reconnect attempt failed");
                        let sleep = tokio::time::sleep(backoff);
                        tokio::pin!(sleep);
                        loop {
                            tokio::select! {
                                () = &mut sleep => break,
                                cmd = cmds.recv() => match cmd {
                                    Some(Command::Execute { reply, .. }) => {
                                        let _ = reply.send(Err(not_connected()));
                                    }
                                    Some(Command::Close) | None => return,
                                },
                            }
                        }
                        backoff = (backoff * 2).min(config.max_reconnect_interval);
                        continue 'reconnect;
                    }
                }
            }
        };
        backoff = config.min_reconnect_interval;
        info!("notification connection established");

        let notify_tx = msgs.clone();
        let mut driver = tokio::spawn(async move {
            let mut connection = connection;
            loop {
                match std::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        let _ = notify_tx.send(ConnMessage::Notification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "notification connection error");
                        break;
                    }
                    None => break,
                }
            }
        });

        loop {
            tokio::select! {
                cmd = cmds.recv() => match cmd {
                    Some(Command::Execute { sql, reply }) => {
                        let result = client
                            .batch_execute(&sql)
                            .await
                            .map_err(|e| WatchError::Db(e.to_string()));
                        let _ = reply.send(result);
                    }
                    Some(Command::Close) | None => {
                        driver.abort();
                        return;
                    }
                },
                _ = &mut driver => {
                    warn!("lost notification connection");
                    let _ = msgs.send(ConnMessage::ConnectionLost);
                    continue 'reconnect;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("repos"), "\"repos\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
