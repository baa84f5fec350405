use crate::dispatch::Transport;
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{write_message, CommandMessage, FrameError, MessageReader, ResultMessage};
use async_trait::async_trait;
use std::io;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

struct Connection {
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Persistent TCP connection to the command executor running inside Blender.
///
/// The socket is opened on first use and kept for later calls. Any failure,
/// including a timeout, drops it so the next call starts from a fresh
/// connection; nothing is retried.
pub struct BlenderConnection {
    host: String,
    port: u16,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl BlenderConnection {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            connection: Mutex::new(None),
        }
    }

    async fn connect(&self) -> DispatchResult<Connection> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    "Failed to connect to Blender at {}:{}: {}",
                    self.host,
                    self.port,
                    e
                )
            })?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to Blender at {}:{}", self.host, self.port);
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: MessageReader::new(reader),
            writer,
        })
    }

    pub async fn disconnect(&self) {
        if self.connection.lock().await.take().is_some() {
            tracing::info!("Disconnected from Blender");
        }
    }

    async fn exchange(
        &self,
        connection: &mut Connection,
        command: &CommandMessage,
    ) -> DispatchResult<ResultMessage> {
        write_message(&mut connection.writer, command).await?;
        let expected = command.id;
        loop {
            let response: ResultMessage = match connection.reader.next().await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    return Err(DispatchError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Blender closed the connection",
                    )))
                }
                Err(FrameError::Io(err)) => return Err(err.into()),
                Err(err) => return Err(DispatchError::Protocol(err.to_string())),
            };
            // Peers that do not echo ids only ever have one request in flight.
            match response.id {
                None => return Ok(response),
                Some(id) if Some(id) == expected => return Ok(response),
                Some(id) => tracing::warn!(%id, "Discarding response for another request"),
            }
        }
    }

    /// Waits for the connection, connects if needed and exchanges one
    /// command. Dropping this future mid-exchange drops the socket with it.
    async fn locked_round_trip(&self, command: &CommandMessage) -> DispatchResult<ResultMessage> {
        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => self.connect().await?,
        };
        tracing::info!("Sending command: {} with params: {:?}", command.kind, command.params);
        let result = self.exchange(&mut connection, command).await;
        if let Ok(response) = &result {
            tracing::debug!("{} answered, success: {}", command.kind, response.is_success());
            *slot = Some(connection);
        }
        result
    }
}

#[async_trait]
impl Transport for BlenderConnection {
    async fn round_trip(&self, command: CommandMessage) -> DispatchResult<ResultMessage> {
        // One deadline covers queueing behind other callers, connecting and the reply.
        let deadline = Instant::now() + self.timeout;
        let result = tokio::time::timeout_at(deadline, self.locked_round_trip(&command))
            .await
            .unwrap_or(Err(DispatchError::Timeout(self.timeout)));
        if let Err(err) = &result {
            tracing::warn!("Dropping Blender connection after error: {err}");
        }
        result
    }

    async fn close(&self) {
        self.disconnect().await
    }
}
