//! Echo client.
//!
//! Connects, applies the same socket tuning as the server, then sends a
//! fixed number of numbered messages. Each message waits for its reply
//! and a pacing pause before the next one goes out, so the run shows
//! per-message round trips rather than streaming throughput. The sentinel
//! is sent last and its reply is not awaited.

use crate::config::ClientConfig;
use crate::session::SENTINEL;
use crate::tuning::{self, ConnectionOptions};
use socket2::SockRef;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Fatal client errors. Any of these ends the run.
#[derive(Debug)]
pub enum ClientError {
    Connect(String, io::Error),
    Io(io::Error),
    /// Server closed the connection before answering message `exchanged + 1`.
    UnexpectedEof { exchanged: usize },
    Timeout(Duration),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(addr, e) => write!(f, "Failed to connect to {addr}: {e}"),
            ClientError::Io(e) => write!(f, "Client I/O error: {e}"),
            ClientError::UnexpectedEof { exchanged } => write!(
                f,
                "Server closed the connection after {exchanged} exchange(s)"
            ),
            ClientError::Timeout(limit) => write!(f, "No response within {limit:?}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect(_, e) | ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// Result of a completed run.
#[derive(Debug, Default)]
pub struct ExchangeSummary {
    /// Responses in the order the messages were sent, line endings removed.
    pub responses: Vec<String>,
}

/// Text of the `index`-th message (1-based).
pub fn message(index: usize) -> String {
    format!("Hello Server! Message #{index}")
}

pub struct Client {
    config: ClientConfig,
    options: ConnectionOptions,
}

impl Client {
    pub fn new(config: ClientConfig, options: ConnectionOptions) -> Self {
        Self { config, options }
    }

    /// Connect and drive the full exchange.
    pub async fn run(&self) -> Result<ExchangeSummary, ClientError> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|e| ClientError::Connect(target.clone(), e))?;

        {
            let sock = SockRef::from(&stream);
            tuning::apply(&*sock, &self.options);
            match tuning::describe(&*sock) {
                Ok(snapshot) => snapshot.log("client"),
                Err(e) => warn!(error = %e, "Could not read socket options"),
            }
        }

        if let Ok(peer) = stream.peer_addr() {
            info!(server = %peer, "Connected to server");
        }

        let (mut reader, mut writer) = stream.into_split();
        let result = self.exchange(&mut reader, &mut writer).await;

        match reader.reunite(writer) {
            Ok(stream) => tuning::release(stream).await,
            Err(e) => warn!(error = %e, "Could not reunite stream halves"),
        }

        let summary = result?;

        info!(exchanges = summary.responses.len(), "Client finished");
        Ok(summary)
    }

    /// Message loop over an already connected stream.
    pub async fn exchange<R, W>(&self, reader: R, mut writer: W) -> Result<ExchangeSummary, ClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut summary = ExchangeSummary::default();
        let mut response = String::new();

        for index in 1..=self.config.messages {
            let message = message(index);
            info!(message = %message, "Sending");
            writer.write_all(format!("{message}\n").as_bytes()).await?;
            writer.flush().await?;

            response.clear();
            let limit = self.options.read_timeout;
            let n = tokio::time::timeout(limit, reader.read_line(&mut response))
                .await
                .map_err(|_| ClientError::Timeout(limit))??;
            if n == 0 {
                return Err(ClientError::UnexpectedEof {
                    exchanged: summary.responses.len(),
                });
            }

            let received = response.trim_end_matches(['\r', '\n']).to_string();
            info!(response = %received, "Received");
            summary.responses.push(received);

            if !self.config.pause.is_zero() {
                tokio::time::sleep(self.config.pause).await;
            }
        }

        writer.write_all(format!("{SENTINEL}\n").as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use crate::session::{CloseReason, EchoSession};
    use std::time::Instant;
    use tokio::io::AsyncReadExt;

    fn test_config(port: u16, messages: usize, pause: Duration) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            messages,
            pause,
        }
    }

    #[test]
    fn test_message_text() {
        assert_eq!(message(1), "Hello Server! Message #1");
        assert_eq!(message(5), "Hello Server! Message #5");
    }

    #[tokio::test]
    async fn test_exchange_sequence() {
        let mock = tokio_test::io::Builder::new()
            .write(b"Hello Server! Message #1\n")
            .read(b"Server received: Hello Server! Message #1 at t1\n")
            .write(b"Hello Server! Message #2\n")
            .read(b"Server received: Hello Server! Message #2 at t2\r\n")
            .write(b"quit\n")
            .build();
        let (reader, writer) = tokio::io::split(mock);

        let client = Client::new(test_config(0, 2, Duration::ZERO), ConnectionOptions::default());
        let summary = client.exchange(reader, writer).await.unwrap();

        assert_eq!(
            summary.responses,
            vec![
                "Server received: Hello Server! Message #1 at t1",
                "Server received: Hello Server! Message #2 at t2",
            ]
        );
    }

    #[tokio::test]
    async fn test_eof_before_response_is_fatal() {
        let mock = tokio_test::io::Builder::new()
            .write(b"Hello Server! Message #1\n")
            .read(b"Server received: Hello Server! Message #1 at t1\n")
            .write(b"Hello Server! Message #2\n")
            .build();
        let (reader, writer) = tokio::io::split(mock);

        let client = Client::new(test_config(0, 5, Duration::ZERO), ConnectionOptions::default());
        match client.exchange(reader, writer).await {
            Err(ClientError::UnexpectedEof { exchanged }) => assert_eq!(exchanged, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let mock = tokio_test::io::Builder::new()
            .write(b"Hello Server! Message #1\n")
            .wait(Duration::from_secs(1))
            .build();
        let (reader, writer) = tokio::io::split(mock);

        let options = ConnectionOptions {
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let client = Client::new(test_config(0, 5, Duration::ZERO), options);
        match client.exchange(reader, writer).await {
            Err(ClientError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(50)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quit_closes_server_session() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let session = tokio::spawn(async move {
            let mut session =
                EchoSession::new(server_read, server_write, &ConnectionOptions::default());
            session.run().await
        });

        let (mut reader, mut writer) = tokio::io::split(client_side);
        let client = Client::new(test_config(0, 5, Duration::ZERO), ConnectionOptions::default());
        let summary = client.exchange(&mut reader, &mut writer).await.unwrap();
        assert_eq!(summary.responses.len(), 5);

        let closed = session.await.unwrap().unwrap();
        assert_eq!(closed.reason, CloseReason::Sentinel);
        assert_eq!(closed.lines, 6);

        // The sentinel reply, then end of stream.
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert!(rest.starts_with("Server received: quit at "));
        assert_eq!(rest.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Grab a free port, then release it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = Client::new(test_config(port, 5, Duration::ZERO), ConnectionOptions::default());
        match client.run().await {
            Err(ClientError::Connect(target, _)) => assert_eq!(target, format!("127.0.0.1:{port}")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_against_server() {
        let server_config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let server = Server::bind(&server_config, ConnectionOptions::default())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(server.run());

        let pause = Duration::from_millis(20);
        let client = Client::new(test_config(port, 5, pause), ConnectionOptions::default());

        let started = Instant::now();
        let summary = client.run().await.unwrap();

        assert_eq!(summary.responses.len(), 5);
        for (i, response) in summary.responses.iter().enumerate() {
            let expected = format!("Server received: {} at ", message(i + 1));
            assert!(response.starts_with(&expected), "got {response}");
        }
        assert!(started.elapsed() >= pause * 5);
    }
}
