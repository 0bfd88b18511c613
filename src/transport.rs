//! The TCP listener and per-connection read/decode/dispatch/write loop.
//!
//! The transport is oblivious to milter semantics: it knows how to frame
//! bytes and how to keep a socket alive, nothing about what a `Connect` or a
//! `Reject` means. That knowledge lives entirely in [`crate::dispatcher`].

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::CodecError;
use crate::handler::MilterHandlerFactory;

/// Tunables for the accept loop and per-connection read loop. None of these
/// affect wire semantics; they bound resource use.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Ceiling on a single decoded frame's payload (§4.1, §9).
    pub max_frame_size: usize,
    /// Close a connection that has gone this long without a complete frame.
    /// `None` (the default) means no idle timeout is enforced; the MTA alone
    /// governs per-command pacing (§5).
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            idle_timeout: None,
        }
    }
}

/// Bind `addr` and run the accept loop forever, spawning one worker task per
/// connection. Each worker gets its own [`MilterHandler`](crate::handler::MilterHandler)
/// instance from `factory` and its own [`Dispatcher`].
pub async fn serve<F>(factory: F, addr: &str, config: TransportConfig) -> std::io::Result<()>
where
    F: MilterHandlerFactory + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "milter server listening");

    let factory = std::sync::Arc::new(factory);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let factory = factory.clone();
                info!(%peer, "accepted connection");
                tokio::spawn(async move {
                    let ctx_id = uuid::Uuid::new_v4().to_string();
                    if let Err(e) = handle_connection(stream, &factory, &ctx_id, config).await {
                        error!(ctx_id = %ctx_id, error = %e, "connection ended with an error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

async fn handle_connection<F>(
    stream: TcpStream,
    factory: &F,
    ctx_id: &str,
    config: TransportConfig,
) -> std::io::Result<()>
where
    F: MilterHandlerFactory,
{
    let handler = factory.new_handler(ctx_id);
    let dispatcher = Dispatcher::new(handler);
    run_connection(stream, ctx_id, dispatcher, config).await
}

/// Drive one connection's framing loop over any async byte stream. Exposed
/// separately from [`handle_connection`] so tests can exercise it over an
/// in-memory duplex pair instead of a real socket.
pub async fn run_connection<S, H>(
    mut stream: S,
    ctx_id: &str,
    mut dispatcher: Dispatcher<H>,
    config: TransportConfig,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: crate::handler::MilterHandler,
{
    let mut read_buf = [0u8; 4096];
    let mut pending = BytesMut::new();
    let mut command_count = 0u64;

    'connection: loop {
        let read_result = match config.idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, stream.read(&mut read_buf)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(ctx_id, "idle read timeout; closing connection");
                    break 'connection;
                }
            },
            None => stream.read(&mut read_buf).await,
        };

        let n = match read_result {
            Ok(0) => {
                debug!(ctx_id, total_commands = command_count, "peer closed connection");
                break 'connection;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(ctx_id, error = %e, "read error; closing connection");
                break 'connection;
            }
        };
        pending.extend_from_slice(&read_buf[..n]);

        loop {
            let decoded = codec::try_decode_frame(&pending, config.max_frame_size);
            let (consumed, payload) = match decoded {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(CodecError::EmptyFrame) | Err(CodecError::OversizedFrame { .. }) => {
                    warn!(ctx_id, "malformed frame on the wire; closing connection");
                    break 'connection;
                }
                Err(e) => {
                    warn!(ctx_id, error = %e, "malformed frame on the wire; closing connection");
                    break 'connection;
                }
            };
            pending.advance(consumed);

            let command = match codec::decode_command(&payload) {
                Ok(command) => command,
                Err(e) => {
                    warn!(ctx_id, error = %e, "malformed command payload; closing connection");
                    break 'connection;
                }
            };
            command_count += 1;

            let outcome = dispatcher.dispatch(command).await;
            match outcome {
                DispatchOutcome::Respond(response) => {
                    if write_frame(&mut stream, &response).await.is_err() {
                        break 'connection;
                    }
                }
                DispatchOutcome::RespondMany(responses) => {
                    for response in &responses {
                        if write_frame(&mut stream, response).await.is_err() {
                            break 'connection;
                        }
                    }
                }
                DispatchOutcome::Silent => {}
                DispatchOutcome::Close(reason) => {
                    debug!(ctx_id, reason = %reason, total_commands = command_count, "closing connection");
                    break 'connection;
                }
            }
        }
    }

    Ok(())
}

async fn write_frame<S>(stream: &mut S, response: &codec::Response) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&codec::encode_frame(response)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Command, Response};
    use crate::error::HandlerError;
    use crate::handler::{HandlerReply, MilterHandler};
    use async_trait::async_trait;

    #[derive(Default)]
    struct EchoHandler;

    #[async_trait]
    impl MilterHandler for EchoHandler {
        async fn on_helo(&mut self, greeting: &str) -> Result<HandlerReply, HandlerError> {
            if greeting == "refuse-me" {
                Err(HandlerError::PermFailure)
            } else {
                Ok(HandlerReply::continue_())
            }
        }
    }

    #[tokio::test]
    async fn e4_header_then_end_headers_over_the_wire() {
        let (mut client, server) = tokio::io::duplex(4096);
        let dispatcher = Dispatcher::new(EchoHandler);
        let server_task = tokio::spawn(run_connection(
            server,
            "test-ctx",
            dispatcher,
            TransportConfig::default(),
        ));

        let header_frame = codec::frame(b"LSubject\0Hi\0");
        let eoh_frame = codec::frame(b"N");
        let quit_frame = codec::frame(b"Q");
        client.write_all(&header_frame).await.unwrap();
        client.write_all(&eoh_frame).await.unwrap();
        client.write_all(&quit_frame).await.unwrap();

        let mut response_bytes = Vec::new();
        client.read_to_end(&mut response_bytes).await.unwrap();
        drop(client);
        server_task.await.unwrap().unwrap();

        let expected = {
            let mut buf = Vec::new();
            buf.extend_from_slice(&codec::encode_frame(&Response::Continue));
            buf.extend_from_slice(&codec::encode_frame(&Response::Continue));
            buf
        };
        assert_eq!(response_bytes, expected);
    }

    #[tokio::test]
    async fn reject_is_sent_then_connection_stays_open_for_next_command() {
        let (mut client, server) = tokio::io::duplex(4096);
        let dispatcher = Dispatcher::new(EchoHandler);
        let server_task = tokio::spawn(run_connection(
            server,
            "test-ctx",
            dispatcher,
            TransportConfig::default(),
        ));

        client
            .write_all(&codec::frame(b"Hrefuse-me"))
            .await
            .unwrap();
        client.write_all(&codec::frame(b"Q")).await.unwrap();

        let mut response_bytes = Vec::new();
        client.read_to_end(&mut response_bytes).await.unwrap();
        drop(client);
        server_task.await.unwrap().unwrap();

        assert_eq!(response_bytes, codec::encode_frame(&Response::Reject));
    }

    #[tokio::test]
    async fn malformed_frame_closes_without_a_response() {
        let (mut client, server) = tokio::io::duplex(4096);
        let dispatcher = Dispatcher::new(EchoHandler);
        let server_task = tokio::spawn(run_connection(
            server,
            "test-ctx",
            dispatcher,
            TransportConfig::default(),
        ));

        // A zero length prefix is an EmptyFrame error.
        client.write_all(&0u32.to_be_bytes()).await.unwrap();

        let mut response_bytes = Vec::new();
        client.read_to_end(&mut response_bytes).await.unwrap();
        drop(client);
        server_task.await.unwrap().unwrap();

        assert!(response_bytes.is_empty());
    }

    #[tokio::test]
    async fn decoder_tolerates_split_frames_across_reads() {
        let (mut client, server) = tokio::io::duplex(4096);
        let dispatcher = Dispatcher::new(EchoHandler);
        let server_task = tokio::spawn(run_connection(
            server,
            "test-ctx",
            dispatcher,
            TransportConfig::default(),
        ));

        let frame = codec::frame(b"Hhello");
        client.write_all(&frame[..2]).await.unwrap();
        client.write_all(&frame[2..]).await.unwrap();
        client.write_all(&codec::frame(b"Q")).await.unwrap();

        let mut response_bytes = Vec::new();
        client.read_to_end(&mut response_bytes).await.unwrap();
        drop(client);
        server_task.await.unwrap().unwrap();

        assert_eq!(response_bytes, codec::encode_frame(&Response::Continue));
    }

    #[test]
    fn command_decode_then_response_encode_is_consistent_with_decode_table() {
        // Cross-check against crate::codec::Command without importing Command
        // unused warnings: exercise decode on a minimal quit frame.
        let (_, payload) =
            codec::try_decode_frame(&codec::frame(b"Q"), DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .unwrap();
        assert_eq!(codec::decode_command(&payload).unwrap(), Command::Quit);
    }
}
