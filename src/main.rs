use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tracing::info;

use milter::codec::Response;
use milter::error::HandlerError;
use milter::handler::{Capabilities, HandlerReply, MilterHandler, MilterHandlerFactory};
use milter::negotiation::ImplementedCallbacks;
use milter::transport::{self, TransportConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sendmail milter protocol server", long_about = None)]
struct Args {
    /// Address to listen on (host:port).
    #[arg(long, env = "MILTER_ADDRESS", default_value = "0.0.0.0:8892")]
    address: String,

    /// Maximum accepted frame size, in bytes.
    #[arg(long, env = "MILTER_MAX_FRAME_SIZE", default_value_t = milter::codec::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// Close a connection that sends nothing for this many seconds. Unset by default.
    #[arg(long, env = "MILTER_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// A minimal demonstration handler: logs every callback and accepts
/// everything. Exists so this crate is runnable out of the box; a real
/// deployment implements its own [`MilterHandler`] (out of scope per §1).
struct EchoHandler {
    ctx_id: String,
}

#[async_trait]
impl MilterHandler for EchoHandler {
    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
    }

    fn implemented_callbacks(&self) -> ImplementedCallbacks {
        ImplementedCallbacks {
            connect: true,
            helo: true,
            mail_from: true,
            rcpt_to: true,
            body: true,
            header: true,
            end_headers: true,
        }
    }

    async fn on_connect(
        &mut self,
        hostname: &str,
        family: u8,
        port: u16,
        address: &str,
    ) -> Result<HandlerReply, HandlerError> {
        info!(ctx_id = %self.ctx_id, hostname, family = %(family as char), port, address, "connect");
        Ok(HandlerReply::continue_())
    }

    async fn on_helo(&mut self, greeting: &str) -> Result<HandlerReply, HandlerError> {
        info!(ctx_id = %self.ctx_id, greeting, "helo");
        Ok(HandlerReply::continue_())
    }

    async fn on_mail_from(
        &mut self,
        address: &str,
        esmtp_args: &[String],
    ) -> Result<HandlerReply, HandlerError> {
        info!(ctx_id = %self.ctx_id, address, esmtp_args = ?esmtp_args, "mail from");
        Ok(HandlerReply::continue_())
    }

    async fn on_rcpt_to(
        &mut self,
        address: &str,
        esmtp_args: &[String],
    ) -> Result<HandlerReply, HandlerError> {
        info!(ctx_id = %self.ctx_id, address, esmtp_args = ?esmtp_args, "rcpt to");
        Ok(HandlerReply::continue_())
    }

    async fn on_header(&mut self, name: &str, value: &str) -> Result<HandlerReply, HandlerError> {
        info!(ctx_id = %self.ctx_id, name, "header");
        let _ = value;
        Ok(HandlerReply::continue_())
    }

    async fn on_end_headers(&mut self) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::continue_())
    }

    async fn on_body(&mut self, chunk: &[u8]) -> Result<HandlerReply, HandlerError> {
        info!(ctx_id = %self.ctx_id, chunk_size = chunk.len(), "body chunk");
        Ok(HandlerReply::continue_())
    }

    async fn on_end_body(&mut self) -> Result<HandlerReply, HandlerError> {
        info!(ctx_id = %self.ctx_id, "end of message");
        Ok(Response::Accept.into())
    }
}

struct EchoHandlerFactory;

impl MilterHandlerFactory for EchoHandlerFactory {
    type Handler = EchoHandler;

    fn new_handler(&self, ctx_id: &str) -> EchoHandler {
        EchoHandler {
            ctx_id: ctx_id.to_string(),
        }
    }
}

fn setup_logging(level: &str) {
    let filter = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    info!(address = %args.address, max_frame_size = args.max_frame_size, "starting milter server");

    let config = TransportConfig {
        max_frame_size: args.max_frame_size,
        idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
    };

    transport::serve(EchoHandlerFactory, &args.address, config).await?;
    Ok(())
}
