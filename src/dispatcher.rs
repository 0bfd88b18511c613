//! The per-connection protocol state machine: turns one decoded [`Command`]
//! into a [`DispatchOutcome`] by invoking the matching handler callback and
//! folding option-negotiation and error-taxonomy rules (§4.2, §7) on top.

use tracing::warn;

use crate::codec::{Command, Response};
use crate::error::HandlerError;
use crate::handler::{HandlerReply, MilterHandler};
use crate::negotiation::SessionNegotiation;

/// What the dispatcher decided to do with one command. The transport is
/// responsible for turning this into bytes on the wire (or a closed socket).
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Write exactly one response.
    Respond(Response),
    /// Write zero or more responses, contiguously, in order.
    RespondMany(Vec<Response>),
    /// Write nothing.
    Silent,
    /// Write nothing further; the transport must close the connection after
    /// any writes already queued for this command have drained.
    Close(String),
}

/// Owns one connection's [`MilterHandler`] instance and its
/// [`SessionNegotiation`]. Constructed once per accepted connection and
/// dropped when that connection ends.
pub struct Dispatcher<H: MilterHandler> {
    handler: H,
    negotiation: SessionNegotiation,
}

impl<H: MilterHandler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        let implemented = handler.implemented_callbacks();
        let actions = handler.capabilities().actions_mask();
        Self {
            handler,
            negotiation: SessionNegotiation::new(actions, implemented),
        }
    }

    /// The connection's negotiation state, for handlers/transports that want
    /// to observe what was actually agreed with the peer.
    pub fn negotiation(&self) -> &SessionNegotiation {
        &self.negotiation
    }

    /// Route one decoded command to its callback and produce the outcome the
    /// transport should act on. Never blocks on anything but the handler
    /// callback itself; performs no I/O of its own.
    pub async fn dispatch(&mut self, command: Command) -> DispatchOutcome {
        match command {
            Command::OptNeg {
                version,
                actions,
                protocol,
            } => self.dispatch_optneg(version, actions, protocol).await,

            Command::Connect {
                hostname,
                family,
                port,
                address,
            } => {
                let result = self.handler.on_connect(&hostname, family, port, &address).await;
                Self::reply_outcome(result)
            }

            Command::Helo { greeting } => {
                let result = self.handler.on_helo(&greeting).await;
                Self::reply_outcome(result)
            }

            Command::MailFrom {
                address,
                esmtp_args,
            } => {
                let result = self.handler.on_mail_from(&address, &esmtp_args).await;
                Self::reply_outcome(result)
            }

            Command::RcptTo {
                address,
                esmtp_args,
            } => {
                let result = self.handler.on_rcpt_to(&address, &esmtp_args).await;
                Self::reply_outcome(result)
            }

            Command::Data => {
                let result = self.handler.on_data().await;
                Self::reply_outcome(result)
            }

            Command::Header { name, value } => {
                let result = self.handler.on_header(&name, &value).await;
                Self::reply_outcome(result)
            }

            Command::EndHeaders => {
                let result = self.handler.on_end_headers().await;
                Self::reply_outcome(result)
            }

            Command::Body { chunk } => {
                let result = self.handler.on_body(&chunk).await;
                Self::reply_outcome(result)
            }

            Command::EndBody => {
                let result = self.handler.on_end_body().await;
                Self::reply_outcome(result)
            }

            Command::Abort => {
                let result = self.handler.on_abort().await;
                match result {
                    Ok(HandlerReply::Silent) => DispatchOutcome::Respond(Response::Continue),
                    Ok(other) => Self::reply_outcome(Ok(other)),
                    Err(e) => Self::error_outcome(e),
                }
            }

            Command::Quit => {
                // The dispatcher closes on Quit regardless of what the handler
                // returns; the handler gets a chance to observe/react first.
                let _ = self.handler.on_quit().await;
                DispatchOutcome::Close("quit".to_string())
            }

            Command::Macro { macro_cmd, items } => match self.handler.on_macro(macro_cmd, &items).await {
                Ok(()) => DispatchOutcome::Silent,
                Err(e) => Self::error_outcome(e),
            },

            Command::Unknown { raw } => {
                let result = self.handler.on_unknown(&raw).await;
                Self::reply_outcome(result)
            }

            Command::Reserved { code, .. } => {
                warn!(command = code, "reserved milter command code; replying Continue without invoking handler");
                DispatchOutcome::Respond(Response::Continue)
            }
        }
    }

    async fn dispatch_optneg(&mut self, version: u32, actions: u32, protocol: u32) -> DispatchOutcome {
        let (negotiated_version, actions_mask, protocol_mask) =
            self.negotiation.negotiate(version, actions, protocol);
        let default_ack = Response::OptNegAck {
            version: negotiated_version,
            actions_mask,
            protocol_mask,
        };

        match self.handler.on_optneg(version, actions, protocol).await {
            Ok(HandlerReply::Silent) => DispatchOutcome::Respond(default_ack),
            Ok(HandlerReply::One(overridden)) => DispatchOutcome::Respond(overridden),
            Ok(HandlerReply::Many(responses)) => DispatchOutcome::RespondMany(responses),
            Err(e) => Self::error_outcome(e),
        }
    }

    fn reply_outcome(result: Result<HandlerReply, HandlerError>) -> DispatchOutcome {
        match result {
            Ok(HandlerReply::Silent) => DispatchOutcome::Silent,
            Ok(HandlerReply::One(response)) => DispatchOutcome::Respond(response),
            Ok(HandlerReply::Many(responses)) => DispatchOutcome::RespondMany(responses),
            Err(e) => Self::error_outcome(e),
        }
    }

    fn error_outcome(error: HandlerError) -> DispatchOutcome {
        match error {
            HandlerError::TempFailure => DispatchOutcome::Respond(Response::TempFail),
            HandlerError::PermFailure => DispatchOutcome::Respond(Response::Reject),
            HandlerError::CloseConnection(reason) => DispatchOutcome::Close(reason),
        }
    }
}
