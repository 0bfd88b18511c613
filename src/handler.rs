//! The trait user code implements to receive milter callbacks, plus the small
//! value types (`Capabilities`, `HandlerReply`) handlers use to talk back to
//! the dispatcher.
//!
//! One handler instance belongs to exactly one connection (§3 invariants):
//! there is no `ctx_id`-keyed map to manage here, unlike a design where a
//! single shared handler serves every connection. The dispatcher constructs
//! a fresh handler, via [`MilterHandlerFactory`], before the connection's
//! first command and drops it once the connection closes.

use async_trait::async_trait;

use crate::codec::Response;
use crate::error::HandlerError;
use crate::negotiation::{
    ACTION_ADD_HEADERS, ACTION_ADD_RECIPIENT, ACTION_CHANGE_BODY, ACTION_CHANGE_HEADERS,
    ACTION_DELETE_RECIPIENT, ACTION_QUARANTINE,
};

/// Which modifications a handler may request, declared once at construction.
/// Each flag sets the matching bit in the `OptNeg` actions mask (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub add_headers: bool,
    pub change_body: bool,
    pub add_recipient: bool,
    pub delete_recipient: bool,
    pub change_headers: bool,
    pub quarantine: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn can_add_headers(mut self) -> Self {
        self.add_headers = true;
        self
    }

    pub fn can_change_body(mut self) -> Self {
        self.change_body = true;
        self
    }

    pub fn can_add_recipient(mut self) -> Self {
        self.add_recipient = true;
        self
    }

    pub fn can_delete_recipient(mut self) -> Self {
        self.delete_recipient = true;
        self
    }

    pub fn can_change_headers(mut self) -> Self {
        self.change_headers = true;
        self
    }

    pub fn can_quarantine(mut self) -> Self {
        self.quarantine = true;
        self
    }

    pub fn actions_mask(&self) -> u32 {
        let mut mask = 0;
        if self.add_headers {
            mask |= ACTION_ADD_HEADERS;
        }
        if self.change_body {
            mask |= ACTION_CHANGE_BODY;
        }
        if self.add_recipient {
            mask |= ACTION_ADD_RECIPIENT;
        }
        if self.delete_recipient {
            mask |= ACTION_DELETE_RECIPIENT;
        }
        if self.change_headers {
            mask |= ACTION_CHANGE_HEADERS;
        }
        if self.quarantine {
            mask |= ACTION_QUARANTINE;
        }
        mask
    }
}

/// What a callback hands back to the dispatcher. This promotes the
/// single-response/list-of-responses/no-response ambiguity of the reflective
/// original into an explicit, un-confusable shape (§9).
#[derive(Debug, Clone)]
pub enum HandlerReply {
    /// No bytes are written for this command.
    Silent,
    /// Exactly one response is written.
    One(Response),
    /// Zero or more responses, written contiguously in order.
    Many(Vec<Response>),
}

impl HandlerReply {
    /// Shorthand for the overwhelmingly common case: a single `Continue`.
    pub fn continue_() -> Self {
        HandlerReply::One(Response::Continue)
    }
}

impl From<Response> for HandlerReply {
    fn from(response: Response) -> Self {
        HandlerReply::One(response)
    }
}

impl From<Vec<Response>> for HandlerReply {
    fn from(responses: Vec<Response>) -> Self {
        HandlerReply::Many(responses)
    }
}

/// User-implemented callbacks for one milter connection.
///
/// Every method has a default that is protocol-safe (`Continue`, or `Silent`
/// for macros) so a handler only needs to override the commands it cares
/// about. Overriding a callback is necessary but not sufficient to have the
/// MTA actually send it: the handler must also report the override through
/// [`implemented_callbacks`](MilterHandler::implemented_callbacks), since Rust
/// has no runtime way for the dispatcher to notice an override on its own
/// (§4.3, §9).
#[async_trait]
pub trait MilterHandler: Send + Sync {
    /// Actions this handler may request of the MTA. Defaults to none.
    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
    }

    /// Which optional callback streams this handler actually wants to receive.
    fn implemented_callbacks(&self) -> crate::negotiation::ImplementedCallbacks {
        crate::negotiation::ImplementedCallbacks::default()
    }

    /// Notification that `OptNeg` was received; the dispatcher has already
    /// computed the `OptNegAck` it will send (§4.2) and this return value is
    /// discarded unless it is something other than [`HandlerReply::Silent`].
    async fn on_optneg(
        &mut self,
        peer_version: u32,
        peer_actions: u32,
        peer_protocol: u32,
    ) -> Result<HandlerReply, HandlerError> {
        let _ = (peer_version, peer_actions, peer_protocol);
        Ok(HandlerReply::Silent)
    }

    async fn on_connect(
        &mut self,
        hostname: &str,
        family: u8,
        port: u16,
        address: &str,
    ) -> Result<HandlerReply, HandlerError> {
        let _ = (hostname, family, port, address);
        Ok(HandlerReply::continue_())
    }

    async fn on_helo(&mut self, greeting: &str) -> Result<HandlerReply, HandlerError> {
        let _ = greeting;
        Ok(HandlerReply::continue_())
    }

    async fn on_mail_from(
        &mut self,
        address: &str,
        esmtp_args: &[String],
    ) -> Result<HandlerReply, HandlerError> {
        let _ = (address, esmtp_args);
        Ok(HandlerReply::continue_())
    }

    async fn on_rcpt_to(
        &mut self,
        address: &str,
        esmtp_args: &[String],
    ) -> Result<HandlerReply, HandlerError> {
        let _ = (address, esmtp_args);
        Ok(HandlerReply::continue_())
    }

    async fn on_data(&mut self) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::continue_())
    }

    async fn on_header(&mut self, name: &str, value: &str) -> Result<HandlerReply, HandlerError> {
        let _ = (name, value);
        Ok(HandlerReply::continue_())
    }

    async fn on_end_headers(&mut self) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::continue_())
    }

    async fn on_body(&mut self, chunk: &[u8]) -> Result<HandlerReply, HandlerError> {
        let _ = chunk;
        Ok(HandlerReply::continue_())
    }

    async fn on_end_body(&mut self) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::continue_())
    }

    /// Reset per-transaction state; the connection stays open. The dispatcher
    /// emits `Continue` when this returns [`HandlerReply::Silent`] (the
    /// default), since `Abort` has no MTA-visible no-reply mode of its own.
    async fn on_abort(&mut self) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::Silent)
    }

    /// The dispatcher closes the connection on `Quit` unconditionally; the
    /// default implementation documents that contract by signalling
    /// [`HandlerError::CloseConnection`] itself.
    async fn on_quit(&mut self) -> Result<HandlerReply, HandlerError> {
        Err(HandlerError::CloseConnection("quit".to_string()))
    }

    /// Macros never produce a response; this is called for observation only.
    async fn on_macro(&mut self, macro_cmd: u8, items: &[String]) -> Result<(), HandlerError> {
        let _ = (macro_cmd, items);
        Ok(())
    }

    async fn on_unknown(&mut self, raw: &[u8]) -> Result<HandlerReply, HandlerError> {
        let _ = raw;
        Ok(HandlerReply::continue_())
    }
}

/// Constructs one [`MilterHandler`] per accepted connection.
///
/// The transport holds one factory for the lifetime of the listener and
/// calls [`new_handler`](MilterHandlerFactory::new_handler) once per
/// connection; the resulting handler is owned by that connection's
/// dispatcher and dropped when the connection ends.
pub trait MilterHandlerFactory: Send + Sync {
    type Handler: MilterHandler + 'static;

    fn new_handler(&self, ctx_id: &str) -> Self::Handler;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_mask_matches_declared_flags() {
        let caps = Capabilities::none().can_add_headers().can_quarantine();
        assert_eq!(caps.actions_mask(), ACTION_ADD_HEADERS | ACTION_QUARANTINE);
    }

    #[test]
    fn capabilities_default_to_no_actions() {
        assert_eq!(Capabilities::none().actions_mask(), 0);
    }
}
