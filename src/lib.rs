//! A server-side implementation of the Sendmail milter protocol: wire
//! framing and the command/response codec, the per-connection protocol
//! dispatcher and option-negotiation, and a Tokio-based TCP transport that
//! drives them. See `SPEC_FULL.md` for the protocol this crate implements.
//!
//! User code implements [`handler::MilterHandler`] and
//! [`handler::MilterHandlerFactory`] and hands the factory to
//! [`transport::serve`]; everything else here is the protocol machinery that
//! stays the same across handlers.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod negotiation;
pub mod transport;
