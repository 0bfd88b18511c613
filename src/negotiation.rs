//! Option-negotiation bit masks and the per-connection negotiation state.
//!
//! The milter handshake lets the handler advertise which modifications it may
//! perform (`actions_mask`) and which optional callback streams it actually
//! wants (`protocol_mask`, inverted: a set bit means "skip this"). Both masks
//! are computed once, at the first `OptNeg`, and never revisited.

/// The protocol version this server advertises and negotiates against peers.
pub const PROTOCOL_VERSION: u32 = 2;

// Action bits (OptNeg actions_mask), advertised by the handler.
pub const ACTION_ADD_HEADERS: u32 = 0x01;
pub const ACTION_CHANGE_BODY: u32 = 0x02;
pub const ACTION_ADD_RECIPIENT: u32 = 0x04;
pub const ACTION_DELETE_RECIPIENT: u32 = 0x08;
pub const ACTION_CHANGE_HEADERS: u32 = 0x10;
pub const ACTION_QUARANTINE: u32 = 0x20;

// Protocol skip bits (OptNeg protocol_mask). Set means "do not send me this command".
pub const SKIP_CONNECT: u32 = 0x01;
pub const SKIP_HELO: u32 = 0x02;
pub const SKIP_MAIL_FROM: u32 = 0x04;
pub const SKIP_RCPT_TO: u32 = 0x08;
pub const SKIP_BODY: u32 = 0x10;
pub const SKIP_HEADER: u32 = 0x20;
pub const SKIP_END_HEADERS: u32 = 0x40;

/// Every optional callback-skip bit set: the handler has opted out of everything
/// until it declares otherwise via [`ImplementedCallbacks`].
pub const ALL_SKIPPED: u32 = 0x7f;

/// Which of the optional (skippable) callbacks a handler implements.
///
/// Rust has no runtime method-presence reflection, so unlike the reflective
/// original this is an explicit, construction-time declaration: a handler
/// returns one of these from [`MilterHandler::implemented_callbacks`]
/// (crate::handler::MilterHandler) and the dispatcher clears the matching
/// protocol skip-bit for each flag present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImplementedCallbacks {
    pub connect: bool,
    pub helo: bool,
    pub mail_from: bool,
    pub rcpt_to: bool,
    pub body: bool,
    pub header: bool,
    pub end_headers: bool,
}

impl ImplementedCallbacks {
    /// The advertised protocol mask this declaration produces: [`ALL_SKIPPED`]
    /// with one bit cleared per implemented callback.
    pub fn advertised_protocol_mask(&self) -> u32 {
        let mut mask = ALL_SKIPPED;
        if self.connect {
            mask &= !SKIP_CONNECT;
        }
        if self.helo {
            mask &= !SKIP_HELO;
        }
        if self.mail_from {
            mask &= !SKIP_MAIL_FROM;
        }
        if self.rcpt_to {
            mask &= !SKIP_RCPT_TO;
        }
        if self.body {
            mask &= !SKIP_BODY;
        }
        if self.header {
            mask &= !SKIP_HEADER;
        }
        if self.end_headers {
            mask &= !SKIP_END_HEADERS;
        }
        mask
    }
}

/// Per-connection negotiation state, established once by the first `OptNeg`
/// and read-only thereafter.
#[derive(Debug, Clone, Default)]
pub struct SessionNegotiation {
    /// Bitmask of actions this handler may perform, as advertised at construction.
    pub advertised_actions: u32,
    /// Bitmask of callbacks this handler does *not* want to receive.
    pub advertised_protocol: u32,
    /// Actions actually agreed with the peer (intersection with the peer's offer).
    pub negotiated_actions: u32,
    /// Protocol skip bits actually agreed with the peer.
    pub negotiated_protocol: u32,
    /// Version agreed with the peer at the first `OptNeg`.
    pub negotiated_version: u32,
    /// Whether `OptNeg` has already been processed on this connection.
    pub negotiated: bool,
}

impl SessionNegotiation {
    pub fn new(advertised_actions: u32, implemented: ImplementedCallbacks) -> Self {
        Self {
            advertised_actions,
            advertised_protocol: implemented.advertised_protocol_mask(),
            negotiated_actions: 0,
            negotiated_protocol: 0,
            negotiated_version: 0,
            negotiated: false,
        }
    }

    /// Apply an inbound `OptNeg` from the peer, returning the values that
    /// should be echoed back in the `OptNegAck`. The masks are established by
    /// the first call and not renegotiated (§3): a later call with different
    /// peer masks still returns the values locked in by the first one.
    pub fn negotiate(&mut self, peer_version: u32, peer_actions: u32, peer_protocol: u32) -> (u32, u32, u32) {
        if self.negotiated {
            return (self.negotiated_version, self.negotiated_actions, self.negotiated_protocol);
        }
        self.negotiated_version = PROTOCOL_VERSION.min(peer_version);
        self.negotiated_actions = self.advertised_actions & peer_actions;
        self.negotiated_protocol = self.advertised_protocol & peer_protocol;
        self.negotiated = true;
        (self.negotiated_version, self.negotiated_actions, self.negotiated_protocol)
    }
}
