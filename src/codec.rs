//! Wire framing and the command/response codec.
//!
//! Everything in this module is a pure function: no sockets, no state. A full
//! milter packet is `len:u32_be ‖ payload[len]`, where `payload` is one command
//! byte followed by command-specific data. [`try_decode_frame`] peels one such
//! packet off an in-memory buffer; [`decode_command`] interprets its payload;
//! [`encode_response`] and [`frame`] go the other way.

use crate::error::CodecError;

// Milter protocol commands (inbound, SMFIC_ in the reference implementation).
pub const CMD_OPTNEG: u8 = b'O';
pub const CMD_MACRO: u8 = b'D';
pub const CMD_CONNECT: u8 = b'C';
pub const CMD_HELO: u8 = b'H';
pub const CMD_MAIL_FROM: u8 = b'M';
pub const CMD_RCPT_TO: u8 = b'R';
pub const CMD_DATA: u8 = b'T';
pub const CMD_HEADER: u8 = b'L';
pub const CMD_END_HEADERS: u8 = b'N';
pub const CMD_BODY: u8 = b'B';
pub const CMD_END_BODY: u8 = b'E';
pub const CMD_ABORT: u8 = b'A';
pub const CMD_QUIT: u8 = b'Q';
pub const CMD_UNKNOWN: u8 = b'U';

// Milter protocol responses (outbound, SMFIR_ in the reference implementation).
pub const RESP_ADD_RCPT: u8 = b'+';
pub const RESP_DEL_RCPT: u8 = b'-';
pub const RESP_ACCEPT: u8 = b'a';
pub const RESP_REPLACE_BODY: u8 = b'b';
pub const RESP_CONTINUE: u8 = b'c';
pub const RESP_DISCARD: u8 = b'd';
pub const RESP_CONN_FAIL: u8 = b'f';
pub const RESP_ADD_HEADER: u8 = b'h';
pub const RESP_INS_HEADER: u8 = b'i';
pub const RESP_CHG_HEADER: u8 = b'm';
pub const RESP_PROGRESS: u8 = b'p';
pub const RESP_QUARANTINE: u8 = b'q';
pub const RESP_REJECT: u8 = b'r';
pub const RESP_SET_SENDER: u8 = b's';
pub const RESP_TEMPFAIL: u8 = b't';
pub const RESP_REPLY_CODE: u8 = b'y';
pub const RESP_OPTNEG_ACK: u8 = b'O';

/// Default ceiling on a decoded frame's payload: the typical 65535-byte body
/// chunk plus slack for header/envelope commands riding in the same frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65_535 + 4096;

/// One decoded milter command. Exactly one variant per command code in the
/// protocol table; [`Command::Unknown`] absorbs any code outside that table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    OptNeg {
        version: u32,
        actions: u32,
        protocol: u32,
    },
    Macro {
        macro_cmd: u8,
        items: Vec<String>,
    },
    Connect {
        hostname: String,
        family: u8,
        port: u16,
        address: String,
    },
    Helo {
        greeting: String,
    },
    MailFrom {
        address: String,
        esmtp_args: Vec<String>,
    },
    RcptTo {
        address: String,
        esmtp_args: Vec<String>,
    },
    Data,
    Header {
        name: String,
        value: String,
    },
    EndHeaders,
    Body {
        chunk: Vec<u8>,
    },
    EndBody,
    Abort,
    Quit,
    /// The `U` wire command: an SMTP command the MTA itself did not recognize,
    /// forwarded verbatim. Routed to [`MilterHandler::on_unknown`](crate::handler::MilterHandler::on_unknown).
    Unknown {
        raw: Vec<u8>,
    },
    /// A command byte outside the 14-entry protocol table (§3/§6). The
    /// dispatcher replies `Continue` and logs without invoking the handler
    /// (testable property 6). Distinct from the `U` command above, which the
    /// table does define.
    Reserved {
        code: u8,
        raw: Vec<u8>,
    },
}

impl Command {
    /// The wire command byte this value decodes from / would encode as.
    pub fn code(&self) -> u8 {
        match self {
            Command::OptNeg { .. } => CMD_OPTNEG,
            Command::Macro { .. } => CMD_MACRO,
            Command::Connect { .. } => CMD_CONNECT,
            Command::Helo { .. } => CMD_HELO,
            Command::MailFrom { .. } => CMD_MAIL_FROM,
            Command::RcptTo { .. } => CMD_RCPT_TO,
            Command::Data => CMD_DATA,
            Command::Header { .. } => CMD_HEADER,
            Command::EndHeaders => CMD_END_HEADERS,
            Command::Body { .. } => CMD_BODY,
            Command::EndBody => CMD_END_BODY,
            Command::Abort => CMD_ABORT,
            Command::Quit => CMD_QUIT,
            Command::Unknown { .. } => CMD_UNKNOWN,
            Command::Reserved { code, .. } => *code,
        }
    }
}

/// One encodable response record. See §4.1/§6 of the protocol spec for the
/// exact payload layout of each variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    AddRcpt(String),
    DelRcpt(String),
    Accept,
    ReplaceBody(Vec<u8>),
    Continue,
    Discard,
    ConnFail,
    AddHeader(String, String),
    InsHeader(u32, String, String),
    ChgHeader(u32, String, String),
    Progress,
    Quarantine(String),
    Reject,
    SetSender(String),
    TempFail,
    ReplyCode(u16, String),
    OptNegAck {
        version: u32,
        actions_mask: u32,
        protocol_mask: u32,
    },
}

/// Attempt to peel one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a full frame (the caller
/// should read more bytes and retry). On success, returns the number of
/// bytes the frame occupied (including the 4-byte length prefix) and the
/// frame's payload (command byte + data), so the caller can drain its own
/// buffer. This function never mutates `buf`.
pub fn try_decode_frame(
    buf: &[u8],
    max_frame_size: usize,
) -> Result<Option<(usize, Vec<u8>)>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        return Err(CodecError::EmptyFrame);
    }
    if len > max_frame_size {
        return Err(CodecError::OversizedFrame {
            len,
            max: max_frame_size,
        });
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let payload = buf[4..4 + len].to_vec();
    Ok(Some((4 + len, payload)))
}

/// Wrap an already-encoded `code_byte ‖ payload` body in its 4-byte length prefix.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Split `data` on the first NUL byte, returning the bytes before it and the
/// bytes after. Fails if no NUL is present.
fn split_cstring(data: &[u8], command: u8) -> Result<(&[u8], &[u8]), CodecError> {
    let pos = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::MissingTerminator { command })?;
    Ok((&data[..pos], &data[pos + 1..]))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Split `data` on NUL into a sequence of strings, the convention used by the
/// `D` (macro), `M` (mail from) and `R` (rcpt to) payloads: NUL-separated,
/// with a trailing NUL on the final element tolerated and dropped.
fn split_sequence(data: &[u8]) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    let trimmed = if data.last() == Some(&0) {
        &data[..data.len() - 1]
    } else {
        data
    };
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split(|&b| b == 0).map(lossy).collect()
}

/// Decode a full packet payload (command byte followed by command-specific
/// data) into a typed [`Command`].
pub fn decode_command(payload: &[u8]) -> Result<Command, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::MissingCommandByte);
    }
    let command = payload[0];
    let data = &payload[1..];

    match command {
        CMD_OPTNEG => {
            if data.len() != 12 {
                return Err(CodecError::TruncatedPayload {
                    command,
                    expected: 12,
                    got: data.len(),
                });
            }
            Ok(Command::OptNeg {
                version: u32::from_be_bytes(data[0..4].try_into().unwrap()),
                actions: u32::from_be_bytes(data[4..8].try_into().unwrap()),
                protocol: u32::from_be_bytes(data[8..12].try_into().unwrap()),
            })
        }
        CMD_MACRO => {
            if data.is_empty() {
                return Err(CodecError::TruncatedPayload {
                    command,
                    expected: 1,
                    got: 0,
                });
            }
            Ok(Command::Macro {
                macro_cmd: data[0],
                items: split_sequence(&data[1..]),
            })
        }
        CMD_CONNECT => {
            let (hostname, rest) = split_cstring(data, command)?;
            if rest.len() < 3 {
                return Err(CodecError::TruncatedPayload {
                    command,
                    expected: 3,
                    got: rest.len(),
                });
            }
            let family = rest[0];
            let port = u16::from_be_bytes([rest[1], rest[2]]);
            let address = &rest[3..];
            Ok(Command::Connect {
                hostname: lossy(hostname),
                family,
                port,
                address: lossy(address),
            })
        }
        CMD_HELO => Ok(Command::Helo {
            greeting: lossy(data),
        }),
        CMD_MAIL_FROM => {
            let (address, rest) = split_cstring(data, command)?;
            Ok(Command::MailFrom {
                address: lossy(address),
                esmtp_args: split_sequence(rest),
            })
        }
        CMD_RCPT_TO => {
            let (address, rest) = split_cstring(data, command)?;
            Ok(Command::RcptTo {
                address: lossy(address),
                esmtp_args: split_sequence(rest),
            })
        }
        CMD_DATA => Ok(Command::Data),
        CMD_HEADER => {
            let (name, rest) = split_cstring(data, command)?;
            let (value, _) = split_cstring(rest, command)?;
            Ok(Command::Header {
                name: lossy(name),
                value: lossy(value),
            })
        }
        CMD_END_HEADERS => Ok(Command::EndHeaders),
        CMD_BODY => Ok(Command::Body {
            chunk: data.to_vec(),
        }),
        CMD_END_BODY => Ok(Command::EndBody),
        CMD_ABORT => Ok(Command::Abort),
        CMD_QUIT => Ok(Command::Quit),
        CMD_UNKNOWN => Ok(Command::Unknown {
            raw: data.to_vec(),
        }),
        other => Ok(Command::Reserved {
            code: other,
            raw: data.to_vec(),
        }),
    }
}

/// Encode a response's `code_byte ‖ payload` body. Callers wrap the result in
/// [`frame`] before writing it to the wire.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut out = Vec::new();
    match response {
        Response::AddRcpt(addr) => {
            out.push(RESP_ADD_RCPT);
            push_cstring(&mut out, addr);
        }
        Response::DelRcpt(addr) => {
            out.push(RESP_DEL_RCPT);
            push_cstring(&mut out, addr);
        }
        Response::Accept => out.push(RESP_ACCEPT),
        Response::ReplaceBody(body) => {
            out.push(RESP_REPLACE_BODY);
            out.extend_from_slice(body);
        }
        Response::Continue => out.push(RESP_CONTINUE),
        Response::Discard => out.push(RESP_DISCARD),
        Response::ConnFail => out.push(RESP_CONN_FAIL),
        Response::AddHeader(name, value) => {
            out.push(RESP_ADD_HEADER);
            push_cstring(&mut out, name);
            push_cstring(&mut out, value);
        }
        Response::InsHeader(index, name, value) => {
            out.push(RESP_INS_HEADER);
            out.extend_from_slice(&index.to_be_bytes());
            push_cstring(&mut out, name);
            push_cstring(&mut out, value);
        }
        Response::ChgHeader(index, name, value) => {
            out.push(RESP_CHG_HEADER);
            out.extend_from_slice(&index.to_be_bytes());
            push_cstring(&mut out, name);
            push_cstring(&mut out, value);
        }
        Response::Progress => out.push(RESP_PROGRESS),
        Response::Quarantine(reason) => {
            out.push(RESP_QUARANTINE);
            push_cstring(&mut out, reason);
        }
        Response::Reject => out.push(RESP_REJECT),
        Response::SetSender(addr) => {
            out.push(RESP_SET_SENDER);
            push_cstring(&mut out, addr);
        }
        Response::TempFail => out.push(RESP_TEMPFAIL),
        Response::ReplyCode(code, text) => {
            out.push(RESP_REPLY_CODE);
            out.extend_from_slice(format!("{code:03} {text}").as_bytes());
            out.push(0);
        }
        Response::OptNegAck {
            version,
            actions_mask,
            protocol_mask,
        } => {
            out.push(RESP_OPTNEG_ACK);
            out.extend_from_slice(&version.to_be_bytes());
            out.extend_from_slice(&actions_mask.to_be_bytes());
            out.extend_from_slice(&protocol_mask.to_be_bytes());
        }
    }
    out
}

fn push_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Encode a response directly into a full, length-prefixed wire frame.
pub fn encode_frame(response: &Response) -> Vec<u8> {
    frame(&encode_response(response))
}

impl Response {
    // Pure factory methods, exposed to handler implementations so they never
    // have to spell out a variant by hand for the common verdicts.
    pub fn accept() -> Self {
        Response::Accept
    }

    pub fn reject() -> Self {
        Response::Reject
    }

    pub fn discard() -> Self {
        Response::Discard
    }

    pub fn tempfail() -> Self {
        Response::TempFail
    }

    pub fn cont() -> Self {
        Response::Continue
    }

    pub fn custom_reply(code: u16, text: impl Into<String>) -> Self {
        Response::ReplyCode(code, text.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_frame(body: &[u8]) -> Vec<u8> {
        let framed = frame(body);
        let (consumed, payload) = try_decode_frame(&framed, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(consumed, framed.len());
        payload
    }

    #[test]
    fn decodes_optneg() {
        let payload = roundtrip_frame(b"O\x00\x00\x00\x02\x00\x00\x00\x3f\x00\x00\x00\x7f");
        assert_eq!(
            decode_command(&payload).unwrap(),
            Command::OptNeg {
                version: 2,
                actions: 0x3f,
                protocol: 0x7f,
            }
        );
    }

    #[test]
    fn rejects_empty_frame() {
        let framed = frame(b"");
        assert!(matches!(
            try_decode_frame(&framed, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::EmptyFrame)
        ));
    }

    #[test]
    fn decode_command_rejects_an_empty_payload_instead_of_panicking() {
        assert!(matches!(
            decode_command(&[]),
            Err(CodecError::MissingCommandByte)
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let body = vec![0u8; 100];
        let framed = frame(&body);
        assert!(matches!(
            try_decode_frame(&framed, 10),
            Err(CodecError::OversizedFrame { len: 100, max: 10 })
        ));
    }

    #[test]
    fn incomplete_frame_yields_none() {
        let framed = frame(b"Chello");
        assert!(try_decode_frame(&framed[..4], DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
        assert!(try_decode_frame(&framed[..framed.len() - 1], DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn decodes_connect() {
        let mut body = b"Cmail.example.com\0".to_vec();
        body.push(b'4');
        body.extend_from_slice(&25u16.to_be_bytes());
        body.extend_from_slice(b"1.2.3.4");
        let cmd = decode_command(&body).unwrap();
        assert_eq!(
            cmd,
            Command::Connect {
                hostname: "mail.example.com".to_string(),
                family: b'4',
                port: 25,
                address: "1.2.3.4".to_string(),
            }
        );
    }

    #[test]
    fn decodes_mail_from_with_esmtp_args() {
        let body = b"M<a@b>\0SIZE=100\0".to_vec();
        let cmd = decode_command(&body).unwrap();
        assert_eq!(
            cmd,
            Command::MailFrom {
                address: "<a@b>".to_string(),
                esmtp_args: vec!["SIZE=100".to_string()],
            }
        );
    }

    #[test]
    fn decodes_header() {
        let body = b"LSubject\0Hi\0".to_vec();
        assert_eq!(
            decode_command(&body).unwrap(),
            Command::Header {
                name: "Subject".to_string(),
                value: "Hi".to_string(),
            }
        );
    }

    #[test]
    fn decodes_macro_sequence_with_trailing_nul() {
        let body = b"DCfoo\0bar\0".to_vec();
        assert_eq!(
            decode_command(&body).unwrap(),
            Command::Macro {
                macro_cmd: b'C',
                items: vec!["foo".to_string(), "bar".to_string()],
            }
        );
    }

    #[test]
    fn reserved_command_code_is_preserved() {
        let body = b"Zsomepayload".to_vec();
        assert_eq!(
            decode_command(&body).unwrap(),
            Command::Reserved {
                code: b'Z',
                raw: b"somepayload".to_vec(),
            }
        );
    }

    #[test]
    fn decodes_the_unknown_wire_command() {
        let body = b"Uunrecognized SMTP command".to_vec();
        assert_eq!(
            decode_command(&body).unwrap(),
            Command::Unknown {
                raw: b"unrecognized SMTP command".to_vec(),
            }
        );
    }

    #[test]
    fn empty_payload_commands_ignore_trailing_bytes() {
        assert_eq!(decode_command(b"Tgarbage").unwrap(), Command::Data);
        assert_eq!(decode_command(b"N").unwrap(), Command::EndHeaders);
        assert_eq!(decode_command(b"Agarbage").unwrap(), Command::Abort);
        assert_eq!(decode_command(b"Q").unwrap(), Command::Quit);
    }

    #[test]
    fn encodes_add_rcpt_with_trailing_nul() {
        let body = encode_response(&Response::AddRcpt("a@b".to_string()));
        assert_eq!(body, b"+a@b\0");
    }

    #[test]
    fn encodes_reply_code() {
        let body = encode_response(&Response::ReplyCode(550, "no thanks".to_string()));
        assert_eq!(body, b"y550 no thanks\0");
    }

    #[test]
    fn encodes_chg_header_with_index() {
        let body = encode_response(&Response::ChgHeader(2, "X-Foo".to_string(), "bar".to_string()));
        let mut expected = vec![RESP_CHG_HEADER];
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"X-Foo\0bar\0");
        assert_eq!(body, expected);
    }

    #[test]
    fn encodes_optneg_ack() {
        let body = encode_response(&Response::OptNegAck {
            version: 2,
            actions_mask: 0x01,
            protocol_mask: 0x7b,
        });
        assert_eq!(
            body,
            b"O\x00\x00\x00\x02\x00\x00\x00\x01\x00\x00\x00\x7b"
        );
    }

    #[test]
    fn frame_integrity_across_multiple_records() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(&Response::Continue));
        stream.extend_from_slice(&encode_frame(&Response::Accept));
        stream.extend_from_slice(&encode_frame(&Response::ReplyCode(421, "bye".to_string())));

        let mut cursor = &stream[..];
        let mut seen = Vec::new();
        loop {
            match try_decode_frame(cursor, DEFAULT_MAX_FRAME_SIZE).unwrap() {
                Some((consumed, payload)) => {
                    seen.push(payload);
                    cursor = &cursor[consumed..];
                }
                None => break,
            }
        }
        assert_eq!(seen, vec![vec![RESP_CONTINUE], vec![RESP_ACCEPT], {
            let mut v = vec![RESP_REPLY_CODE];
            v.extend_from_slice(b"421 bye\0");
            v
        }]);
    }
}
