//! Binary wire protocol for the chat broker.
//!
//! Every frame is a type byte followed by zero or more length-prefixed
//! fields (one length byte `L` then exactly `L` payload bytes) and,
//! sometimes, a trailing single-byte scalar. The transport is a single
//! WebSocket binary message per frame, so there is no length-of-frame
//! prefix and no reassembly across messages: unlike a decoder framing a
//! raw byte stream, this codec decodes exactly one frame from exactly
//! one already-delimited message.

use anyhow::{bail, Result};

/// Wire frame type bytes (see the frame type table in the protocol spec).
pub mod frame_type {
    pub const LIST_USERS: u8 = 1;
    pub const GET_USER_INFO: u8 = 2;
    pub const CHANGE_STATE: u8 = 3;
    pub const SEND_CHAT: u8 = 4;
    pub const GET_HISTORY: u8 = 5;

    pub const ERROR: u8 = 50;
    pub const USERS_LIST: u8 = 51;
    pub const USER_INFO: u8 = 52;
    pub const NEW_USER: u8 = 53;
    pub const STATE_CHANGE: u8 = 54;
    pub const CHAT_MESSAGE: u8 = 55;
    pub const HISTORY_RESPONSE: u8 = 56;
}

/// Error taxonomy codes carried in an [`ServerFrame::Error`] frame.
pub mod error_code {
    pub const UNKNOWN_USER: u8 = 1;
    pub const INVALID_STATE: u8 = 2;
    pub const EMPTY_MESSAGE: u8 = 3;
    pub const RECIPIENT_OFFLINE: u8 = 4;
}

/// The broadcast pseudo-recipient. Reserved: never a valid claimed name.
pub const BROADCAST: &str = "~";

/// Presence state of a registered session.
///
/// Only the broker may set [`Presence::Disconnected`]; clients request
/// transitions among the other three via [`ClientFrame::ChangeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Disconnected = 0,
    Active = 1,
    Busy = 2,
    Inactive = 3,
}

impl Presence {
    /// Decode a presence byte, rejecting anything outside `{0..3}`.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Active),
            2 => Some(Self::Busy),
            3 => Some(Self::Inactive),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded client-to-server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    ListUsers,
    GetUserInfo { name: String },
    ChangeState { name: String, state: u8 },
    SendChat { recipient: String, body: Vec<u8> },
    GetHistory { chat_name: String },
}

/// A decoded (or to-be-encoded) server-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Error { code: u8 },
    UsersList { users: Vec<(String, u8)> },
    UserInfo { found: Option<(String, u8)> },
    NewUser { name: String },
    StateChange { name: String, state: u8 },
    ChatMessage { sender_or_tilde: String, body: Vec<u8> },
    HistoryResponse { entries: Vec<(String, Vec<u8>)> },
}

/// Read one length-prefixed field starting at `*pos`, advancing `*pos`.
fn read_field<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    if *pos >= buf.len() {
        bail!("malformed frame: missing length byte at offset {pos}");
    }
    let len = buf[*pos] as usize;
    let start = *pos + 1;
    let end = start + len;
    if end > buf.len() {
        bail!("malformed frame: field length {len} runs past end of frame");
    }
    *pos = end;
    Ok(&buf[start..end])
}

fn read_byte(buf: &[u8], pos: &mut usize) -> Result<u8> {
    if *pos >= buf.len() {
        bail!("malformed frame: missing trailing scalar at offset {pos}");
    }
    let b = buf[*pos];
    *pos += 1;
    Ok(b)
}

fn utf8_field(bytes: &[u8]) -> Result<String> {
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

/// Append one length-prefixed field. `bytes.len()` must be `<= 255`;
/// violating that is a programming error in the caller, not a runtime
/// condition the encoder can recover from.
fn push_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    assert!(bytes.len() <= 255, "field of {} bytes exceeds wire limit", bytes.len());
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

impl ClientFrame {
    /// Decode one client frame from an already-delimited message.
    ///
    /// Fails with an error if the frame type is unrecognized or any
    /// declared field length runs past the end of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            bail!("malformed frame: empty message");
        }
        let ft = bytes[0];
        let mut pos = 1;
        match ft {
            frame_type::LIST_USERS => Ok(Self::ListUsers),
            frame_type::GET_USER_INFO => {
                let name = utf8_field(read_field(bytes, &mut pos)?)?;
                Ok(Self::GetUserInfo { name })
            }
            frame_type::CHANGE_STATE => {
                let name = utf8_field(read_field(bytes, &mut pos)?)?;
                let state = read_byte(bytes, &mut pos)?;
                Ok(Self::ChangeState { name, state })
            }
            frame_type::SEND_CHAT => {
                let recipient = utf8_field(read_field(bytes, &mut pos)?)?;
                let body = read_field(bytes, &mut pos)?.to_vec();
                Ok(Self::SendChat { recipient, body })
            }
            frame_type::GET_HISTORY => {
                let chat_name = utf8_field(read_field(bytes, &mut pos)?)?;
                Ok(Self::GetHistory { chat_name })
            }
            other => bail!("unknown client frame type: {other}"),
        }
    }
}

impl ServerFrame {
    /// Encode this frame for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Error { code } => {
                buf.push(frame_type::ERROR);
                buf.push(*code);
            }
            Self::UsersList { users } => {
                buf.push(frame_type::USERS_LIST);
                assert!(users.len() <= 255, "UsersList count exceeds wire limit");
                buf.push(users.len() as u8);
                for (name, state) in users {
                    push_field(&mut buf, name.as_bytes());
                    buf.push(*state);
                }
            }
            Self::UserInfo { found } => {
                buf.push(frame_type::USER_INFO);
                match found {
                    Some((name, state)) => {
                        buf.push(1);
                        push_field(&mut buf, name.as_bytes());
                        buf.push(*state);
                    }
                    None => buf.push(0),
                }
            }
            Self::NewUser { name } => {
                buf.push(frame_type::NEW_USER);
                push_field(&mut buf, name.as_bytes());
                buf.push(Presence::Active.to_byte());
            }
            Self::StateChange { name, state } => {
                buf.push(frame_type::STATE_CHANGE);
                push_field(&mut buf, name.as_bytes());
                buf.push(*state);
            }
            Self::ChatMessage { sender_or_tilde, body } => {
                buf.push(frame_type::CHAT_MESSAGE);
                push_field(&mut buf, sender_or_tilde.as_bytes());
                push_field(&mut buf, body);
            }
            Self::HistoryResponse { entries } => {
                buf.push(frame_type::HISTORY_RESPONSE);
                assert!(entries.len() <= 255, "HistoryResponse count exceeds wire limit");
                buf.push(entries.len() as u8);
                for (sender, body) in entries {
                    push_field(&mut buf, sender.as_bytes());
                    push_field(&mut buf, body);
                }
            }
        }
        buf
    }

    /// Decode one server frame from an already-delimited message.
    ///
    /// Primarily useful for tests asserting on exact wire scenarios.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            bail!("malformed frame: empty message");
        }
        let ft = bytes[0];
        let mut pos = 1;
        match ft {
            frame_type::ERROR => {
                let code = read_byte(bytes, &mut pos)?;
                Ok(Self::Error { code })
            }
            frame_type::USERS_LIST => {
                let count = read_byte(bytes, &mut pos)? as usize;
                let mut users = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = utf8_field(read_field(bytes, &mut pos)?)?;
                    let state = read_byte(bytes, &mut pos)?;
                    users.push((name, state));
                }
                Ok(Self::UsersList { users })
            }
            frame_type::USER_INFO => {
                let success = read_byte(bytes, &mut pos)?;
                if success == 0 {
                    Ok(Self::UserInfo { found: None })
                } else {
                    let name = utf8_field(read_field(bytes, &mut pos)?)?;
                    let state = read_byte(bytes, &mut pos)?;
                    Ok(Self::UserInfo { found: Some((name, state)) })
                }
            }
            frame_type::NEW_USER => {
                let name = utf8_field(read_field(bytes, &mut pos)?)?;
                let _state = read_byte(bytes, &mut pos)?;
                Ok(Self::NewUser { name })
            }
            frame_type::STATE_CHANGE => {
                let name = utf8_field(read_field(bytes, &mut pos)?)?;
                let state = read_byte(bytes, &mut pos)?;
                Ok(Self::StateChange { name, state })
            }
            frame_type::CHAT_MESSAGE => {
                let sender_or_tilde = utf8_field(read_field(bytes, &mut pos)?)?;
                let body = read_field(bytes, &mut pos)?.to_vec();
                Ok(Self::ChatMessage { sender_or_tilde, body })
            }
            frame_type::HISTORY_RESPONSE => {
                let count = read_byte(bytes, &mut pos)? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let sender = utf8_field(read_field(bytes, &mut pos)?)?;
                    let body = read_field(bytes, &mut pos)?.to_vec();
                    entries.push((sender, body));
                }
                Ok(Self::HistoryResponse { entries })
            }
            other => bail!("unknown server frame type: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_users_round_trip() {
        let bytes = [frame_type::LIST_USERS];
        assert_eq!(ClientFrame::decode(&bytes).unwrap(), ClientFrame::ListUsers);
    }

    #[test]
    fn get_user_info_round_trip() {
        let frame = ClientFrame::GetUserInfo { name: "alice".into() };
        let mut bytes = vec![frame_type::GET_USER_INFO];
        push_field(&mut bytes, b"alice");
        assert_eq!(ClientFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn change_state_round_trip() {
        let mut bytes = vec![frame_type::CHANGE_STATE];
        push_field(&mut bytes, b"bob");
        bytes.push(2);
        assert_eq!(
            ClientFrame::decode(&bytes).unwrap(),
            ClientFrame::ChangeState { name: "bob".into(), state: 2 }
        );
    }

    #[test]
    fn send_chat_round_trip() {
        let mut bytes = vec![frame_type::SEND_CHAT];
        push_field(&mut bytes, b"alice");
        push_field(&mut bytes, b"hi");
        assert_eq!(
            ClientFrame::decode(&bytes).unwrap(),
            ClientFrame::SendChat { recipient: "alice".into(), body: b"hi".to_vec() }
        );
    }

    #[test]
    fn get_history_round_trip() {
        let mut bytes = vec![frame_type::GET_HISTORY];
        push_field(&mut bytes, b"~");
        assert_eq!(
            ClientFrame::decode(&bytes).unwrap(),
            ClientFrame::GetHistory { chat_name: "~".into() }
        );
    }

    #[test]
    fn error_frame_round_trip() {
        let frame = ServerFrame::Error { code: error_code::RECIPIENT_OFFLINE };
        let encoded = frame.encode();
        assert_eq!(encoded, vec![50, 4]);
        assert_eq!(ServerFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn users_list_round_trip() {
        let frame = ServerFrame::UsersList {
            users: vec![("alice".into(), 1), ("bob".into(), 2)],
        };
        let encoded = frame.encode();
        assert_eq!(ServerFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn user_info_found_round_trip() {
        let frame = ServerFrame::UserInfo { found: Some(("alice".into(), 1)) };
        let encoded = frame.encode();
        assert_eq!(encoded[0], frame_type::USER_INFO);
        assert_eq!(encoded[1], 1, "success byte must precede the payload");
        assert_eq!(ServerFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn user_info_not_found_round_trip() {
        let frame = ServerFrame::UserInfo { found: None };
        let encoded = frame.encode();
        assert_eq!(encoded, vec![frame_type::USER_INFO, 0]);
        assert_eq!(ServerFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn new_user_always_active() {
        let frame = ServerFrame::NewUser { name: "carol".into() };
        let encoded = frame.encode();
        assert_eq!(*encoded.last().unwrap(), Presence::Active.to_byte());
        assert_eq!(ServerFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn chat_message_exact_bytes_two_party_unicast() {
        let frame = ServerFrame::ChatMessage { sender_or_tilde: "bob".into(), body: b"hi".to_vec() };
        let encoded = frame.encode();
        assert_eq!(encoded, vec![55, 3, b'b', b'o', b'b', 2, b'h', b'i']);
    }

    #[test]
    fn history_response_round_trip() {
        let frame = ServerFrame::HistoryResponse {
            entries: vec![("bob".into(), b"hi".to_vec()), ("alice".into(), b"yo".to_vec())],
        };
        let encoded = frame.encode();
        assert_eq!(ServerFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn history_response_count_caps_at_255() {
        let entries: Vec<_> = (0..255u32).map(|i| (format!("u{i}"), vec![0u8])).collect();
        let frame = ServerFrame::HistoryResponse { entries };
        let encoded = frame.encode();
        assert_eq!(encoded[1], 255);
    }

    #[test]
    fn decoder_rejects_unknown_client_type() {
        assert!(ClientFrame::decode(&[0xFF]).is_err());
    }

    #[test]
    fn decoder_rejects_truncated_field() {
        // GetUserInfo declares a 5-byte name but only 2 bytes follow.
        let bytes = [frame_type::GET_USER_INFO, 5, b'a', b'l'];
        assert!(ClientFrame::decode(&bytes).is_err());
    }

    #[test]
    fn decoder_rejects_empty_message() {
        assert!(ClientFrame::decode(&[]).is_err());
    }

    #[test]
    fn decoder_rejects_missing_trailing_scalar() {
        let mut bytes = vec![frame_type::CHANGE_STATE];
        push_field(&mut bytes, b"bob");
        // no trailing state byte
        assert!(ClientFrame::decode(&bytes).is_err());
    }

    #[test]
    fn empty_body_is_representable_but_router_level_concern() {
        // The codec itself has no opinion on body length 1..255; SendChat
        // with a zero-length body is a Router-level EmptyMessage error.
        let mut bytes = vec![frame_type::SEND_CHAT];
        push_field(&mut bytes, b"bob");
        push_field(&mut bytes, b"");
        assert_eq!(
            ClientFrame::decode(&bytes).unwrap(),
            ClientFrame::SendChat { recipient: "bob".into(), body: vec![] }
        );
    }
}
