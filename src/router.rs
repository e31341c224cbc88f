//! Router: central dispatch for inbound frames.
//!
//! Takes a (sender name, decoded frame) pair and drives the registry and
//! history store to produce zero or more outbound frames, written
//! directly through each target session's outbox. Grounded on
//! `broker::mod::Broker`'s per-connection dispatch match, generalized
//! from a single Hub-wide fan-out list to the registry's
//! active/open-transport target queries.

use log::warn;
use tokio::sync::mpsc::UnboundedSender;

use crate::codec::{error_code, frame_type, ClientFrame, Presence, ServerFrame, BROADCAST};
use crate::history::History;
use crate::registry::Registry;

/// Send one encoded frame to a single outbox. Cross-session write
/// failures are logged and dropped per the error handling design; they
/// never propagate back to the caller of `route`.
fn send_to(outbox: &UnboundedSender<Vec<u8>>, frame: &ServerFrame) {
    if outbox.send(frame.encode()).is_err() {
        warn!("dropped frame (target outbox closed): type {}", frame_type_of(frame));
    }
}

fn frame_type_of(frame: &ServerFrame) -> u8 {
    match frame {
        ServerFrame::Error { .. } => frame_type::ERROR,
        ServerFrame::UsersList { .. } => frame_type::USERS_LIST,
        ServerFrame::UserInfo { .. } => frame_type::USER_INFO,
        ServerFrame::NewUser { .. } => frame_type::NEW_USER,
        ServerFrame::StateChange { .. } => frame_type::STATE_CHANGE,
        ServerFrame::ChatMessage { .. } => frame_type::CHAT_MESSAGE,
        ServerFrame::HistoryResponse { .. } => frame_type::HISTORY_RESPONSE,
    }
}

/// Dispatch one inbound frame from `sender_name`, whose own outbox is
/// `sender_outbox`. All resulting writes (to the sender and to any other
/// target) are performed here; `route` returns nothing because delivery
/// is best-effort and failures are not reported to the caller.
pub fn route(
    registry: &Registry,
    history: &History,
    sender_name: &str,
    sender_outbox: &UnboundedSender<Vec<u8>>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::ListUsers => handle_list_users(registry, sender_name, sender_outbox),
        ClientFrame::GetUserInfo { name } => handle_get_user_info(registry, sender_outbox, &name),
        ClientFrame::ChangeState { state, .. } => {
            handle_change_state(registry, sender_name, sender_outbox, state)
        }
        ClientFrame::SendChat { recipient, body } => {
            handle_send_chat(registry, history, sender_name, sender_outbox, &recipient, &body)
        }
        ClientFrame::GetHistory { chat_name } => {
            handle_get_history(registry, history, sender_name, sender_outbox, &chat_name)
        }
    }
}

fn handle_list_users(registry: &Registry, sender_name: &str, sender_outbox: &UnboundedSender<Vec<u8>>) {
    if registry.state_of(sender_name) != Some(Presence::Active) {
        return;
    }
    let users = registry.snapshot().into_iter().map(|(name, state)| (name, state.to_byte())).collect();
    send_to(sender_outbox, &ServerFrame::UsersList { users });
}

fn handle_get_user_info(registry: &Registry, sender_outbox: &UnboundedSender<Vec<u8>>, name: &str) {
    let found = registry.state_of(name).map(|state| (name.to_owned(), state.to_byte()));
    match found {
        Some(found) => send_to(sender_outbox, &ServerFrame::UserInfo { found: Some(found) }),
        None => send_to(sender_outbox, &ServerFrame::Error { code: error_code::UNKNOWN_USER }),
    }
}

/// The requested name in a `ChangeState` frame is decoded for wire
/// compatibility but ignored for addressing: the broker has no
/// cross-user authorization model, so the new state is always applied to
/// the frame's own sender.
fn handle_change_state(
    registry: &Registry,
    sender_name: &str,
    sender_outbox: &UnboundedSender<Vec<u8>>,
    state: u8,
) {
    let new_state = match Presence::from_byte(state) {
        Some(s) if s != Presence::Disconnected => s,
        _ => {
            send_to(sender_outbox, &ServerFrame::Error { code: error_code::INVALID_STATE });
            return;
        }
    };
    registry.set_state(sender_name, new_state);
    let frame = ServerFrame::StateChange { name: sender_name.to_owned(), state: new_state.to_byte() };
    for outbox in registry.open_outboxes(None) {
        send_to(&outbox, &frame);
    }
}

fn handle_send_chat(
    registry: &Registry,
    history: &History,
    sender_name: &str,
    sender_outbox: &UnboundedSender<Vec<u8>>,
    recipient: &str,
    body: &[u8],
) {
    if body.is_empty() {
        send_to(sender_outbox, &ServerFrame::Error { code: error_code::EMPTY_MESSAGE });
        return;
    }

    let chat_id = History::chat_id_for(sender_name, recipient);
    history.append(&chat_id, sender_name, body);

    if recipient == BROADCAST {
        let mut rewritten = format!("{sender_name}: ").into_bytes();
        rewritten.extend_from_slice(body);
        let frame = ServerFrame::ChatMessage { sender_or_tilde: BROADCAST.to_owned(), body: rewritten };
        send_to(sender_outbox, &frame);
        for outbox in registry.active_outboxes(Some(sender_name)) {
            send_to(&outbox, &frame);
        }
        return;
    }

    let frame = ServerFrame::ChatMessage { sender_or_tilde: sender_name.to_owned(), body: body.to_vec() };
    send_to(sender_outbox, &frame);

    match registry.state_of(recipient) {
        None => send_to(sender_outbox, &ServerFrame::Error { code: error_code::UNKNOWN_USER }),
        Some(Presence::Disconnected) => {
            send_to(sender_outbox, &ServerFrame::Error { code: error_code::RECIPIENT_OFFLINE })
        }
        Some(Presence::Active) => {
            if let Some(outbox) = registry.outbox_for(recipient) {
                send_to(&outbox, &frame);
            }
        }
        Some(Presence::Busy) | Some(Presence::Inactive) => {
            // Held in history, not delivered live. Only Active is a live
            // delivery target; Busy and Inactive are held back identically.
        }
    }
}

fn handle_get_history(
    registry: &Registry,
    history: &History,
    sender_name: &str,
    sender_outbox: &UnboundedSender<Vec<u8>>,
    chat_name: &str,
) {
    if registry.state_of(sender_name) != Some(Presence::Active) {
        return;
    }
    let chat_id = History::chat_id_for(sender_name, chat_name);
    let entries = history.read_capped(&chat_id);
    send_to(sender_outbox, &ServerFrame::HistoryResponse { entries });
}
