use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use chrono::Utc;
use server_api::ApiContext;
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Process-lifetime registry of live sessions and their room subscriptions.
/// Owns no durable state; rooms are populated on subscribe and pruned on
/// disconnect. The mutex is held only for map operations, never across an
/// await.
#[derive(Clone)]
pub struct RoomRelay {
    api: ApiContext,
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_session: AtomicU64,
    sessions: Mutex<HashMap<SessionId, UnboundedSender<ServerEvent>>>,
    rooms: Mutex<HashMap<ChatId, HashMap<SessionId, UnboundedSender<ServerEvent>>>>,
}

impl RoomRelay {
    pub fn new(api: ApiContext) -> Self {
        Self {
            api,
            inner: Arc::new(Inner::default()),
        }
    }

    /// Registers a connected session and hands back the stream of events
    /// destined for it.
    pub fn connect(&self) -> (SessionId, UnboundedReceiver<ServerEvent>) {
        let session = SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .sessions
            .lock()
            .expect("relay sessions lock")
            .insert(session, tx);
        (session, rx)
    }

    /// Adds the session to the room's live set. Idempotent; unknown sessions
    /// are ignored. Authorization happens upstream: callers check the access
    /// gate before subscribing.
    pub fn subscribe(&self, session: SessionId, chat_id: ChatId) {
        let sender = {
            let sessions = self.inner.sessions.lock().expect("relay sessions lock");
            sessions.get(&session).cloned()
        };
        let Some(sender) = sender else {
            debug!(?session, %chat_id, "subscribe from unknown session dropped");
            return;
        };
        self.inner
            .rooms
            .lock()
            .expect("relay rooms lock")
            .entry(chat_id)
            .or_default()
            .insert(session, sender);
    }

    /// Fans the message out to every session currently subscribed to the room
    /// (sender included), then persists it on a detached task. The id and
    /// timestamp are minted here, before fan-out, so the stored row carries
    /// the stamp subscribers saw even if persistence tasks run out of order.
    /// Persistence failures are logged and never retract delivery already
    /// performed. Events with an empty text are dropped, not errored.
    pub fn publish(&self, chat_id: ChatId, sender_id: &UserId, text: &str, iv: Option<&str>) {
        if text.is_empty() {
            debug!(%chat_id, "dropping live event with empty text");
            return;
        }

        let message_id = MessageId::generate();
        let sent_at = Utc::now();
        let event = ServerEvent::MessageDelivered {
            message_id,
            chat_id,
            sender_id: sender_id.clone(),
            text: text.to_string(),
            iv: iv.map(str::to_string),
            sent_at,
        };

        {
            let rooms = self.inner.rooms.lock().expect("relay rooms lock");
            if let Some(room) = rooms.get(&chat_id) {
                for subscriber in room.values() {
                    // A closed receiver means the session is tearing down;
                    // disconnect will prune it.
                    let _ = subscriber.send(event.clone());
                }
            }
        }

        let api = self.api.clone();
        let sender_id = sender_id.clone();
        let text = text.to_string();
        let iv = iv.map(str::to_string);
        tokio::spawn(async move {
            if let Err(error) = server_api::record_message(
                &api,
                chat_id,
                &sender_id,
                message_id,
                &text,
                iv.as_deref(),
                sent_at,
            )
            .await
            {
                warn!(%chat_id, %sender_id, code = ?error.code, message = %error.message,
                    "failed to persist relayed message");
            }
        });
    }

    /// Delivers an event to a single session, outside any room.
    pub fn send_to(&self, session: SessionId, event: ServerEvent) {
        let sessions = self.inner.sessions.lock().expect("relay sessions lock");
        if let Some(sender) = sessions.get(&session) {
            let _ = sender.send(event);
        }
    }

    /// Removes the session from every room it belonged to and forgets its
    /// handle. Called exactly once per session, on disconnect.
    pub fn disconnect(&self, session: SessionId) {
        self.inner
            .sessions
            .lock()
            .expect("relay sessions lock")
            .remove(&session);
        let mut rooms = self.inner.rooms.lock().expect("relay rooms lock");
        rooms.retain(|_, room| {
            room.remove(&session);
            !room.is_empty()
        });
    }

    #[cfg(test)]
    fn room_size(&self, chat_id: ChatId) -> usize {
        self.inner
            .rooms
            .lock()
            .expect("relay rooms lock")
            .get(&chat_id)
            .map(|room| room.len())
            .unwrap_or(0)
    }
}
