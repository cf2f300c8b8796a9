//! Per-user WebSocket rooms.
//!
//! Each user with at least one subscribed connection gets a room actor: a
//! task that owns that user's connection senders and processes commands
//! from a bounded mailbox. The registry maps users to room mailboxes in
//! [`SHARD_COUNT`] independently locked shards so pushes for different
//! users rarely contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::Message;
use pitchey_core::types::DbId;
use pitchey_db::models::notification::NotificationRecord;
use pitchey_events::RealtimeFanout;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Number of independently locked registry shards.
pub const SHARD_COUNT: usize = 16;

/// Commands a room can hold before pushes are dropped.
pub const MAILBOX_CAPACITY: usize = 64;

enum RoomCommand {
    Register {
        conn_id: String,
        sender: WsSender,
    },
    Unregister {
        conn_id: String,
        reply: oneshot::Sender<usize>,
    },
    Push {
        message: Message,
        reply: oneshot::Sender<usize>,
    },
    Ping,
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A running room as seen by the registry.
struct RoomHandle {
    mailbox: mpsc::Sender<RoomCommand>,
    /// Connections registered with the room. Raised by the registry before
    /// the room sees the connection, lowered by the room.
    members: Arc<AtomicUsize>,
}

type Shard = Mutex<HashMap<DbId, RoomHandle>>;

/// Registry of per-user room actors.
pub struct RoomRegistry {
    shards: Vec<Shard>,
    connections: Arc<AtomicUsize>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn shard(&self, user_id: DbId) -> &Shard {
        let index = user_id.rem_euclid(SHARD_COUNT as i64) as usize;
        &self.shards[index]
    }

    /// Add a connection to the user's room, starting the room if needed.
    pub async fn register(&self, user_id: DbId, conn_id: String, sender: WsSender) {
        let mailbox = {
            let mut rooms = self.shard(user_id).lock().await;
            let room = rooms
                .entry(user_id)
                .or_insert_with(|| spawn_room(user_id, Arc::clone(&self.connections)));
            room.members.fetch_add(1, Ordering::SeqCst);
            room.mailbox.clone()
        };

        let command = RoomCommand::Register { conn_id, sender };
        if let Err(mpsc::error::SendError(command)) = mailbox.send(command).await {
            // The room was closed under us; start a fresh one.
            let mut rooms = self.shard(user_id).lock().await;
            let room = rooms
                .entry(user_id)
                .or_insert_with(|| spawn_room(user_id, Arc::clone(&self.connections)));
            if room.mailbox.is_closed() {
                *room = spawn_room(user_id, Arc::clone(&self.connections));
            }
            room.members.fetch_add(1, Ordering::SeqCst);
            let _ = room.mailbox.send(command).await;
        }
        tracing::debug!(user_id, "WebSocket connection joined room");
    }

    /// Remove a connection. The room stops once its last connection leaves.
    pub async fn unregister(&self, user_id: DbId, conn_id: &str) {
        let Some(mailbox) = self
            .shard(user_id)
            .lock()
            .await
            .get(&user_id)
            .map(|room| room.mailbox.clone())
        else {
            return;
        };

        let (reply, done) = oneshot::channel();
        let command = RoomCommand::Unregister {
            conn_id: conn_id.to_string(),
            reply,
        };
        if mailbox.send(command).await.is_ok() {
            let _ = done.await;
        }

        // A register that raced us has already raised the member count.
        let mut rooms = self.shard(user_id).lock().await;
        let empty = rooms.get(&user_id).is_some_and(|room| {
            room.mailbox.same_channel(&mailbox)
                && (room.members.load(Ordering::SeqCst) == 0 || room.mailbox.is_closed())
        });
        if empty {
            // Dropping the last mailbox sender ends the actor.
            rooms.remove(&user_id);
        }
    }

    /// Push `message` to every connection of `user_id`. Best-effort: returns
    /// 0 when the user has no room or the room's mailbox is full.
    pub async fn push(&self, user_id: DbId, message: Message) -> usize {
        let Some(mailbox) = self
            .shard(user_id)
            .lock()
            .await
            .get(&user_id)
            .map(|room| room.mailbox.clone())
        else {
            return 0;
        };

        let (reply, reached) = oneshot::channel();
        match mailbox.try_send(RoomCommand::Push { message, reply }) {
            Ok(()) => reached.await.unwrap_or(0),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(user_id, "Room mailbox full, realtime push dropped");
                0
            }
            Err(mpsc::error::TrySendError::Closed(_)) => 0,
        }
    }

    /// Send a Ping frame to every connection.
    pub async fn ping_all(&self) {
        for mailbox in self.mailboxes().await {
            let _ = mailbox.try_send(RoomCommand::Ping);
        }
    }

    /// Send a Close frame to every connection and stop all rooms.
    pub async fn close_all(&self) {
        let mut mailboxes = Vec::new();
        for shard in &self.shards {
            mailboxes.extend(shard.lock().await.drain().map(|(_, room)| room.mailbox));
        }

        let count = mailboxes.len();
        for mailbox in mailboxes {
            let (reply, done) = oneshot::channel();
            if mailbox.send(RoomCommand::Close { reply }).await.is_ok() {
                let _ = done.await;
            }
        }
        tracing::info!(rooms = count, "Closed all WebSocket rooms");
    }

    /// Number of live subscribed connections across all rooms.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Number of users with a running room.
    pub async fn room_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.lock().await.len();
        }
        count
    }

    async fn mailboxes(&self) -> Vec<mpsc::Sender<RoomCommand>> {
        let mut mailboxes = Vec::new();
        for shard in &self.shards {
            mailboxes.extend(shard.lock().await.values().map(|room| room.mailbox.clone()));
        }
        mailboxes
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeFanout for RoomRegistry {
    async fn push(&self, user_id: DbId, record: &NotificationRecord) -> usize {
        let frame = json!({"type": "notification", "data": record}).to_string();
        RoomRegistry::push(self, user_id, Message::Text(frame.into())).await
    }
}

fn spawn_room(user_id: DbId, connections: Arc<AtomicUsize>) -> RoomHandle {
    let (mailbox, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let members = Arc::new(AtomicUsize::new(0));
    tokio::spawn(run_room(user_id, rx, Arc::clone(&members), connections));
    RoomHandle { mailbox, members }
}

/// The room actor. Runs until every mailbox sender is dropped or it is
/// told to close.
async fn run_room(
    user_id: DbId,
    mut mailbox: mpsc::Receiver<RoomCommand>,
    registered: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
) {
    let mut members: HashMap<String, WsSender> = HashMap::new();

    let leave = |count: usize| {
        registered.fetch_sub(count, Ordering::SeqCst);
        connections.fetch_sub(count, Ordering::Relaxed);
    };

    // Send to every member, dropping those whose socket task has gone.
    let broadcast = |members: &mut HashMap<String, WsSender>, message: &Message| {
        let before = members.len();
        members.retain(|_, sender| sender.send(message.clone()).is_ok());
        leave(before - members.len());
        members.len()
    };

    while let Some(command) = mailbox.recv().await {
        match command {
            RoomCommand::Register { conn_id, sender } => {
                if members.insert(conn_id, sender).is_none() {
                    connections.fetch_add(1, Ordering::Relaxed);
                } else {
                    // Same connection id twice; the registry counted it twice.
                    registered.fetch_sub(1, Ordering::SeqCst);
                }
            }
            RoomCommand::Unregister { conn_id, reply } => {
                if members.remove(&conn_id).is_some() {
                    leave(1);
                }
                let _ = reply.send(members.len());
            }
            RoomCommand::Push { message, reply } => {
                let reached = broadcast(&mut members, &message);
                let _ = reply.send(reached);
            }
            RoomCommand::Ping => {
                broadcast(&mut members, &Message::Ping(Bytes::new()));
            }
            RoomCommand::Close { reply } => {
                for sender in members.values() {
                    let _ = sender.send(Message::Close(None));
                }
                leave(members.len());
                members.clear();
                let _ = reply.send(());
                break;
            }
        }
    }

    leave(members.len());
    tracing::trace!(user_id, "Room stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (WsSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn push_reaches_every_connection_of_the_user() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = connection();
        let (b, mut rx_b) = connection();
        registry.register(42, "a".into(), a).await;
        registry.register(42, "b".into(), b).await;

        let reached = registry.push(42, Message::Text("hi".into())).await;

        assert_eq!(reached, 2);
        assert_eq!(registry.connection_count(), 2);
        assert!(matches!(rx_a.recv().await, Some(Message::Text(_))));
        assert!(matches!(rx_b.recv().await, Some(Message::Text(_))));
    }

    #[tokio::test]
    async fn push_to_absent_user_reaches_nobody() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.push(7, Message::Text("hi".into())).await, 0);
    }

    #[tokio::test]
    async fn last_unregister_stops_the_room() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();
        registry.register(5, "a".into(), a).await;
        registry.register(5, "b".into(), b).await;

        registry.unregister(5, "a").await;
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.room_count().await, 1);

        registry.unregister(5, "b").await;
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(registry.push(5, Message::Text("late".into())).await, 0);
    }

    #[tokio::test]
    async fn dropped_connection_is_pruned_on_push() {
        let registry = RoomRegistry::new();
        let (a, rx_a) = connection();
        let (b, _rx_b) = connection();
        registry.register(9, "a".into(), a).await;
        registry.register(9, "b".into(), b).await;
        drop(rx_a);

        assert_eq!(registry.push(9, Message::Text("x".into())).await, 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn close_all_sends_close_frames() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = connection();
        let (b, mut rx_b) = connection();
        registry.register(1, "a".into(), a).await;
        registry.register(17, "b".into(), b).await;

        registry.close_all().await;

        assert!(matches!(rx_a.recv().await, Some(Message::Close(None))));
        assert!(matches!(rx_b.recv().await, Some(Message::Close(None))));
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_does_not_hold_the_shard_while_the_room_is_busy() {
        let registry = Arc::new(RoomRegistry::new());

        // A room whose mailbox nobody reads until the test answers it.
        let (mailbox, mut inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = RoomHandle {
            mailbox,
            members: Arc::new(AtomicUsize::new(0)),
        };
        registry.shard(1).lock().await.insert(1, handle);

        let leaving = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.unregister(1, "a").await }
        });
        let Some(RoomCommand::Unregister { reply, .. }) = inbox.recv().await else {
            panic!("room should receive the unregister command");
        };

        // User 17 lives in the same shard as user 1.
        let (b, _rx_b) = connection();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            registry.register(17, "b".into(), b),
        )
        .await
        .expect("register must not wait for another user's room");

        reply.send(0).unwrap();
        leaving.await.unwrap();
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn register_racing_the_last_unregister_keeps_the_room() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = connection();
        registry.register(3, "a".into(), a).await;

        let (b, mut rx_b) = connection();
        tokio::join!(
            registry.unregister(3, "a"),
            registry.register(3, "b".into(), b)
        );

        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.push(3, Message::Text("hi".into())).await, 1);
        assert!(matches!(rx_b.recv().await, Some(Message::Text(_))));
    }
}
