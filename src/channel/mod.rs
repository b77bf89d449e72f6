//! Realtime Channel Messaging (spec §4.4).

pub mod cursor;
pub mod storage;

pub use cursor::ChannelCursor;
pub use storage::{ChannelStorage, InMemoryChannelStorage};

use std::sync::Arc;

use serde_repr::{Deserialize_repr, Serialize_repr};
use tracing::debug;
use uuid::Uuid;

use crate::caller::Caller;
use crate::clock::now_epoch_millis;
use crate::error::{CoreError, CoreResult};
use crate::ids::{new_id, UserId};
use crate::presence::{PresenceTracker, Stream, StreamMode};
use crate::router::Router;
use crate::session::SessionRegistry;
use crate::wire::{Envelope, EnvelopeBody};

/// Numeric mode tags from spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ChannelMode {
    Room = 2,
    Group = 3,
    DirectMessage = 4,
}

/// `<mode>.<subject>.<subcontext>.<label>` — unused components are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelId {
    pub mode: ChannelMode,
    pub subject: String,
    pub subcontext: String,
    pub label: String,
}

impl ChannelId {
    pub fn room(label: impl Into<String>) -> CoreResult<Self> {
        let label = label.into();
        validate_room_label(&label)?;
        Ok(Self {
            mode: ChannelMode::Room,
            subject: String::new(),
            subcontext: String::new(),
            label,
        })
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            mode: ChannelMode::Group,
            subject: group_id.into(),
            subcontext: String::new(),
            label: String::new(),
        }
    }

    /// DM between two users, canonicalized by lexicographic id order (spec
    /// §4.4).
    pub fn direct_message(a: UserId, b: UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self {
            mode: ChannelMode::DirectMessage,
            subject: lo.to_string(),
            subcontext: hi.to_string(),
            label: String::new(),
        }
    }

    pub fn to_stream(&self) -> Stream {
        match self.mode {
            ChannelMode::Room => Stream::new(StreamMode::Channel, "").with_label(&self.label),
            ChannelMode::Group => Stream::new(StreamMode::Group, &self.subject),
            ChannelMode::DirectMessage => {
                Stream::new(StreamMode::Dm, &self.subject).with_subcontext(&self.subcontext)
            }
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = self.mode as u8;
        write!(f, "{mode}.{}.{}.{}", self.subject, self.subcontext, self.label)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, '.');
        let mode = parts
            .next()
            .ok_or_else(|| CoreError::ChannelIdInvalid(s.to_string()))?;
        let subject = parts.next().unwrap_or_default().to_string();
        let subcontext = parts.next().unwrap_or_default().to_string();
        let label = parts.next().unwrap_or_default().to_string();

        let mode = match mode {
            "2" => ChannelMode::Room,
            "3" => ChannelMode::Group,
            "4" => ChannelMode::DirectMessage,
            other => return Err(CoreError::ChannelIdInvalid(format!("unknown mode {other}"))),
        };

        if mode == ChannelMode::Room {
            validate_room_label(&label)?;
        }

        Ok(Self {
            mode,
            subject,
            subcontext,
            label,
        })
    }
}

fn validate_room_label(label: &str) -> CoreResult<()> {
    if label.is_empty() || label.len() > 64 || label.chars().any(|c| c.is_control()) {
        return Err(CoreError::ChannelIdInvalid(format!(
            "room label must be 1..64 bytes of control-char-free UTF-8, got {label:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: Uuid,
    pub code: i32,
    pub sender_id: UserId,
    pub username: String,
    pub content: String,
    pub channel: ChannelId,
    pub create_time: i64,
    pub update_time: i64,
    pub persistent: bool,
}

fn check_permission(
    caller: &Caller,
    channel: &ChannelId,
    presence: &PresenceTracker,
) -> CoreResult<()> {
    let Caller::User(user_id) = caller else {
        return Ok(());
    };

    match channel.mode {
        ChannelMode::Room => Ok(()),
        ChannelMode::Group => {
            let stream = channel.to_stream();
            let is_member = presence
                .list(&stream, true)
                .iter()
                .any(|p| p.user_id == *user_id);
            if is_member {
                Ok(())
            } else {
                Err(CoreError::PermissionDenied(format!(
                    "{user_id} is not a member of group {}",
                    channel.subject
                )))
            }
        }
        ChannelMode::DirectMessage => {
            let id = user_id.to_string();
            if channel.subject == id || channel.subcontext == id {
                Ok(())
            } else {
                Err(CoreError::PermissionDenied(format!(
                    "{user_id} is not a participant in this DM"
                )))
            }
        }
    }
}

pub struct ChannelService<S: ChannelStorage> {
    storage: S,
    registry: Arc<SessionRegistry>,
    presence: Arc<PresenceTracker>,
}

impl<S: ChannelStorage> ChannelService<S> {
    pub fn new(storage: S, registry: Arc<SessionRegistry>, presence: Arc<PresenceTracker>) -> Self {
        Self {
            storage,
            registry,
            presence,
        }
    }

    pub async fn send(
        &self,
        caller: Caller,
        channel: ChannelId,
        content: String,
        sender_id: UserId,
        username: String,
        persist: bool,
    ) -> CoreResult<ChannelMessage> {
        check_permission(&caller, &channel, &self.presence)?;

        let now = now_epoch_millis();
        let message = ChannelMessage {
            id: new_id(),
            code: 0,
            sender_id,
            username,
            content,
            channel: channel.clone(),
            create_time: now,
            update_time: now,
            persistent: persist,
        };

        if persist {
            self.storage.append(&message).await?;
        }

        self.broadcast(&message);
        Ok(message)
    }

    pub async fn update(
        &self,
        caller: Caller,
        channel: ChannelId,
        message_id: Uuid,
        content: String,
    ) -> CoreResult<ChannelMessage> {
        check_permission(&caller, &channel, &self.presence)?;
        let sender_id = match &caller {
            Caller::User(id) => *id,
            Caller::Authoritative => {
                return Err(CoreError::BadInput(
                    "authoritative update must specify sender_id via storage directly".into(),
                ))
            }
        };

        let message = self
            .storage
            .update(message_id, sender_id, &content, now_epoch_millis())
            .await?;
        self.broadcast(&message);
        Ok(message)
    }

    pub async fn remove(&self, caller: Caller, channel: ChannelId, message_id: Uuid) -> CoreResult<()> {
        check_permission(&caller, &channel, &self.presence)?;
        let sender_id = match &caller {
            Caller::User(id) => *id,
            Caller::Authoritative => {
                return Err(CoreError::BadInput(
                    "authoritative remove must specify sender_id via storage directly".into(),
                ))
            }
        };
        self.storage.remove(message_id, sender_id).await
    }

    pub async fn list(
        &self,
        caller: Caller,
        channel: ChannelId,
        limit: usize,
        forward: bool,
        cursor: Option<&str>,
    ) -> CoreResult<ChannelPage> {
        check_permission(&caller, &channel, &self.presence)?;
        let stream = channel.to_stream();

        let parsed_cursor = cursor
            .map(|c| ChannelCursor::decode(c, &stream, forward))
            .transpose()?;

        let (messages, has_more) = self
            .storage
            .list(&stream, limit, forward, parsed_cursor.as_ref().map(|c| (c.create_time, c.id)))
            .await?;

        // Backward paging returns storage's natural (descending) order;
        // flip it so callers always see strictly increasing
        // (createTime, id), per spec §4.4 / §5.
        let mut ordered = messages;
        if !forward {
            ordered.reverse();
        }

        let next_cursor = if forward && has_more {
            ordered
                .last()
                .map(|m| ChannelCursor::forward_after(&stream, m).encode())
        } else if !forward && cursor.is_some() {
            // we had a previous page before this one
            ordered
                .first()
                .map(|m| ChannelCursor::backward_before(&stream, m).encode())
        } else {
            None
        };

        let prev_cursor = if !forward && has_more {
            ordered
                .first()
                .map(|m| ChannelCursor::backward_before(&stream, m).encode())
        } else if forward && cursor.is_some() {
            ordered
                .first()
                .map(|m| ChannelCursor::backward_before(&stream, m).encode())
        } else {
            None
        };

        // Always returned, even for an empty page, so clients can resume
        // (spec §4.4 "cacheableCursor").
        let cacheable_cursor = ChannelCursor::forward_after_or_now(&stream, ordered.last()).encode();

        Ok(ChannelPage {
            messages: ordered,
            next_cursor,
            prev_cursor,
            cacheable_cursor,
        })
    }

    fn broadcast(&self, message: &ChannelMessage) {
        let router = Router::new(&self.registry, &self.presence);
        let envelope = Envelope {
            cid: None,
            body: EnvelopeBody::ChannelMessage {
                stream_mode: message.channel.mode as u8,
                subject: message.channel.subject.clone(),
                subcontext: message.channel.subcontext.clone(),
                label: message.channel.label.clone(),
                content: message.content.clone(),
            },
        };
        router.send_to_stream(&message.channel.to_stream(), &envelope, true);
        debug!(message_id = %message.id, "broadcast channel message");
    }
}

#[derive(Debug, Clone)]
pub struct ChannelPage {
    pub messages: Vec<ChannelMessage>,
    pub next_cursor: Option<String>,
    pub prev_cursor: Option<String>,
    pub cacheable_cursor: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceMeta;
    use crate::wire::Format;

    fn service() -> ChannelService<InMemoryChannelStorage> {
        ChannelService::new(
            InMemoryChannelStorage::new(),
            Arc::new(SessionRegistry::new()),
            Arc::new(PresenceTracker::new()),
        )
    }

    #[test]
    fn channel_id_round_trips() {
        let id = ChannelId::room("general").unwrap();
        let s = id.to_string();
        let parsed: ChannelId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn dm_channel_is_canonicalized() {
        let a = new_id();
        let b = new_id();
        let ab = ChannelId::direct_message(a, b);
        let ba = ChannelId::direct_message(b, a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn room_label_validation() {
        assert!(ChannelId::room("").is_err());
        assert!(ChannelId::room("x".repeat(65)).is_err());
        assert!(ChannelId::room("ok").is_ok());
    }

    #[tokio::test]
    async fn group_send_requires_membership() {
        let svc = service();
        let group = ChannelId::group("guild-1");
        let outsider = new_id();

        let result = svc
            .send(
                Caller::User(outsider),
                group.clone(),
                "hi".into(),
                outsider,
                "outsider".into(),
                false,
            )
            .await;
        assert!(matches!(result, Err(CoreError::PermissionDenied(_))));

        svc.presence.track(
            new_id(),
            group.to_stream(),
            outsider,
            PresenceMeta {
                username: "outsider".into(),
                format: Format::Text,
                hidden: false,
                status: None,
            },
        );

        let result = svc
            .send(
                Caller::User(outsider),
                group,
                "hi".into(),
                outsider,
                "outsider".into(),
                false,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn paging_forward_then_backward_covers_all_messages() {
        let svc = service();
        let room = ChannelId::room("general").unwrap();
        let sender = new_id();

        for i in 0..5 {
            svc.send(
                Caller::Authoritative,
                room.clone(),
                format!("msg {i}"),
                sender,
                "sender".into(),
                true,
            )
            .await
            .unwrap();
        }

        let page1 = svc
            .list(Caller::Authoritative, room.clone(), 2, true, None)
            .await
            .unwrap();
        assert_eq!(page1.messages.len(), 2);
        assert!(page1.next_cursor.is_some());

        let page2 = svc
            .list(
                Caller::Authoritative,
                room.clone(),
                2,
                true,
                page1.next_cursor.as_deref(),
            )
            .await
            .unwrap();
        assert_eq!(page2.messages.len(), 2);
        assert!(page2.next_cursor.is_some());

        let page3 = svc
            .list(
                Caller::Authoritative,
                room,
                2,
                true,
                page2.next_cursor.as_deref(),
            )
            .await
            .unwrap();
        assert_eq!(page3.messages.len(), 1);
        assert!(page3.next_cursor.is_none());
    }
}
