//! Channel message persistence (spec §6 `message` table, indexed by
//! stream+create_time+id).

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::channel::ChannelMessage;
use crate::error::{CoreError, CoreResult};
use crate::ids::UserId;
use crate::presence::Stream;

#[async_trait]
pub trait ChannelStorage: Send + Sync + 'static {
    async fn append(&self, message: &ChannelMessage) -> CoreResult<()>;

    /// Only affects a message whose `sender_id` matches the caller (spec
    /// §4.4); fails `NotFound` if no such row exists.
    async fn update(
        &self,
        message_id: Uuid,
        sender_id: UserId,
        content: &str,
        update_time: i64,
    ) -> CoreResult<ChannelMessage>;

    async fn remove(&self, message_id: Uuid, sender_id: UserId) -> CoreResult<()>;

    /// Returns up to `limit` messages strictly on the requested side of
    /// `after` (a `(createTime, id)` composite boundary), plus whether
    /// more rows remain beyond the page.
    async fn list(
        &self,
        stream: &Stream,
        limit: usize,
        forward: bool,
        after: Option<(i64, Uuid)>,
    ) -> CoreResult<(Vec<ChannelMessage>, bool)>;
}

/// Ordered by `(createTime, id)` ascending, matching the `message` table's
/// index (spec §6).
#[derive(Default)]
pub struct InMemoryChannelStorage {
    messages: Mutex<Vec<ChannelMessage>>,
}

impl InMemoryChannelStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStorage for InMemoryChannelStorage {
    async fn append(&self, message: &ChannelMessage) -> CoreResult<()> {
        let mut messages = self.messages.lock();
        let pos = messages
            .binary_search_by_key(&(message.create_time, message.id), |m| (m.create_time, m.id))
            .unwrap_or_else(|p| p);
        messages.insert(pos, message.clone());
        Ok(())
    }

    async fn update(
        &self,
        message_id: Uuid,
        sender_id: UserId,
        content: &str,
        update_time: i64,
    ) -> CoreResult<ChannelMessage> {
        let mut messages = self.messages.lock();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id && m.sender_id == sender_id)
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?;
        message.content = content.to_string();
        message.update_time = update_time;
        Ok(message.clone())
    }

    async fn remove(&self, message_id: Uuid, sender_id: UserId) -> CoreResult<()> {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| !(m.id == message_id && m.sender_id == sender_id));
        if messages.len() == before {
            return Err(CoreError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn list(
        &self,
        stream: &Stream,
        limit: usize,
        forward: bool,
        after: Option<(i64, Uuid)>,
    ) -> CoreResult<(Vec<ChannelMessage>, bool)> {
        let messages = self.messages.lock();
        let mut matching: Vec<&ChannelMessage> = messages
            .iter()
            .filter(|m| &m.channel.to_stream() == stream)
            .collect();
        matching.sort_by_key(|m| (m.create_time, m.id));

        let filtered: Vec<&ChannelMessage> = match (forward, after) {
            (true, Some((t, id))) => matching
                .into_iter()
                .filter(|m| (m.create_time, m.id) > (t, id))
                .collect(),
            (true, None) => matching,
            (false, Some((t, id))) => {
                let mut v: Vec<&ChannelMessage> = matching
                    .into_iter()
                    .filter(|m| (m.create_time, m.id) < (t, id))
                    .collect();
                v.reverse();
                v
            }
            (false, None) => {
                let mut v = matching;
                v.reverse();
                v
            }
        };

        let has_more = filtered.len() > limit;
        let page: Vec<ChannelMessage> = filtered.into_iter().take(limit).cloned().collect();
        Ok((page, has_more))
    }
}
