//! Presence Tracker: `stream -> set<presence>`.
//!
//! Mirrors the teacher's sharded-map-plus-snapshot style (see
//! `EntityManager` in the teacher repo) but keyed by the 4-tuple stream
//! identifier from spec §3/§4.1 instead of a single match id.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};
use crate::wire::Format;

/// One of the stream modes named in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamMode {
    Notifications,
    Status,
    MatchRelayed,
    MatchAuthoritative,
    Group,
    Dm,
    Channel,
}

/// `(mode, subject, subcontext, label)`. Equality is by all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub mode: StreamMode,
    pub subject: String,
    pub subcontext: String,
    pub label: String,
}

impl Stream {
    pub fn new(mode: StreamMode, subject: impl Into<String>) -> Self {
        Self {
            mode,
            subject: subject.into(),
            subcontext: String::new(),
            label: String::new(),
        }
    }

    pub fn with_subcontext(mut self, subcontext: impl Into<String>) -> Self {
        self.subcontext = subcontext.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        assert!(label.len() <= 64, "stream label must be <= 64 bytes");
        self.label = label;
        self
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}.{}.{}.{}",
            self.mode, self.subject, self.subcontext, self.label
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub username: String,
    pub format: Format,
    pub hidden: bool,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub stream: Stream,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub meta: PresenceMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PresenceKey {
    session_id: SessionId,
    user_id: UserId,
}

/// Sharded via `DashMap`: one shard-lock per stream bucket, readers get a
/// cloned snapshot so callers never hold the tracker's lock while they
/// iterate (spec §9 "readers snapshot a slice").
#[derive(Default)]
pub struct PresenceTracker {
    by_stream: DashMap<Stream, Vec<Presence>>,
    by_session: DashMap<SessionId, Vec<Stream>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the meta that is now tracked for `(stream, sessionId,
    /// userId)`: either the freshly-inserted one, or the existing one if
    /// this was already tracked ("already present" semantics from §4.1 —
    /// the second of two simultaneous tracks returns the existing meta).
    pub fn track(
        &self,
        session_id: SessionId,
        stream: Stream,
        user_id: UserId,
        meta: PresenceMeta,
    ) -> PresenceMeta {
        let mut entry = self.by_stream.entry(stream.clone()).or_default();
        if let Some(existing) = entry
            .iter()
            .find(|p| p.session_id == session_id && p.user_id == user_id)
        {
            return existing.meta.clone();
        }

        entry.push(Presence {
            stream: stream.clone(),
            session_id,
            user_id,
            meta: meta.clone(),
        });
        drop(entry);

        self.by_session.entry(session_id).or_default().push(stream);
        meta
    }

    pub fn track_multi(
        &self,
        session_id: SessionId,
        streams: impl IntoIterator<Item = (Stream, UserId, PresenceMeta)>,
    ) {
        for (stream, user_id, meta) in streams {
            self.track(session_id, stream, user_id, meta);
        }
    }

    pub fn untrack(&self, session_id: SessionId, stream: &Stream, user_id: UserId) {
        if let Some(mut presences) = self.by_stream.get_mut(stream) {
            presences.retain(|p| !(p.session_id == session_id && p.user_id == user_id));
            if presences.is_empty() {
                drop(presences);
                self.by_stream.remove(stream);
            }
        }
        if let Some(mut streams) = self.by_session.get_mut(&session_id) {
            streams.retain(|s| s != stream);
        }
    }

    /// Atomically removes every presence owned by `session_id` (spec §4.1
    /// "On session close, all presences owned by that session are removed
    /// atomically").
    pub fn untrack_session(&self, session_id: SessionId) -> Vec<Stream> {
        let Some((_, streams)) = self.by_session.remove(&session_id) else {
            return Vec::new();
        };
        for stream in &streams {
            if let Some(mut presences) = self.by_stream.get_mut(stream) {
                presences.retain(|p| p.session_id != session_id);
                if presences.is_empty() {
                    drop(presences);
                    self.by_stream.remove(stream);
                }
            }
        }
        streams
    }

    pub fn list(&self, stream: &Stream, include_hidden: bool) -> Vec<Presence> {
        self.by_stream
            .get(stream)
            .map(|p| {
                p.iter()
                    .filter(|p| include_hidden || !p.meta.hidden)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_presence_ids(&self, stream: &Stream) -> HashSet<SessionId> {
        self.by_stream
            .get(stream)
            .map(|p| p.iter().map(|p| p.session_id).collect())
            .unwrap_or_default()
    }

    pub fn stream_exists(&self, stream: &Stream) -> bool {
        self.by_stream.contains_key(stream)
    }

    pub fn get_local_by_session_id_stream_user_id(
        &self,
        session_id: SessionId,
        stream: &Stream,
        user_id: UserId,
    ) -> Option<Presence> {
        self.by_stream.get(stream).and_then(|p| {
            p.iter()
                .find(|p| p.session_id == session_id && p.user_id == user_id)
                .cloned()
        })
    }
}
