//! Opaque, self-validating channel listing cursor (spec §4.4).
//!
//! Encodes `(mode, subject, subcontext, label, createTime, id, forward,
//! isNext)`. Decoding fails with `InvalidCursor` if any field disagrees
//! with the stream/direction of the current request, which is what
//! prevents a cursor minted for one filter being replayed against another.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelMessage;
use crate::clock::now_epoch_millis;
use crate::cursor;
use crate::error::{CoreError, CoreResult};
use crate::presence::Stream;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorPayload {
    stream: Stream,
    create_time: i64,
    id: Uuid,
    forward: bool,
    is_next: bool,
}

pub struct ChannelCursor {
    pub create_time: i64,
    pub id: Uuid,
    payload: CursorPayload,
}

impl ChannelCursor {
    pub fn decode(raw: &str, stream: &Stream, requested_forward: bool) -> CoreResult<Self> {
        let payload: CursorPayload = cursor::decode(raw)?;

        if payload.stream != *stream {
            return Err(CoreError::InvalidCursor(
                "cursor stream does not match the current request".into(),
            ));
        }
        if payload.forward != requested_forward {
            return Err(CoreError::InvalidCursor(
                "cursor direction does not match the current request".into(),
            ));
        }

        Ok(Self {
            create_time: payload.create_time,
            id: payload.id,
            payload,
        })
    }

    pub fn encode(&self) -> String {
        cursor::encode(&self.payload)
    }

    pub fn forward_after(stream: &Stream, message: &ChannelMessage) -> Self {
        let payload = CursorPayload {
            stream: stream.clone(),
            create_time: message.create_time,
            id: message.id,
            forward: true,
            is_next: true,
        };
        Self {
            create_time: payload.create_time,
            id: payload.id,
            payload,
        }
    }

    pub fn backward_before(stream: &Stream, message: &ChannelMessage) -> Self {
        let payload = CursorPayload {
            stream: stream.clone(),
            create_time: message.create_time,
            id: message.id,
            forward: false,
            is_next: false,
        };
        Self {
            create_time: payload.create_time,
            id: payload.id,
            payload,
        }
    }

    /// The always-present `cacheableCursor`: the forward resume point past
    /// the last returned message, or "now" when the page was empty.
    pub fn forward_after_or_now(stream: &Stream, last: Option<&ChannelMessage>) -> Self {
        match last {
            Some(message) => Self::forward_after(stream, message),
            None => {
                let payload = CursorPayload {
                    stream: stream.clone(),
                    create_time: now_epoch_millis(),
                    id: Uuid::nil(),
                    forward: true,
                    is_next: true,
                };
                Self {
                    create_time: payload.create_time,
                    id: payload.id,
                    payload,
                }
            }
        }
    }
}
