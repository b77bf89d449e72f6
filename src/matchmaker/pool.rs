//! Ticket pool storage: sharded by `requiredCount` since candidate scans
//! never cross that boundary (spec §4.3 "equal `requiredCount`").

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::{SessionId, TicketId, UserId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketProperties {
    pub strings: HashMap<String, String>,
    pub numerics: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: TicketId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub required_count: u32,
    pub properties: TicketProperties,
}

/// One bucket of the pool, all tickets sharing a `requiredCount`. Order
/// within the bucket is insertion order, which is what first-fit matching
/// walks (spec §4.3 "Ordering & fairness").
#[derive(Default)]
struct Bucket {
    order: VecDeque<TicketId>,
}

#[derive(Default)]
pub struct MatchmakerPool {
    tickets: DashMap<TicketId, Ticket>,
    buckets: DashMap<u32, Mutex<Bucket>>,
    by_session: DashMap<SessionId, Vec<TicketId>>,
}

impl MatchmakerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ticket: Ticket) {
        let required_count = ticket.required_count;
        let id = ticket.id;
        let session_id = ticket.session_id;

        self.buckets
            .entry(required_count)
            .or_default()
            .lock()
            .order
            .push_back(id);
        self.by_session.entry(session_id).or_default().push(id);
        self.tickets.insert(id, ticket);
    }

    pub fn get(&self, id: TicketId) -> Option<Ticket> {
        self.tickets.get(&id).map(|t| t.clone())
    }

    /// Candidate tickets for `required_count`, in insertion order,
    /// excluding ones already removed.
    pub fn bucket_snapshot(&self, required_count: u32) -> Vec<Ticket> {
        let Some(bucket) = self.buckets.get(&required_count) else {
            return Vec::new();
        };
        let result = bucket
            .lock()
            .order
            .iter()
            .filter_map(|id| self.tickets.get(id).map(|t| t.clone()))
            .collect();
        result
    }

    /// Atomically removes a set of tickets (a matched group) from every
    /// index. Returns the ones that were actually still present — another
    /// concurrent match attempt may have already consumed one.
    pub fn remove_set(&self, ids: &[TicketId]) -> Vec<Ticket> {
        let mut removed = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some((_, ticket)) = self.tickets.remove(&id) {
                if let Some(bucket) = self.buckets.get(&ticket.required_count) {
                    bucket.lock().order.retain(|existing| *existing != id);
                }
                if let Some(mut owned) = self.by_session.get_mut(&ticket.session_id) {
                    owned.retain(|existing| *existing != id);
                }
                removed.push(ticket);
            }
        }
        removed
    }

    pub fn withdraw(&self, id: TicketId) -> Option<Ticket> {
        let removed = self.remove_set(&[id]);
        removed.into_iter().next()
    }

    pub fn withdraw_all(&self, session_id: SessionId) -> Vec<Ticket> {
        let Some((_, ids)) = self.by_session.remove(&session_id) else {
            return Vec::new();
        };
        self.remove_set(&ids)
    }

    pub fn update_all(&self, session_id: SessionId, properties: TicketProperties) {
        if let Some(ids) = self.by_session.get(&session_id) {
            for id in ids.iter() {
                if let Some(mut ticket) = self.tickets.get_mut(id) {
                    ticket.properties = properties.clone();
                }
            }
        }
    }
}
