//! Matchmaker: ticket pool; promotes completions via callback into the
//! Match Engine (spec §4.3).
//!
//! Implements the richer property-weighted matcher from spec §9's open
//! question, with exact-equality matching on `requiredCount` as the hard
//! precondition. When no ticket in a candidate pool carries any
//! properties, every candidate scores 0 and the greedy selection below
//! degenerates to plain first-fit by insertion order — so the "simple"
//! matcher is this one's zero-property special case, not a separate code
//! path.

pub mod pool;

pub use pool::{Ticket, TicketProperties};

use tracing::{info, warn};

use crate::ids::{new_id, SessionId, TicketId, UserId};
use pool::MatchmakerPool;

/// Outcome of a completed ticket group: either a match id to route into,
/// or `None` to leave the tickets consumed but unrouted (rare, logged per
/// spec §4.3).
pub type MatchedCallback = dyn Fn(Vec<Ticket>) + Send + Sync;

pub struct Matchmaker {
    pool: MatchmakerPool,
    on_matched: Box<MatchedCallback>,
}

impl Matchmaker {
    pub fn new(on_matched: impl Fn(Vec<Ticket>) + Send + Sync + 'static) -> Self {
        Self {
            pool: MatchmakerPool::new(),
            on_matched: Box::new(on_matched),
        }
    }

    /// Enters a new ticket and immediately scans for a completing
    /// candidate set. Returns the new ticket's id regardless of whether it
    /// was immediately matched and consumed.
    pub fn enter(
        &self,
        session_id: SessionId,
        user_id: UserId,
        required_count: u32,
        properties: TicketProperties,
    ) -> TicketId {
        assert!(required_count >= 2, "requiredCount must be >= 2");

        let ticket = Ticket {
            id: new_id(),
            session_id,
            user_id,
            required_count,
            properties,
        };
        let ticket_id = ticket.id;
        self.pool.insert(ticket);

        if let Some(group) = self.find_candidate_group(required_count) {
            let ids: Vec<TicketId> = group.iter().map(|t| t.id).collect();
            let removed = self.pool.remove_set(&ids);
            if removed.len() == group.len() {
                info!(count = removed.len(), "matchmaker ticket group completed");
                (self.on_matched)(removed);
            } else {
                // a concurrent scan already consumed part of this group;
                // put back what we successfully removed is unnecessary —
                // the group is no longer well-formed, so anything we did
                // remove is simply dropped (matches "matched fires exactly
                // once" — we never invoke the callback on a partial set).
                warn!("candidate group raced with a concurrent match, discarding partial set");
            }
        }

        ticket_id
    }

    pub fn withdraw(&self, ticket_id: TicketId) {
        self.pool.withdraw(ticket_id);
    }

    pub fn withdraw_all(&self, session_id: SessionId) -> Vec<Ticket> {
        self.pool.withdraw_all(session_id)
    }

    pub fn update_all(&self, session_id: SessionId, properties: TicketProperties) {
        self.pool.update_all(session_id, properties);
    }

    /// Considers every valid (distinct-session, distinct-user) combination
    /// of `requiredCount` tickets in the bucket and picks the one with the
    /// highest total pairwise property similarity, breaking ties toward
    /// the combination with the earliest overall insertion order. When no
    /// candidate carries properties every combination scores 0, so the
    /// tie-break alone decides — which is exactly first-fit by insertion
    /// order, the degenerate case spec §9 describes.
    ///
    /// Bucket size is bounded by `MAX_CANDIDATES_CONSIDERED` to keep the
    /// combinatorial scan cheap; tickets beyond that window simply wait
    /// for the next insertion to trigger a fresh scan.
    fn find_candidate_group(&self, required_count: u32) -> Option<Vec<Ticket>> {
        const MAX_CANDIDATES_CONSIDERED: usize = 24;

        let mut candidates = self.pool.bucket_snapshot(required_count);
        candidates.truncate(MAX_CANDIDATES_CONSIDERED);
        if candidates.len() < required_count as usize {
            return None;
        }

        use itertools::Itertools;

        candidates
            .iter()
            .enumerate()
            .combinations(required_count as usize)
            .filter(|combo| {
                combo.iter().enumerate().all(|(i, (_, a))| {
                    combo[i + 1..]
                        .iter()
                        .all(|(_, b)| a.session_id != b.session_id && a.user_id != b.user_id)
                })
            })
            .map(|combo| {
                let mut score = 0.0;
                for i in 0..combo.len() {
                    for j in (i + 1)..combo.len() {
                        score += similarity(combo[i].1, combo[j].1);
                    }
                }
                let index_sum: usize = combo.iter().map(|(idx, _)| *idx).sum();
                let tickets: Vec<Ticket> = combo.into_iter().map(|(_, t)| t.clone()).collect();
                (score, std::cmp::Reverse(index_sum), tickets)
            })
            .max_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, _, tickets)| tickets)
    }
}

fn similarity(a: &Ticket, b: &Ticket) -> f64 {
    let mut score = 0.0;
    for (key, value) in &a.properties.strings {
        if b.properties.strings.get(key) == Some(value) {
            score += 1.0;
        }
    }
    for (key, value) in &a.properties.numerics {
        if let Some(other) = b.properties.numerics.get(key) {
            score += 1.0 / (1.0 + (value - other).abs());
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ticket_id_set(tickets: &[Ticket]) -> Vec<TicketId> {
        tickets.iter().map(|t| t.id).collect()
    }

    #[test]
    fn matched_fires_exactly_once_for_a_complete_group() {
        let matched: Arc<Mutex<Vec<Vec<Ticket>>>> = Arc::new(Mutex::new(Vec::new()));
        let matched_clone = matched.clone();
        let mm = Matchmaker::new(move |group| matched_clone.lock().unwrap().push(group));

        let (s1, u1) = (new_id(), new_id());
        let (s2, u2) = (new_id(), new_id());
        let (s3, u3) = (new_id(), new_id());

        mm.enter(s1, u1, 3, TicketProperties::default());
        assert_eq!(matched.lock().unwrap().len(), 0);
        mm.enter(s2, u2, 3, TicketProperties::default());
        assert_eq!(matched.lock().unwrap().len(), 0);
        mm.enter(s3, u3, 3, TicketProperties::default());

        let matches = matched.lock().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].len(), 3);
    }

    #[test]
    fn withdraw_all_after_match_is_a_no_op() {
        let mm = Matchmaker::new(|_| {});
        let (s1, u1) = (new_id(), new_id());
        let (s2, u2) = (new_id(), new_id());

        let t1 = mm.enter(s1, u1, 2, TicketProperties::default());
        let _t2 = mm.enter(s2, u2, 2, TicketProperties::default());

        // already matched and consumed — withdraw is a harmless no-op
        mm.withdraw(t1);
        assert!(mm.withdraw_all(s1).is_empty());
    }

    #[test]
    fn distinct_sessions_and_users_required() {
        let matched: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let matched_clone = matched.clone();
        let mm = Matchmaker::new(move |_| *matched_clone.lock().unwrap() += 1);

        let user_id = new_id();
        // same user, two different sessions should NOT complete a group
        // requiring 2 distinct users.
        mm.enter(new_id(), user_id, 2, TicketProperties::default());
        mm.enter(new_id(), user_id, 2, TicketProperties::default());

        assert_eq!(*matched.lock().unwrap(), 0);
    }

    #[test]
    fn property_similarity_prefers_closer_candidates() {
        let matched: Arc<Mutex<Vec<Vec<Ticket>>>> = Arc::new(Mutex::new(Vec::new()));
        let matched_clone = matched.clone();
        let mm = Matchmaker::new(move |group| matched_clone.lock().unwrap().push(group));

        let mut near = TicketProperties::default();
        near.numerics.insert("mmr".into(), 1000.0);
        let mut far = TicketProperties::default();
        far.numerics.insert("mmr".into(), 5000.0);
        let mut seeker = TicketProperties::default();
        seeker.numerics.insert("mmr".into(), 1010.0);

        mm.enter(new_id(), new_id(), 2, far);
        mm.enter(new_id(), new_id(), 2, near.clone());
        mm.enter(new_id(), new_id(), 2, seeker);

        let matches = matched.lock().unwrap();
        assert_eq!(matches.len(), 1);
        let got: Vec<f64> = matches[0]
            .iter()
            .flat_map(|t| t.properties.numerics.get("mmr").cloned())
            .collect();
        assert!(got.contains(&1000.0));
        assert!(!got.contains(&5000.0));
        let _ = ticket_id_set(&matches[0]);
    }
}
