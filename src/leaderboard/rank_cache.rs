//! Per-`(leaderboardId, expiryTime)` rank cache: a sorted container kept in
//! leaderboard sort order, sharded by partition key (spec §4.5, §5).

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::UserId;
use crate::leaderboard::SortOrder;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    score: i64,
    subscore: i64,
    owner_id: UserId,
}

/// True if `a` is strictly better than `b` under `order`, comparing
/// `(score, subscore)` lexicographically (ownerId never participates in
/// "better", only in total-order tie-breaking for storage).
fn strictly_better(order: SortOrder, a: (i64, i64), b: (i64, i64)) -> bool {
    match order {
        SortOrder::Ascending => a < b,
        SortOrder::Descending => a > b,
    }
}

struct Partition {
    order: SortOrder,
    /// Sorted best-first.
    entries: Vec<Entry>,
}

impl Partition {
    fn new(order: SortOrder) -> Self {
        Self {
            order,
            entries: Vec::new(),
        }
    }

    fn position_of(&self, owner_id: UserId) -> Option<usize> {
        self.entries.iter().position(|e| e.owner_id == owner_id)
    }

    fn rank_of_tuple(&self, tuple: (i64, i64)) -> usize {
        self.entries
            .partition_point(|e| strictly_better(self.order, (e.score, e.subscore), tuple))
    }

    fn insert(&mut self, score: i64, subscore: i64, owner_id: UserId) -> usize {
        if let Some(pos) = self.position_of(owner_id) {
            self.entries.remove(pos);
        }
        let entry = Entry {
            score,
            subscore,
            owner_id,
        };
        let insert_at = self.rank_of_tuple((score, subscore));
        self.entries.insert(insert_at, entry);
        insert_at + 1
    }

    fn get(&self, owner_id: UserId) -> usize {
        match self.position_of(owner_id) {
            Some(_) => {
                let entry = self.entries.iter().find(|e| e.owner_id == owner_id).unwrap();
                self.rank_of_tuple((entry.score, entry.subscore)) + 1
            }
            None => 0,
        }
    }

    fn delete(&mut self, owner_id: UserId) {
        self.entries.retain(|e| e.owner_id != owner_id);
    }
}

#[derive(Default)]
pub struct RankCache {
    partitions: DashMap<(String, i64), Mutex<Partition>>,
}

impl RankCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        leaderboard_id: &str,
        expiry_time: i64,
        order: SortOrder,
        score: i64,
        subscore: i64,
        owner_id: UserId,
    ) -> usize {
        let key = (leaderboard_id.to_string(), expiry_time);
        let partition = self
            .partitions
            .entry(key)
            .or_insert_with(|| Mutex::new(Partition::new(order)));
        let rank = partition.lock().insert(score, subscore, owner_id);
        rank
    }

    /// Returns 0 when absent from the cache.
    pub fn get(&self, leaderboard_id: &str, expiry_time: i64, owner_id: UserId) -> usize {
        let key = (leaderboard_id.to_string(), expiry_time);
        self.partitions
            .get(&key)
            .map(|p| p.lock().get(owner_id))
            .unwrap_or(0)
    }

    pub fn delete(&self, leaderboard_id: &str, expiry_time: i64, owner_id: UserId) {
        let key = (leaderboard_id.to_string(), expiry_time);
        if let Some(partition) = self.partitions.get(&key) {
            partition.lock().delete(owner_id);
        }
    }

    pub fn delete_leaderboard(&self, leaderboard_id: &str, expiry_time: i64) {
        self.partitions
            .remove(&(leaderboard_id.to_string(), expiry_time));
    }

    /// Stamps `rank` onto each of `records` (by owner id). When
    /// `enable_ranks` is false, stamps 0 without touching the cache (spec
    /// §4.5 "enableRanks=false returns 0 rank without populating").
    pub fn fill<'a>(
        &self,
        leaderboard_id: &str,
        enable_ranks: bool,
        records: impl IntoIterator<Item = (UserId, i64, &'a mut usize)>,
    ) {
        for (owner_id, expiry_time, rank_slot) in records {
            *rank_slot = if enable_ranks {
                self.get(leaderboard_id, expiry_time, owner_id)
            } else {
                0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_equals_one_plus_strictly_better_count() {
        let cache = RankCache::new();
        let u1 = crate::ids::new_id();
        let u2 = crate::ids::new_id();
        let u3 = crate::ids::new_id();

        cache.insert("lb", 0, SortOrder::Descending, 8, 0, u1);
        cache.insert("lb", 0, SortOrder::Descending, 9, 0, u2);
        cache.insert("lb", 0, SortOrder::Descending, 7, 0, u3);

        assert_eq!(cache.get("lb", 0, u2), 1);
        assert_eq!(cache.get("lb", 0, u1), 2);
        assert_eq!(cache.get("lb", 0, u3), 3);
    }

    #[test]
    fn reinsert_updates_rank_in_place() {
        let cache = RankCache::new();
        let owner = crate::ids::new_id();
        let other = crate::ids::new_id();

        cache.insert("lb", 0, SortOrder::Ascending, 10, 0, owner);
        cache.insert("lb", 0, SortOrder::Ascending, 5, 0, other);
        assert_eq!(cache.get("lb", 0, owner), 2);

        cache.insert("lb", 0, SortOrder::Ascending, 1, 0, owner);
        assert_eq!(cache.get("lb", 0, owner), 1);
    }

    #[test]
    fn absent_owner_has_rank_zero() {
        let cache = RankCache::new();
        assert_eq!(cache.get("lb", 0, crate::ids::new_id()), 0);
    }

    #[test]
    fn delete_leaderboard_purges_partition() {
        let cache = RankCache::new();
        let owner = crate::ids::new_id();
        cache.insert("lb", 0, SortOrder::Ascending, 1, 0, owner);
        cache.delete_leaderboard("lb", 0);
        assert_eq!(cache.get("lb", 0, owner), 0);
    }
}
