//! Leaderboard/record persistence (spec §6 `leaderboard`,
//! `leaderboard_record` tables, partition key = `expiry_time`).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::ids::UserId;
use crate::leaderboard::{Leaderboard, LeaderboardRecord};

#[async_trait]
pub trait LeaderboardStorage: Send + Sync + 'static {
    async fn put_leaderboard(&self, leaderboard: &Leaderboard) -> CoreResult<()>;
    async fn get_leaderboard(&self, id: &str) -> CoreResult<Option<Leaderboard>>;
    async fn delete_leaderboard(&self, id: &str) -> CoreResult<()>;
    async fn list_leaderboards(&self, limit: usize, after_id: Option<&str>) -> CoreResult<Vec<Leaderboard>>;

    async fn put_record(&self, record: &LeaderboardRecord) -> CoreResult<()>;
    async fn get_record(
        &self,
        leaderboard_id: &str,
        owner_id: UserId,
        expiry_time: i64,
    ) -> CoreResult<Option<LeaderboardRecord>>;
    async fn delete_record(&self, leaderboard_id: &str, owner_id: UserId, expiry_time: i64) -> CoreResult<()>;
    async fn list_partition(&self, leaderboard_id: &str, expiry_time: i64) -> CoreResult<Vec<LeaderboardRecord>>;
}

type PartitionKey = (String, i64);

#[derive(Default)]
pub struct InMemoryLeaderboardStorage {
    leaderboards: RwLock<HashMap<String, Leaderboard>>,
    records: RwLock<HashMap<PartitionKey, HashMap<UserId, LeaderboardRecord>>>,
}

impl InMemoryLeaderboardStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaderboardStorage for InMemoryLeaderboardStorage {
    async fn put_leaderboard(&self, leaderboard: &Leaderboard) -> CoreResult<()> {
        self.leaderboards
            .write()
            .insert(leaderboard.id.clone(), leaderboard.clone());
        Ok(())
    }

    async fn get_leaderboard(&self, id: &str) -> CoreResult<Option<Leaderboard>> {
        Ok(self.leaderboards.read().get(id).cloned())
    }

    async fn delete_leaderboard(&self, id: &str) -> CoreResult<()> {
        self.leaderboards.write().remove(id);
        self.records.write().retain(|(lb_id, _), _| lb_id != id);
        Ok(())
    }

    async fn list_leaderboards(&self, limit: usize, after_id: Option<&str>) -> CoreResult<Vec<Leaderboard>> {
        let mut all: Vec<Leaderboard> = self.leaderboards.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let start = match after_id {
            Some(id) => all.iter().position(|l| l.id.as_str() > id).unwrap_or(all.len()),
            None => 0,
        };
        Ok(all.into_iter().skip(start).take(limit).collect())
    }

    async fn put_record(&self, record: &LeaderboardRecord) -> CoreResult<()> {
        self.records
            .write()
            .entry((record.leaderboard_id.clone(), record.expiry_time))
            .or_default()
            .insert(record.owner_id, record.clone());
        Ok(())
    }

    async fn get_record(
        &self,
        leaderboard_id: &str,
        owner_id: UserId,
        expiry_time: i64,
    ) -> CoreResult<Option<LeaderboardRecord>> {
        Ok(self
            .records
            .read()
            .get(&(leaderboard_id.to_string(), expiry_time))
            .and_then(|partition| partition.get(&owner_id))
            .cloned())
    }

    async fn delete_record(&self, leaderboard_id: &str, owner_id: UserId, expiry_time: i64) -> CoreResult<()> {
        let mut records = self.records.write();
        let partition = records
            .get_mut(&(leaderboard_id.to_string(), expiry_time))
            .ok_or_else(|| CoreError::NotFound(format!("record for {owner_id}")))?;
        partition
            .remove(&owner_id)
            .ok_or_else(|| CoreError::NotFound(format!("record for {owner_id}")))?;
        Ok(())
    }

    async fn list_partition(&self, leaderboard_id: &str, expiry_time: i64) -> CoreResult<Vec<LeaderboardRecord>> {
        Ok(self
            .records
            .read()
            .get(&(leaderboard_id.to_string(), expiry_time))
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }
}
