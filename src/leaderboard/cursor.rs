//! Record-listing and haystack pagination (spec §4.5, §4.5 "haystack").

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::UserId;
use crate::leaderboard::{Leaderboard, LeaderboardCache, LeaderboardRecord, LeaderboardStorage, SortOrder};

/// Opaque listing cursor. Encodes `(leaderboardId, expiryTime, score,
/// subscore, ownerId, rank, isNext)` (spec §4.5). `is_next` records the
/// direction the cursor was minted for and is checked against the
/// direction of the request it's replayed into — the same role `forward`
/// plays on [`crate::channel::cursor::ChannelCursor`], just folded into the
/// single boolean the spec's tuple has room for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardCursor {
    pub leaderboard_id: String,
    pub expiry_time: i64,
    pub score: i64,
    pub subscore: i64,
    pub owner_id: UserId,
    pub rank: usize,
    pub is_next: bool,
}

impl LeaderboardCursor {
    fn from_ranked(leaderboard_id: &str, expiry_time: i64, record: &RankedRecord, is_next: bool) -> Self {
        Self {
            leaderboard_id: leaderboard_id.to_string(),
            expiry_time,
            score: record.record.score,
            subscore: record.record.subscore,
            owner_id: record.record.owner_id,
            rank: record.rank,
            is_next,
        }
    }

    /// Mints a forward-continuation cursor anchored after `record`.
    pub fn after(leaderboard_id: &str, expiry_time: i64, record: &RankedRecord) -> Self {
        Self::from_ranked(leaderboard_id, expiry_time, record, true)
    }

    /// Mints a backward-continuation cursor anchored before `record`.
    pub fn before(leaderboard_id: &str, expiry_time: i64, record: &RankedRecord) -> Self {
        Self::from_ranked(leaderboard_id, expiry_time, record, false)
    }

    pub fn encode(&self) -> String {
        crate::cursor::encode(self)
    }

    /// Decodes `raw`, rejecting it unless it was minted for the same
    /// leaderboard partition and the same paging direction the caller is
    /// requesting (spec §7 `InvalidCursor`).
    pub fn decode(raw: &str, leaderboard_id: &str, expiry_time: i64, requested_forward: bool) -> CoreResult<Self> {
        let cursor: Self = crate::cursor::decode(raw)?;
        if cursor.leaderboard_id != leaderboard_id || cursor.expiry_time != expiry_time {
            return Err(CoreError::InvalidCursor(raw.to_string()));
        }
        if cursor.is_next != requested_forward {
            return Err(CoreError::InvalidCursor(raw.to_string()));
        }
        Ok(cursor)
    }
}

fn tuple(record: &LeaderboardRecord) -> (i64, i64) {
    (record.score, record.subscore)
}

/// `true` if `a` ranks ahead of (is better than or equal to) `b` under
/// `order`, used to keep a partition's natural best-first ordering.
fn ranks_before(order: SortOrder, a: (i64, i64), b: (i64, i64)) -> bool {
    match order {
        SortOrder::Ascending => a <= b,
        SortOrder::Descending => a >= b,
    }
}

fn sort_partition(order: SortOrder, mut records: Vec<LeaderboardRecord>) -> Vec<LeaderboardRecord> {
    records.sort_by(|a, b| {
        let (at, bt) = (tuple(a), tuple(b));
        match order {
            SortOrder::Ascending => at.cmp(&bt),
            SortOrder::Descending => bt.cmp(&at),
        }
        .then_with(|| a.owner_id.cmp(&b.owner_id))
    });
    records
}

/// Locates the partition index a cursor was minted from. Each partition
/// has at most one record per owner, so an exact `owner_id` match is the
/// robust anchor; it falls back to a tuple-based scan only if that owner's
/// record was deleted since the cursor was minted (e.g. a reset landed
/// between pages).
fn find_anchor(partition: &[LeaderboardRecord], order: SortOrder, cursor: &LeaderboardCursor) -> usize {
    partition.iter().position(|r| r.owner_id == cursor.owner_id).unwrap_or_else(|| {
        let boundary = (cursor.score, cursor.subscore);
        partition
            .iter()
            .position(|r| !ranks_before(order, tuple(r), boundary))
            .unwrap_or(partition.len())
    })
}

/// A record paired with its rank at the moment it was listed (spec §4.5
/// "enableRanks=false returns 0 rank without populating").
#[derive(Debug, Clone)]
pub struct RankedRecord {
    pub record: LeaderboardRecord,
    pub rank: usize,
}

impl<S: LeaderboardStorage> LeaderboardCache<S> {
    /// Lists a partition best-first. `forward` selects paging direction;
    /// paging backward flips result order and cursor polarity the same way
    /// `ChannelService::list` does for channel history (spec §4.5, §4.4).
    pub async fn list_records(
        &self,
        leaderboard_id: &str,
        limit: usize,
        forward: bool,
        cursor: Option<&str>,
    ) -> CoreResult<(Vec<RankedRecord>, Option<String>, Option<String>)> {
        let leaderboard = self.get(leaderboard_id).await?;
        let now = crate::clock::now_epoch_secs();
        let expiry = leaderboard.current_partition(now);
        let partition = sort_partition(
            leaderboard.sort_order,
            self.storage().list_partition(leaderboard_id, expiry).await?,
        );

        let anchor = match cursor {
            Some(raw) => {
                let cursor = LeaderboardCursor::decode(raw, leaderboard_id, expiry, forward)?;
                Some(find_anchor(&partition, leaderboard.sort_order, &cursor))
            }
            None => None,
        };

        let (page, has_prev, has_next) = if forward {
            let start = anchor.map(|i| i + 1).unwrap_or(0);
            let mut page: Vec<LeaderboardRecord> =
                partition.get(start..).unwrap_or_default().iter().take(limit + 1).cloned().collect();
            let has_next = page.len() > limit;
            if has_next {
                page.truncate(limit);
            }
            (page, start > 0, has_next)
        } else {
            let end = anchor.unwrap_or(partition.len());
            let window_start = end.saturating_sub(limit + 1);
            let window: Vec<LeaderboardRecord> = partition.get(window_start..end).unwrap_or_default().to_vec();
            let has_prev = window.len() > limit;
            let page = if has_prev { window[1..].to_vec() } else { window };
            (page, has_prev, end < partition.len())
        };

        let page = self.rank_records(&leaderboard, expiry, page);

        let prev_cursor = has_prev
            .then(|| page.first().map(|r| LeaderboardCursor::before(leaderboard_id, expiry, r).encode()))
            .flatten();
        let next_cursor = has_next
            .then(|| page.last().map(|r| LeaderboardCursor::after(leaderboard_id, expiry, r).encode()))
            .flatten();

        Ok((page, prev_cursor, next_cursor))
    }

    /// Lists only the records belonging to `owner_ids`, in partition order.
    pub async fn list_records_by_owners(
        &self,
        leaderboard_id: &str,
        owner_ids: &[UserId],
    ) -> CoreResult<Vec<RankedRecord>> {
        let leaderboard = self.get(leaderboard_id).await?;
        let now = crate::clock::now_epoch_secs();
        let expiry = leaderboard.current_partition(now);
        let partition = sort_partition(
            leaderboard.sort_order,
            self.storage().list_partition(leaderboard_id, expiry).await?,
        );
        let page: Vec<LeaderboardRecord> = partition
            .into_iter()
            .filter(|r| owner_ids.contains(&r.owner_id))
            .collect();
        Ok(self.rank_records(&leaderboard, expiry, page))
    }

    /// Asymmetric window centered on `owner_id`: up to `limit + 1` strictly
    /// better records, the owner's own record, and up to `limit / 2 + 1`
    /// strictly worse records (spec §4.5 "haystack"). When one side runs
    /// out early near a partition edge the window slides to fill the
    /// other side up to the same total, rather than growing past it.
    pub async fn haystack(
        &self,
        leaderboard_id: &str,
        owner_id: UserId,
        limit: usize,
    ) -> CoreResult<(Vec<RankedRecord>, Option<String>, Option<String>)> {
        let leaderboard = self.get(leaderboard_id).await?;
        let now = crate::clock::now_epoch_secs();
        let expiry = leaderboard.current_partition(now);
        let partition = sort_partition(
            leaderboard.sort_order,
            self.storage().list_partition(leaderboard_id, expiry).await?,
        );

        let center = partition
            .iter()
            .position(|r| r.owner_id == owner_id)
            .ok_or_else(|| CoreError::NotFound(format!("record for {owner_id}")))?;

        let desired_better = limit + 1;
        let desired_worse = limit / 2 + 1;
        let desired = (desired_better + 1 + desired_worse).min(partition.len());

        let mut lo = center.saturating_sub(desired_better);
        let hi = (lo + desired).min(partition.len());
        if hi - lo < desired {
            lo = hi.saturating_sub(desired);
        }

        let page: Vec<LeaderboardRecord> = partition[lo..hi].to_vec();
        let page = self.rank_records(&leaderboard, expiry, page);

        let prev_cursor = (lo > 0).then(|| page.first().map(|r| LeaderboardCursor::before(leaderboard_id, expiry, r).encode())).flatten();
        let next_cursor = (hi < partition.len())
            .then(|| page.last().map(|r| LeaderboardCursor::after(leaderboard_id, expiry, r).encode()))
            .flatten();

        Ok((page, prev_cursor, next_cursor))
    }

    fn rank_records(&self, leaderboard: &Leaderboard, expiry: i64, records: Vec<LeaderboardRecord>) -> Vec<RankedRecord> {
        records
            .into_iter()
            .map(|record| {
                let rank = if leaderboard.enable_ranks {
                    self.rank_cache().get(&leaderboard.id, expiry, record.owner_id)
                } else {
                    0
                };
                RankedRecord { record, rank }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::Caller;
    use crate::leaderboard::{InMemoryLeaderboardStorage, Operator};
    use serde_json::Value as Json;

    async fn seeded(order: SortOrder) -> (std::sync::Arc<LeaderboardCache<InMemoryLeaderboardStorage>>, Vec<UserId>) {
        let cache = LeaderboardCache::new(InMemoryLeaderboardStorage::new());
        cache
            .create("lb", order, Operator::Set, None, false, false, true, Json::Null)
            .await
            .unwrap();
        let mut owners = Vec::new();
        for score in [10, 20, 30, 40, 50] {
            let owner = crate::ids::new_id();
            cache
                .write(Caller::Authoritative, "lb", owner, None, score, 0, None, None)
                .await
                .unwrap();
            owners.push(owner);
        }
        (cache, owners)
    }

    #[tokio::test]
    async fn list_records_pages_best_first() {
        let (cache, _owners) = seeded(SortOrder::Descending).await;
        let (page, prev, cursor) = cache.list_records("lb", 2, true, None).await.unwrap();
        assert_eq!(page.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![50, 40]);
        assert!(prev.is_none());
        assert!(cursor.is_some());

        let (page2, prev2, cursor2) = cache.list_records("lb", 2, true, cursor.as_deref()).await.unwrap();
        assert_eq!(page2.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![30, 20]);
        assert!(prev2.is_some());
        assert!(cursor2.is_some());

        let (page3, prev3, cursor3) = cache.list_records("lb", 2, true, cursor2.as_deref()).await.unwrap();
        assert_eq!(page3.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![10]);
        assert!(prev3.is_some());
        assert!(cursor3.is_none());
    }

    #[tokio::test]
    async fn backward_paging_flips_result_order_and_cursor_polarity() {
        let (cache, _owners) = seeded(SortOrder::Descending).await;

        let (page1, _prev1, cursor1) = cache.list_records("lb", 2, true, None).await.unwrap();
        assert_eq!(page1.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![50, 40]);

        let (page2, prev2, _cursor2) = cache.list_records("lb", 2, true, cursor1.as_deref()).await.unwrap();
        assert_eq!(page2.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![30, 20]);
        let prev2 = prev2.unwrap();

        // paging backward from page2's prev cursor returns page1, best-first.
        let (back, back_prev, back_next) = cache.list_records("lb", 2, false, Some(&prev2)).await.unwrap();
        assert_eq!(back.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![50, 40]);
        assert!(back_prev.is_none());
        assert!(back_next.is_some());
    }

    #[tokio::test]
    async fn cursor_minted_for_one_direction_is_rejected_in_the_other() {
        let (cache, _owners) = seeded(SortOrder::Descending).await;
        let (_page1, _prev1, cursor1) = cache.list_records("lb", 2, true, None).await.unwrap();
        let cursor1 = cursor1.unwrap();
        let result = cache.list_records("lb", 2, false, Some(&cursor1)).await;
        assert!(matches!(result, Err(CoreError::InvalidCursor(_))));
    }

    #[tokio::test]
    async fn haystack_centers_on_owner_with_trim() {
        let (cache, owners) = seeded(SortOrder::Descending).await;
        // owners[2] has score 30, the median; limit=1 wants 2 strictly
        // better, the owner, and 1 strictly worse.
        let (page, prev, next) = cache.haystack("lb", owners[2], 1).await.unwrap();
        assert_eq!(page.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![50, 40, 30, 20]);
        assert!(prev.is_none());
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn haystack_near_the_edge_extends_the_other_side() {
        let (cache, owners) = seeded(SortOrder::Descending).await;
        // owners[0] has the best score (50); there is nothing better than it.
        let (page, prev, next) = cache.haystack("lb", owners[0], 2).await.unwrap();
        assert_eq!(page.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![50, 40, 30, 20, 10]);
        assert!(prev.is_none());
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn haystack_window_is_asymmetric_away_from_partition_edges() {
        let cache = LeaderboardCache::new(InMemoryLeaderboardStorage::new());
        cache
            .create("lb", SortOrder::Descending, Operator::Set, None, false, false, true, Json::Null)
            .await
            .unwrap();
        let mut owners = Vec::new();
        for i in 0..10 {
            let owner = crate::ids::new_id();
            let score = (10 - i) * 10;
            cache
                .write(Caller::Authoritative, "lb", owner, None, score, 0, None, None)
                .await
                .unwrap();
            owners.push(owner);
        }

        // owners[5] sits dead center at score 50; limit=2 wants 3 strictly
        // better and 2 strictly worse, not a symmetric 2-and-2 split.
        let (page, _prev, _next) = cache.haystack("lb", owners[5], 2).await.unwrap();
        assert_eq!(
            page.iter().map(|r| r.record.score).collect::<Vec<_>>(),
            vec![90, 80, 70, 60, 50, 40]
        );
    }

    #[tokio::test]
    async fn list_records_by_owners_filters_and_preserves_order() {
        let (cache, owners) = seeded(SortOrder::Descending).await;
        let selected = vec![owners[4], owners[0]];
        let page = cache.list_records_by_owners("lb", &selected).await.unwrap();
        assert_eq!(page.iter().map(|r| r.record.score).collect::<Vec<_>>(), vec![50, 10]);
    }
}
