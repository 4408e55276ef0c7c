//! Usage ledger
//!
//! Append-only record of admitted requests, plus the windowed counts and
//! aggregates built from it. Quota counters are never stored separately:
//! they are always a count over this ledger, so they cannot drift.
//!
//! Windows are UTC calendar windows: a day runs from 00:00:00 UTC to the
//! next midnight, a month from the first of the month to the first of the
//! next. All ranges are half-open, `[start, end)`.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use std::time::Duration as StdDuration;
use uuid::Uuid;

use crate::models::{DailyCount, EndpointStats, NewUsageEvent, TopUser, UsageEvent};
use crate::store::{bounded, SharedStore, StoreResult, DEFAULT_STORAGE_TIMEOUT};

/// Cap on rows returned by [`UsageLedger::list_recent`]
pub const MAX_RECENT_EVENTS: i64 = 1000;

/// UTC day containing `now`
pub fn day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = midnight(now.date_naive());
    (start, start + Duration::days(1))
}

/// UTC calendar month containing `now`
pub fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let first = now.date_naive() - Duration::days(i64::from(now.day0()));
    let next = first
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX);
    (midnight(first), midnight(next))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

#[derive(Clone)]
pub struct UsageLedger {
    store: SharedStore,
    timeout: StdDuration,
}

impl UsageLedger {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Appends one event
    pub async fn record(&self, event: NewUsageEvent) -> StoreResult<UsageEvent> {
        bounded(self.timeout, self.store.append_usage(event)).await
    }

    /// Events for `user_id` with `start <= timestamp < end`
    pub async fn count_in_window(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let count = bounded(self.timeout, self.store.count_usage(Some(user_id), start, end)).await?;
        Ok(count.max(0) as u64)
    }

    /// Platform-wide events in the UTC day containing `now`
    pub async fn count_today(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let (start, end) = day_bounds(now);
        let count = bounded(self.timeout, self.store.count_usage(None, start, end)).await?;
        Ok(count.max(0) as u64)
    }

    /// A user's events since `since`, newest first, at most `limit`
    pub async fn list_recent(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<UsageEvent>> {
        let limit = limit.clamp(0, MAX_RECENT_EVENTS);
        bounded(self.timeout, self.store.recent_usage(user_id, since, limit)).await
    }

    /// Platform-wide events per UTC day since `since`
    pub async fn aggregate_by_day(&self, since: DateTime<Utc>) -> StoreResult<Vec<DailyCount>> {
        bounded(self.timeout, self.store.usage_by_day(since)).await
    }

    /// A user's count and mean latency per endpoint since `since`
    pub async fn aggregate_by_endpoint(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EndpointStats>> {
        bounded(self.timeout, self.store.usage_by_endpoint(user_id, since)).await
    }

    /// Busiest users since `since`
    pub async fn top_users(&self, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<TopUser>> {
        bounded(self.timeout, self.store.top_users(since, limit.max(0))).await
    }
}
