//! Per-stream retention metadata, stored as the latest `$metadata` event of
//! the stream's metastream.
//!
//! ```json
//! {"$maxCount": 10, "$maxAge": 3600, "$tb": 5, "$tmp": false}
//! ```
//!
//! Unknown keys are ignored. A body that is not valid JSON reads as empty
//! metadata, so a bad metadata write never blocks reads of the stream.
//! Negative `$maxCount` and `$maxAge` values are dropped on parse, and an
//! age too large to subtract from the clock never expires.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::observability::Logger;
use crate::tlog::record::DELETED_STREAM;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,
    /// Seconds
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,
    #[serde(rename = "$tmp", default, skip_serializing_if = "Option::is_none")]
    pub temp_stream: Option<bool>,
}

impl StreamMetadata {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_max_count(max_count: i64) -> Self {
        Self {
            max_count: Some(max_count),
            ..Self::default()
        }
    }

    /// Metadata written by a soft delete
    pub fn soft_deleted(temp_stream: bool) -> Self {
        Self {
            truncate_before: Some(DELETED_STREAM),
            temp_stream: temp_stream.then_some(true),
            ..Self::default()
        }
    }

    /// Parse a metadata event body. Invalid bodies are logged and read as
    /// empty metadata.
    pub fn from_json(stream: &str, data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::empty();
        }
        match serde_json::from_slice::<Self>(data) {
            Ok(metadata) => metadata.without_negative_limits(stream),
            Err(e) => {
                Logger::warn(
                    "STREAM_METADATA_INVALID",
                    &[("stream", stream), ("error", &e.to_string())],
                );
                Self::empty()
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    fn without_negative_limits(mut self, stream: &str) -> Self {
        if let Some(max_count) = self.max_count.filter(|v| *v < 0) {
            Logger::warn(
                "STREAM_METADATA_IGNORED",
                &[("stream", stream), ("key", "$maxCount"), ("value", &max_count.to_string())],
            );
            self.max_count = None;
        }
        if let Some(max_age) = self.max_age.filter(|v| *v < 0) {
            Logger::warn(
                "STREAM_METADATA_IGNORED",
                &[("stream", stream), ("key", "$maxAge"), ("value", &max_age.to_string())],
            );
            self.max_age = None;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.truncate_before == Some(DELETED_STREAM)
    }

    pub fn is_temp_stream(&self) -> bool {
        self.temp_stream.unwrap_or(false)
    }

    /// `None` when unset, negative, or beyond the range of `Duration`
    pub fn max_age_duration(&self) -> Option<Duration> {
        self.max_age
            .filter(|secs| *secs >= 0)
            .and_then(Duration::try_seconds)
    }

    /// Events written before the returned instant have expired
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age_duration()
            .and_then(|max_age| now.checked_sub_signed(max_age))
    }

    pub fn is_expired(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expiry_cutoff(now).is_some_and(|cutoff| timestamp < cutoff)
    }

    /// Whether `event_number` falls outside the last `$maxCount` events
    pub fn is_past_max_count(&self, event_number: i64, last_event_number: i64) -> bool {
        event_number < self.max_count_floor(last_event_number)
    }

    fn max_count_floor(&self, last_event_number: i64) -> i64 {
        match self.max_count.filter(|max| *max >= 0) {
            Some(max_count) => last_event_number
                .saturating_sub(max_count)
                .saturating_add(1),
            None => i64::MIN,
        }
    }

    /// Lowest event number still visible given `last_event_number`; the
    /// most restrictive of `$maxCount` and `$tb` wins
    pub fn first_visible_event(&self, last_event_number: i64) -> i64 {
        let mut first = 0i64.max(self.max_count_floor(last_event_number));
        if let Some(tb) = self.truncate_before {
            first = first.max(tb);
        }
        first
    }
}
