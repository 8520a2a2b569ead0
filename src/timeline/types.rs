use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::models::{PlayoutAnchorRow, PlayoutAnchorUpdate};

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("schedule has no items")]
    EmptySchedule,
    #[error("invalid fixed_start_time on schedule item {schedule_item_id}: {reason}")]
    InvalidFixedStart { schedule_item_id: i32, reason: String },
}

/// A candidate piece of media a collection resolver hands the builder,
/// already stripped down to what the algorithm needs: an identity, a
/// display title, and a runtime.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub media_item_id: i32,
    pub title: String,
    pub duration: chrono::Duration,
}

/// A fully-specified item in the output timeline. Mirrors
/// [`crate::db::models::NewPlayoutItem`] but carries typed timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayoutItem {
    pub schedule_item_id: Option<i32>,
    pub media_item_id: Option<i32>,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub filler_kind: Option<String>,
}

/// The persisted playout cursor: where the next build should pick up.
/// Mirrors [`PlayoutAnchorRow`] with a typed timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub next_start: DateTime<Utc>,
    pub schedule_index: i32,
    pub collection_cursor: Option<String>,
    pub shuffle_epoch: i32,
}

impl Anchor {
    pub fn from_row(row: &PlayoutAnchorRow) -> Self {
        Self {
            next_start: parse_timestamp(&row.next_start).unwrap_or_else(Utc::now),
            schedule_index: row.schedule_index,
            collection_cursor: row.collection_cursor.clone(),
            shuffle_epoch: row.shuffle_epoch,
        }
    }

    pub fn to_update(&self) -> PlayoutAnchorUpdate {
        PlayoutAnchorUpdate {
            next_start: self.next_start.to_rfc3339(),
            schedule_index: self.schedule_index,
            collection_cursor: self.collection_cursor.clone(),
            shuffle_epoch: self.shuffle_epoch,
        }
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Non-fatal conditions surfaced alongside a successful build.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildIssue {
    EmptyCollection { schedule_item_id: i32 },
    FullCycleExhausted,
}

/// The tagged result of a build pass. Never a bare `Result` — a build can
/// make partial progress worth keeping (`Warn`) distinct from having made no
/// progress at all (`Fail`).
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Ok(Vec<PlayoutItem>, Anchor),
    Warn(Vec<PlayoutItem>, Anchor, Vec<BuildIssue>),
    Fail(String),
}

impl BuildOutcome {
    pub fn items(&self) -> &[PlayoutItem] {
        match self {
            BuildOutcome::Ok(items, _) => items,
            BuildOutcome::Warn(items, _, _) => items,
            BuildOutcome::Fail(_) => &[],
        }
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        match self {
            BuildOutcome::Ok(_, anchor) => Some(anchor),
            BuildOutcome::Warn(_, anchor, _) => Some(anchor),
            BuildOutcome::Fail(_) => None,
        }
    }
}
