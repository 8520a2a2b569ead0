//! C4: deterministically turns a schedule plus an anchor into an ordered,
//! finite prefix of playout items.

pub mod builder;
pub mod types;

pub use builder::TimelineBuilder;
pub use types::{parse_timestamp, Anchor, BuildIssue, BuildOutcome, Candidate, PlayoutItem, TimelineError};
