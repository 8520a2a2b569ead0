//! The item-resolution algorithm itself. Pure and DB-free: callers supply
//! already-materialized candidates via closures so this module's tests never
//! need a database, which is what lets the determinism properties in
//! SPEC_FULL.md §8 be checked with plain unit tests.

use chrono::Duration as ChronoDuration;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::clock::Clock;
use crate::db::models::ScheduleItem;

use super::types::{Anchor, BuildIssue, BuildOutcome, Candidate, PlayoutItem};

/// Items with zero or negative runtime would spin the emission loops
/// forever; anything that slips through resolution with no duration gets
/// this instead. 30 minutes matches the teacher's placeholder-programme
/// block length in the old XMLTV writer.
const FALLBACK_ITEM_DURATION_SECONDS: i64 = 1800;

pub struct TimelineBuilder;

impl TimelineBuilder {
    /// Build a prefix of the timeline starting at `anchor.next_start` and
    /// extending to (but not past) `anchor.next_start + horizon`.
    ///
    /// `resolve_collection` materializes and returns the (unordered)
    /// candidates for a `(collection_type, collection_ref)` pair.
    /// `resolve_filler` looks up a single media item by id, used for
    /// pre/mid/post/tail/fallback fillers.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        channel_id: i32,
        schedule_items: &[ScheduleItem],
        anchor: &Anchor,
        horizon: ChronoDuration,
        clock: &dyn Clock,
        resolve_collection: &mut dyn FnMut(&str, &str) -> Vec<Candidate>,
        resolve_filler: &mut dyn FnMut(i32) -> Option<Candidate>,
    ) -> BuildOutcome {
        let _ = clock; // reserved for callers that need "now" for logging; the algorithm itself only consumes anchor.next_start
        if schedule_items.is_empty() {
            return BuildOutcome::Fail("schedule has no items".to_string());
        }

        let n = schedule_items.len() as i32;
        let horizon_end = anchor.next_start + horizon;

        let mut schedule_index = anchor.schedule_index.rem_euclid(n);
        let mut epoch = anchor.shuffle_epoch;
        let mut cursor = anchor.next_start;
        let mut items: Vec<PlayoutItem> = Vec::new();
        let mut issues: Vec<BuildIssue> = Vec::new();
        let mut cycles_without_progress = 0i32;

        while cursor < horizon_end {
            if cycles_without_progress >= n {
                issues.push(BuildIssue::FullCycleExhausted);
                items.push(PlayoutItem {
                    schedule_item_id: None,
                    media_item_id: None,
                    title: "Off Air".to_string(),
                    start_time: cursor,
                    finish_time: horizon_end,
                    filler_kind: Some("offline".to_string()),
                });
                cursor = horizon_end;
                break;
            }

            let item = &schedule_items[schedule_index as usize];

            if item.start_type == "fixed" {
                match resolve_fixed_start(item, cursor) {
                    FixedStartOutcome::Proceed => {}
                    FixedStartOutcome::Wait(target) => {
                        if let Some(filler_id) = item.tail_filler_id {
                            if let Some(filler) = resolve_filler(filler_id) {
                                let finish = (cursor + normalize_duration(filler.duration)).min(target);
                                items.push(PlayoutItem {
                                    schedule_item_id: Some(item.id),
                                    media_item_id: Some(filler.media_item_id),
                                    title: filler.title,
                                    start_time: cursor,
                                    finish_time: finish,
                                    filler_kind: Some("tail".to_string()),
                                });
                                cursor = finish;
                                continue;
                            }
                        }
                        cursor = target;
                    }
                    FixedStartOutcome::Skip => {
                        schedule_index = advance_index(schedule_index, n, &mut epoch);
                        cycles_without_progress += 1;
                        continue;
                    }
                    FixedStartOutcome::Invalid(reason) => {
                        return BuildOutcome::Fail(format!(
                            "invalid fixed_start_time on schedule item {}: {reason}",
                            item.id
                        ));
                    }
                }
            }

            let raw_candidates = resolve_collection(&item.collection_type, &item.collection_ref);
            if raw_candidates.is_empty() {
                issues.push(BuildIssue::EmptyCollection { schedule_item_id: item.id });
                schedule_index = advance_index(schedule_index, n, &mut epoch);
                cycles_without_progress += 1;
                continue;
            }

            let ordered = order_candidates(raw_candidates, item, channel_id, epoch);

            if let Some(filler_id) = item.pre_roll_filler_id {
                if let Some(filler) = resolve_filler(filler_id) {
                    let finish = cursor + normalize_duration(filler.duration);
                    items.push(PlayoutItem {
                        schedule_item_id: Some(item.id),
                        media_item_id: Some(filler.media_item_id),
                        title: filler.title,
                        start_time: cursor,
                        finish_time: finish,
                        filler_kind: Some("pre_roll".to_string()),
                    });
                    cursor = finish;
                }
            }

            let remaining_budget = horizon_end - cursor;
            let emitted = match item.playback_mode.as_str() {
                "multiple" => emit_count(&ordered, item.playback_mode_count.unwrap_or(1).max(1) as usize),
                "duration" => emit_for_duration(
                    &ordered,
                    ChronoDuration::seconds(item.playback_mode_duration_seconds.unwrap_or(0) as i64),
                ),
                "flood" => emit_for_duration(&ordered, remaining_budget),
                _ => emit_count(&ordered, 1),
            };

            if emitted.is_empty() {
                issues.push(BuildIssue::EmptyCollection { schedule_item_id: item.id });
                schedule_index = advance_index(schedule_index, n, &mut epoch);
                cycles_without_progress += 1;
                continue;
            }
            cycles_without_progress = 0;

            let mut since_mid_roll = ChronoDuration::zero();
            for candidate in emitted {
                let duration = normalize_duration(candidate.duration);
                let finish = cursor + duration;
                items.push(PlayoutItem {
                    schedule_item_id: Some(item.id),
                    media_item_id: Some(candidate.media_item_id),
                    title: candidate.title,
                    start_time: cursor,
                    finish_time: finish,
                    filler_kind: None,
                });
                cursor = finish;
                since_mid_roll = since_mid_roll + duration;

                if let (Some(freq), Some(filler_id)) =
                    (item.mid_roll_frequency_seconds, item.mid_roll_filler_id)
                {
                    if freq > 0 && since_mid_roll >= ChronoDuration::seconds(freq as i64) {
                        if let Some(filler) = resolve_filler(filler_id) {
                            let finish = cursor + normalize_duration(filler.duration);
                            items.push(PlayoutItem {
                                schedule_item_id: Some(item.id),
                                media_item_id: Some(filler.media_item_id),
                                title: filler.title,
                                start_time: cursor,
                                finish_time: finish,
                                filler_kind: Some("mid_roll".to_string()),
                            });
                            cursor = finish;
                        }
                        since_mid_roll = ChronoDuration::zero();
                    }
                }

                if cursor >= horizon_end {
                    break;
                }
            }

            if let Some(filler_id) = item.post_roll_filler_id {
                if let Some(filler) = resolve_filler(filler_id) {
                    let finish = cursor + normalize_duration(filler.duration);
                    items.push(PlayoutItem {
                        schedule_item_id: Some(item.id),
                        media_item_id: Some(filler.media_item_id),
                        title: filler.title,
                        start_time: cursor,
                        finish_time: finish,
                        filler_kind: Some("post_roll".to_string()),
                    });
                    cursor = finish;
                }
            }

            schedule_index = advance_index(schedule_index, n, &mut epoch);
        }

        if items.is_empty() {
            return BuildOutcome::Fail("no items produced within the requested horizon".to_string());
        }

        let new_anchor = Anchor {
            next_start: cursor,
            schedule_index,
            collection_cursor: items
                .last()
                .and_then(|item| item.media_item_id)
                .map(|id| id.to_string()),
            shuffle_epoch: epoch,
        };

        if issues.is_empty() {
            BuildOutcome::Ok(items, new_anchor)
        } else {
            BuildOutcome::Warn(items, new_anchor, issues)
        }
    }
}

fn advance_index(current: i32, n: i32, epoch: &mut i32) -> i32 {
    let next = (current + 1) % n;
    if next == 0 {
        *epoch += 1;
    }
    next
}

fn normalize_duration(duration: ChronoDuration) -> ChronoDuration {
    if duration <= ChronoDuration::zero() {
        ChronoDuration::seconds(FALLBACK_ITEM_DURATION_SECONDS)
    } else {
        duration
    }
}

enum FixedStartOutcome {
    Proceed,
    Wait(chrono::DateTime<chrono::Utc>),
    Skip,
    Invalid(String),
}

fn resolve_fixed_start(item: &ScheduleItem, cursor: chrono::DateTime<chrono::Utc>) -> FixedStartOutcome {
    let Some(fixed_str) = &item.fixed_start_time else {
        return FixedStartOutcome::Proceed;
    };
    let Some(target) = super::types::parse_timestamp(fixed_str) else {
        return FixedStartOutcome::Invalid(format!("could not parse '{fixed_str}' as RFC3339"));
    };

    if cursor < target {
        match item.fixed_start_behavior.as_deref() {
            Some("start_immediately") => FixedStartOutcome::Proceed,
            _ => FixedStartOutcome::Wait(target),
        }
    } else if cursor > target {
        match item.fixed_start_behavior.as_deref() {
            Some("skip_item") => FixedStartOutcome::Skip,
            _ => FixedStartOutcome::Proceed,
        }
    } else {
        FixedStartOutcome::Proceed
    }
}

/// Deterministic seed so the same `(channel_id, schedule_item_id, epoch)`
/// always shuffles identically, satisfying the determinism requirement
/// without any OS-entropy or thread-local RNG in this path.
fn shuffle_seed(channel_id: i32, schedule_item_id: i32, epoch: i32) -> u64 {
    let mut seed = 0xcbf29ce484222325u64; // FNV offset basis
    for part in [channel_id as i64, schedule_item_id as i64, epoch as i64] {
        for byte in part.to_le_bytes() {
            seed ^= byte as u64;
            seed = seed.wrapping_mul(0x100000001b3);
        }
    }
    seed
}

fn order_candidates(
    mut candidates: Vec<Candidate>,
    item: &ScheduleItem,
    channel_id: i32,
    epoch: i32,
) -> Vec<Candidate> {
    match item.playback_order.as_str() {
        "shuffle" | "random" => {
            let mut rng = StdRng::seed_from_u64(shuffle_seed(channel_id, item.id, epoch));
            candidates.shuffle(&mut rng);
            candidates
        }
        _ => {
            candidates.sort_by_key(|c| c.media_item_id);
            candidates
        }
    }
}

fn emit_count(ordered: &[Candidate], count: usize) -> Vec<Candidate> {
    if ordered.is_empty() {
        return Vec::new();
    }
    (0..count).map(|i| ordered[i % ordered.len()].clone()).collect()
}

fn emit_for_duration(ordered: &[Candidate], target: ChronoDuration) -> Vec<Candidate> {
    if ordered.is_empty() || target <= ChronoDuration::zero() {
        return Vec::new();
    }
    let mut emitted = Vec::new();
    let mut cumulative = ChronoDuration::zero();
    let mut i = 0usize;
    // Safety valve: never emit more than a few schedule-cycles' worth in one
    // pass even if every candidate has a degenerate (near-zero) duration.
    let max_items = ordered.len() * 10_000 + 1;
    while cumulative < target && emitted.len() < max_items {
        let candidate = ordered[i % ordered.len()].clone();
        cumulative = cumulative + normalize_duration(candidate.duration);
        emitted.push(candidate);
        i += 1;
    }
    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn schedule_item(id: i32, mode: &str) -> ScheduleItem {
        ScheduleItem {
            id,
            schedule_id: 1,
            position: id,
            collection_type: "playlist".to_string(),
            collection_ref: "lib-1".to_string(),
            playback_mode: mode.to_string(),
            playback_mode_count: Some(2),
            playback_mode_duration_seconds: Some(3600),
            playback_order: "sequential".to_string(),
            start_type: "sequential".to_string(),
            fixed_start_time: None,
            fixed_start_behavior: None,
            pre_roll_filler_id: None,
            mid_roll_filler_id: None,
            mid_roll_frequency_seconds: None,
            post_roll_filler_id: None,
            tail_filler_id: None,
            fallback_filler_id: None,
        }
    }

    fn candidates(n: i32) -> Vec<Candidate> {
        (1..=n)
            .map(|id| Candidate {
                media_item_id: id,
                title: format!("Item {id}"),
                duration: ChronoDuration::minutes(30),
            })
            .collect()
    }

    fn anchor_at(t: chrono::DateTime<chrono::Utc>) -> Anchor {
        Anchor {
            next_start: t,
            schedule_index: 0,
            collection_cursor: None,
            shuffle_epoch: 0,
        }
    }

    #[test]
    fn one_mode_emits_exactly_one_item_per_visit() {
        let t0 = t0();
        let clock = FixedClock(t0);
        let items = vec![schedule_item(1, "one")];
        let anchor = anchor_at(t0);
        let outcome = TimelineBuilder::build(
            1,
            &items,
            &anchor,
            ChronoDuration::hours(2),
            &clock,
            &mut |_, _| candidates(3),
            &mut |_| None,
        );
        let built = outcome.items();
        assert!(!built.is_empty());
        assert_eq!(built[0].start_time, t0);
        assert_eq!(built[0].finish_time, t0 + ChronoDuration::minutes(30));
    }

    #[test]
    fn items_are_contiguous_with_no_gaps_or_overlaps() {
        let t0 = t0();
        let clock = FixedClock(t0);
        let items = vec![schedule_item(1, "multiple")];
        let anchor = anchor_at(t0);
        let outcome = TimelineBuilder::build(
            1,
            &items,
            &anchor,
            ChronoDuration::hours(4),
            &clock,
            &mut |_, _| candidates(5),
            &mut |_| None,
        );
        let built = outcome.items();
        for pair in built.windows(2) {
            assert_eq!(pair[0].finish_time, pair[1].start_time);
        }
    }

    #[test]
    fn determinism_same_inputs_same_output() {
        let t0 = t0();
        let clock = FixedClock(t0);
        let mut items = vec![schedule_item(1, "multiple")];
        items[0].playback_order = "shuffle".to_string();
        let anchor = anchor_at(t0);

        let run = || {
            TimelineBuilder::build(
                7,
                &items,
                &anchor,
                ChronoDuration::hours(3),
                &clock,
                &mut |_, _| candidates(6),
                &mut |_| None,
            )
        };
        let a = run();
        let b = run();
        assert_eq!(a.items(), b.items());
    }

    #[test]
    fn empty_collection_emits_warning_and_advances() {
        let t0 = t0();
        let clock = FixedClock(t0);
        let items = vec![schedule_item(1, "one"), schedule_item(2, "one")];
        let anchor = anchor_at(t0);
        let outcome = TimelineBuilder::build(
            1,
            &items,
            &anchor,
            ChronoDuration::hours(2),
            &clock,
            &mut |_, collection_ref| if collection_ref == "lib-1" { Vec::new() } else { candidates(2) },
            &mut |_| None,
        );
        match outcome {
            BuildOutcome::Warn(built, _, issues) => {
                assert!(!built.is_empty());
                assert!(issues.iter().any(|i| matches!(i, BuildIssue::EmptyCollection { .. })));
            }
            other => panic!("expected Warn, got {other:?}"),
        }
    }

    #[test]
    fn full_cycle_exhaustion_produces_offline_fallback() {
        let t0 = t0();
        let clock = FixedClock(t0);
        let items = vec![schedule_item(1, "one")];
        let anchor = anchor_at(t0);
        let outcome = TimelineBuilder::build(
            1,
            &items,
            &anchor,
            ChronoDuration::hours(1),
            &clock,
            &mut |_, _| Vec::new(),
            &mut |_| None,
        );
        match outcome {
            BuildOutcome::Warn(built, anchor, issues) => {
                assert!(issues.contains(&BuildIssue::FullCycleExhausted));
                assert_eq!(built.last().unwrap().filler_kind.as_deref(), Some("offline"));
                assert_eq!(anchor.next_start, t0 + ChronoDuration::hours(1));
            }
            other => panic!("expected Warn with offline fallback, got {other:?}"),
        }
    }

    #[test]
    fn new_anchor_next_start_matches_last_item_finish() {
        let t0 = t0();
        let clock = FixedClock(t0);
        let items = vec![schedule_item(1, "multiple")];
        let anchor = anchor_at(t0);
        let outcome = TimelineBuilder::build(
            1,
            &items,
            &anchor,
            ChronoDuration::hours(1),
            &clock,
            &mut |_, _| candidates(4),
            &mut |_| None,
        );
        let built = outcome.items().to_vec();
        let new_anchor = outcome.anchor().unwrap().clone();
        assert_eq!(new_anchor.next_start, built.last().unwrap().finish_time);
    }

    fn t0() -> chrono::DateTime<chrono::Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }
}
