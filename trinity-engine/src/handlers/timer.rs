//! ABOUTME: timer handler: persist a fire-at instant and suspend

use super::StepOutcome;
use chrono::Utc;
use trinity_core::AwaitKind;

pub(super) fn run(duration_seconds: u64) -> StepOutcome {
    let fire_at = Utc::now()
        + chrono::Duration::seconds(i64::try_from(duration_seconds).unwrap_or(i64::MAX));
    StepOutcome::Awaiting {
        awaiting: AwaitKind::Timer,
        wake_at: Some(fire_at),
    }
}
