//! Retention policy for AUTO checkpoints (spec §4.4 "Retention"). Never
//! selects a manual, branch, or rollback checkpoint, and only ever
//! considers `Committed` records — a record already `Pending`/`Writing` is
//! mid-capture and a `Deleted`/`Expired` one is already gone.

use super::{CheckpointId, CheckpointKind, CheckpointRecord, CheckpointState};
use crate::config::RetentionConfig;
use chrono::Utc;

/// Returns the ids of AUTO checkpoints the retention pass should delete.
pub fn select_expired(records: &[CheckpointRecord], retention: &RetentionConfig, max_auto: usize) -> Vec<CheckpointId> {
    let now = Utc::now();
    let mut auto_committed: Vec<&CheckpointRecord> = records
        .iter()
        .filter(|r| r.kind == CheckpointKind::Auto && r.state == CheckpointState::Committed)
        .collect();
    auto_committed.sort_by_key(|r| r.created_at);

    let mut expired = Vec::new();
    let mut survivors: Vec<&CheckpointRecord> = Vec::new();

    // Hard age cutoff and the keep-all / thin-to-every-Nth window.
    let mut thinning_index = 0usize;
    for record in &auto_committed {
        let age = now.signed_duration_since(record.created_at);
        let age_days = age.num_days();
        let age_hours = age.num_hours();

        if age_days >= retention.max_age_days as i64 {
            expired.push(record.id);
            continue;
        }
        if age_hours < retention.keep_all_hours as i64 {
            survivors.push(record);
            continue;
        }
        // Beyond keep_all_hours but within max_age_days: keep every Nth.
        if retention.keep_every_nth <= 1 || thinning_index % retention.keep_every_nth == 0 {
            survivors.push(record);
        } else {
            expired.push(record.id);
        }
        thinning_index += 1;
    }

    // Hard cap: if still over max_auto, drop the oldest survivors first.
    if survivors.len() > max_auto {
        let overflow = survivors.len() - max_auto;
        for record in survivors.iter().take(overflow) {
            expired.push(record.id);
        }
    }

    expired
}
