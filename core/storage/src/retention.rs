//! Retention window selection.

use meldanya_common::BackupFolder;

/// Number of backup folders kept per provider unless configured otherwise.
pub const DEFAULT_KEEP_COUNT: usize = 5;

/// Pick the folders that fall outside a retention window of `keep`.
///
/// Folders are ordered oldest first by creation time (name breaks ties), so
/// the input order does not matter. Returns the `max(0, n - keep)` oldest
/// folders, oldest first.
pub fn select_expired(mut folders: Vec<BackupFolder>, keep: usize) -> Vec<BackupFolder> {
    folders.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
    let expired = folders.len().saturating_sub(keep);
    folders.truncate(expired);
    folders
}
