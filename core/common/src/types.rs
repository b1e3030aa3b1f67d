//! Common types used throughout the backup crates.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `strftime` pattern for dated backup folders (local time, minute resolution).
pub const FOLDER_NAME_FORMAT: &str = "%Y-%m-%dT%H%M";

/// Highest disambiguating suffix tried when a folder name is already taken.
pub const MAX_COLLISION_SUFFIX: u32 = 9;

/// Length of the timestamp part, e.g. `2024-01-31T0915`.
const STAMP_LEN: usize = 15;

/// Name of a dated backup folder.
///
/// Rendered as `YYYY-MM-DDTHHMM`, optionally followed by `-N` when a folder
/// for the same minute already exists on the provider. Names of the same
/// minute sort by suffix, and names of different minutes sort by time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderName {
    stamp: NaiveDateTime,
    suffix: Option<u32>,
}

impl FolderName {
    /// Folder name for the given instant, truncated to the minute in local time.
    pub fn at<Tz: TimeZone>(time: &DateTime<Tz>) -> Self {
        let local = time.with_timezone(&Local).naive_local();
        Self::from_naive(local)
    }

    /// Folder name for the current minute.
    pub fn now() -> Self {
        Self::at(&Local::now())
    }

    fn from_naive(stamp: NaiveDateTime) -> Self {
        // Round-trip through the format to drop seconds and below.
        let text = stamp.format(FOLDER_NAME_FORMAT).to_string();
        let stamp = NaiveDateTime::parse_from_str(&text, FOLDER_NAME_FORMAT).unwrap_or(stamp);
        Self {
            stamp,
            suffix: None,
        }
    }

    /// Same minute, with a disambiguating suffix.
    pub fn with_suffix(&self, suffix: u32) -> Self {
        Self {
            stamp: self.stamp,
            suffix: Some(suffix),
        }
    }

    /// Parse a folder name produced by this tool.
    ///
    /// Returns `None` for anything else, which lets providers ignore
    /// unrelated folders living next to the backups.
    pub fn parse(name: &str) -> Option<Self> {
        let stamp_text = name.get(..STAMP_LEN)?;
        let stamp = NaiveDateTime::parse_from_str(stamp_text, FOLDER_NAME_FORMAT).ok()?;

        let rest = &name[STAMP_LEN..];
        let suffix = if rest.is_empty() {
            None
        } else {
            let digits = rest.strip_prefix('-')?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some(digits.parse().ok()?)
        };

        Some(Self { stamp, suffix })
    }

    /// The local wall-clock minute this name encodes.
    pub fn stamp(&self) -> NaiveDateTime {
        self.stamp
    }

    /// Disambiguating suffix, if any.
    pub fn suffix(&self) -> Option<u32> {
        self.suffix
    }

    /// The encoded minute as a UTC instant.
    pub fn created_at(&self) -> DateTime<Utc> {
        match Local.from_local_datetime(&self.stamp).earliest() {
            Some(local) => local.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&self.stamp),
        }
    }
}

impl fmt::Display for FolderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stamp.format(FOLDER_NAME_FORMAT))?;
        if let Some(suffix) = self.suffix {
            write!(f, "-{}", suffix)?;
        }
        Ok(())
    }
}

/// Handle to a backup folder on a remote provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFolder {
    /// Provider-specific identifier (path, file ID, ...).
    pub id: String,
    /// Display name of the folder.
    pub name: String,
    /// When the folder was created.
    pub created_at: DateTime<Utc>,
}

impl BackupFolder {
    /// Create a new folder handle.
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at,
        }
    }

    /// Build a handle from a folder name, taking the creation time from the name.
    ///
    /// Returns `None` when `name` is not a backup folder name.
    pub fn from_name(id: impl Into<String>, name: &str) -> Option<Self> {
        let parsed = FolderName::parse(name)?;
        Some(Self::new(id, name, parsed.created_at()))
    }

    /// Key ordering folders from oldest to newest.
    ///
    /// Ties on creation time (same-minute folders) fall back to the name,
    /// which places suffixed folders after the unsuffixed one.
    pub fn age_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.name.as_str())
    }
}

impl fmt::Display for BackupFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn naive(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_folder_name_format() {
        let name = FolderName::from_naive(naive(2024, 1, 31, 9, 5, 42));
        assert_eq!(name.to_string(), "2024-01-31T0905");
        assert_eq!(name.with_suffix(2).to_string(), "2024-01-31T0905-2");
    }

    #[test]
    fn test_folder_name_drops_seconds() {
        let a = FolderName::from_naive(naive(2024, 1, 31, 9, 5, 1));
        let b = FolderName::from_naive(naive(2024, 1, 31, 9, 5, 59));
        assert_eq!(a, b);
    }

    #[test]
    fn test_folder_name_parse() {
        let name = FolderName::parse("2023-12-24T1830").unwrap();
        assert_eq!(name.stamp(), naive(2023, 12, 24, 18, 30, 0));
        assert_eq!(name.suffix(), None);

        let suffixed = FolderName::parse("2023-12-24T1830-3").unwrap();
        assert_eq!(suffixed.suffix(), Some(3));
    }

    #[test]
    fn test_folder_name_parse_rejects_foreign_names() {
        assert!(FolderName::parse("Photos").is_none());
        assert!(FolderName::parse("meldanya_backup").is_none());
        assert!(FolderName::parse("2023-12-24").is_none());
        assert!(FolderName::parse("2023-12-24T1830-").is_none());
        assert!(FolderName::parse("2023-12-24T1830x").is_none());
        assert!(FolderName::parse("2023-12-24T1830-a").is_none());
        assert!(FolderName::parse("2023-13-24T1830").is_none());
    }

    #[test]
    fn test_backup_folder_from_name() {
        assert!(BackupFolder::from_name("/x", "notes").is_none());

        let folder = BackupFolder::from_name("/2023-12-24T1830", "2023-12-24T1830").unwrap();
        assert_eq!(folder.id, "/2023-12-24T1830");
        assert_eq!(folder.name, "2023-12-24T1830");
    }

    #[test]
    fn test_age_key_orders_suffixes_after_base() {
        let base = BackupFolder::from_name("a", "2023-12-24T1830").unwrap();
        let second = BackupFolder::from_name("b", "2023-12-24T1830-1").unwrap();
        let later = BackupFolder::from_name("c", "2023-12-24T1831").unwrap();

        assert!(base.age_key() < second.age_key());
        assert!(second.age_key() < later.age_key());
    }

    proptest! {
        #[test]
        fn prop_name_order_matches_time_order(a in 0i64..4_000_000_000, b in 0i64..4_000_000_000) {
            let ta = DateTime::from_timestamp(a, 0).unwrap().naive_utc();
            let tb = DateTime::from_timestamp(b, 0).unwrap().naive_utc();
            let na = FolderName::from_naive(ta);
            let nb = FolderName::from_naive(tb);

            prop_assert_eq!(FolderName::parse(&na.to_string()), Some(na));
            prop_assert_eq!(na.to_string().cmp(&nb.to_string()), na.stamp().cmp(&nb.stamp()));
        }
    }
}
