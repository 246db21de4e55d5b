//! Plain entity structs persisted by the stores.
//!
//! # Design
//! - Enums round-trip through their lowercase wire names (`as_str` / `FromStr`).
//! - Unknown criterion operators are preserved rather than rejected so the matcher
//!   can treat them as "no match".

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DataError;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Stable lowercase name used in storage.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }
        }

        impl FromStr for $name {
            type Err = DataError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($wire => Ok(Self::$variant),)+
                    other => Err(DataError::decode($field, other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// How a monitored path hands files to cold storage.
    OperationMode, "operation_mode" {
        /// Relocate the file; the hot copy disappears.
        Move => "move",
        /// Duplicate the file; the hot copy stays.
        Copy => "copy",
        /// Relocate the file and leave a symlink at the hot path.
        Symlink => "symlink",
    }
}

wire_enum! {
    /// Storage tier an inventory entry currently lives on.
    StorageTier, "storage_tier" {
        /// Monitored source tree.
        Hot => "hot",
        /// A cold storage location.
        Cold => "cold",
    }
}

wire_enum! {
    /// Lifecycle status of an inventory entry.
    FileStatus, "status" {
        /// Observed during the last scan.
        Active => "active",
        /// Moved away by an operation.
        Moved => "moved",
        /// Removed on purpose.
        Deleted => "deleted",
        /// Not observed during the last full scan.
        Missing => "missing",
        /// Owned by a running relocation task.
        Migrating => "migrating",
    }
}

wire_enum! {
    /// Metadata attribute a criterion inspects.
    CriterionType, "criterion_type" {
        /// Modification time, in minutes of age.
        Mtime => "mtime",
        /// Access time, in minutes of age.
        Atime => "atime",
        /// Status-change time, in minutes of age.
        Ctime => "ctime",
        /// File size with an optional binary suffix.
        Size => "size",
        /// File name, case-sensitive.
        Name => "name",
        /// File name, case-insensitive.
        Iname => "iname",
        /// Entry type (`file`, `directory`, `symlink`).
        Type => "type",
        /// Permission bits.
        Perm => "perm",
        /// Owning user.
        User => "user",
        /// Owning group.
        Group => "group",
    }
}

wire_enum! {
    /// Outcome recorded on a monitored path after each scan attempt.
    ScanOutcome, "last_scan_outcome" {
        /// The scan ran to completion.
        Completed => "completed",
        /// The scan was refused because of a standing error.
        Failed => "failed",
        /// Another scan already held the path.
        Skipped => "skipped",
    }
}

/// Comparison applied by a criterion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CriterionOperator {
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `=`
    Eq,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// Substring match.
    Contains,
    /// Regular expression match.
    Regex,
    /// Glob match.
    Matches,
    /// Operator string this build does not understand.
    Unknown(String),
}

impl CriterionOperator {
    /// Stored representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Contains => "contains",
            Self::Regex => "regex",
            Self::Matches => "matches",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<&str> for CriterionOperator {
    fn from(value: &str) -> Self {
        match value {
            ">" => Self::Gt,
            "<" => Self::Lt,
            "=" => Self::Eq,
            ">=" => Self::Ge,
            "<=" => Self::Le,
            "contains" => Self::Contains,
            "regex" => Self::Regex,
            "matches" => Self::Matches,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for CriterionOperator {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl FromStr for CriterionOperator {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(value))
    }
}

impl From<CriterionOperator> for String {
    fn from(value: CriterionOperator) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CriterionOperator {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A directory tree watched by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredPath {
    /// Identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Root of the hot tree.
    pub source_path: PathBuf,
    /// How files leave the hot tree.
    pub operation_mode: OperationMode,
    /// Seconds between scheduled scans.
    pub check_interval_secs: u64,
    /// Whether scheduled scans run.
    pub enabled: bool,
    /// Ask indexers to skip the cold copies.
    pub prevent_indexing: bool,
    /// Sticky error set by the feasibility check.
    pub error_message: Option<String>,
    /// Associated cold locations in preference order.
    pub cold_location_ids: Vec<Uuid>,
    /// When the last scan attempt finished.
    pub last_scan_at: Option<DateTime<Utc>>,
    /// Outcome of the last scan attempt.
    pub last_scan_outcome: Option<ScanOutcome>,
}

impl MonitoredPath {
    /// New enabled path with no locations.
    #[must_use]
    pub fn new(name: impl Into<String>, source_path: impl Into<PathBuf>, mode: OperationMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source_path: source_path.into(),
            operation_mode: mode,
            check_interval_secs: 3600,
            enabled: true,
            prevent_indexing: false,
            error_message: None,
            cold_location_ids: Vec::new(),
            last_scan_at: None,
            last_scan_outcome: None,
        }
    }

    /// Scan interval as a duration.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Whether a scheduled scan is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        self.last_scan_at.is_none_or(|last| {
            (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.check_interval())
        })
    }
}

/// One keep-in-hot rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    /// Identifier.
    pub id: Uuid,
    /// Owning path.
    pub path_id: Uuid,
    /// Attribute inspected.
    pub criterion_type: CriterionType,
    /// Comparison applied.
    pub operator: CriterionOperator,
    /// Raw comparison value.
    pub value: String,
    /// Disabled criteria are ignored.
    pub enabled: bool,
}

impl Criterion {
    /// New enabled criterion.
    #[must_use]
    pub fn new(
        path_id: Uuid,
        criterion_type: CriterionType,
        operator: impl Into<CriterionOperator>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            path_id,
            criterion_type,
            operator: operator.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

/// A cold storage destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdStorageLocation {
    /// Identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Root directory.
    pub path: PathBuf,
    /// Operator toggle; unavailable locations are never routed to.
    pub is_available: bool,
    /// Payloads written here are encrypted.
    pub is_encrypted: bool,
    /// Free-space percentage at which a warning is logged.
    pub caution_threshold_percent: f64,
    /// Free-space percentage at or below which the location is rejected.
    pub critical_threshold_percent: f64,
}

impl ColdStorageLocation {
    /// New available, unencrypted location with 20%/10% thresholds.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path: path.into(),
            is_available: true,
            is_encrypted: false,
            caution_threshold_percent: 20.0,
            critical_threshold_percent: 10.0,
        }
    }
}

/// Canonical per-file inventory row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInventoryEntry {
    /// Identifier.
    pub id: Uuid,
    /// Owning path.
    pub path_id: Uuid,
    /// Absolute path of the file on its current tier.
    pub file_path: PathBuf,
    /// Current tier.
    pub storage_tier: StorageTier,
    /// Size in bytes.
    pub file_size: u64,
    /// Modification time.
    pub modified_at: DateTime<Utc>,
    /// Access time.
    pub accessed_at: DateTime<Utc>,
    /// Status-change time.
    pub changed_at: DateTime<Utc>,
    /// SHA-256 of the content when computed.
    pub checksum: Option<String>,
    /// Lifecycle status.
    pub status: FileStatus,
    /// Cold location holding the file, when cold.
    pub cold_location_id: Option<Uuid>,
    /// When a scan last observed the file.
    pub last_seen: DateTime<Utc>,
}

/// History of a completed hot-to-cold operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Identifier.
    pub id: Uuid,
    /// Owning path.
    pub path_id: Uuid,
    /// Hot path the file came from.
    pub original_path: PathBuf,
    /// Where the cold payload lives.
    pub cold_storage_path: PathBuf,
    /// Location holding the payload.
    pub cold_location_id: Option<Uuid>,
    /// Size of the original file.
    pub file_size: u64,
    /// Mode used for the operation.
    pub operation_mode: OperationMode,
    /// Criteria that were matched when the decision was made.
    pub criteria_matched: Vec<Uuid>,
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
}

/// A file excluded from automatic classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedFile {
    /// Identifier.
    pub id: Uuid,
    /// Owning path.
    pub path_id: Uuid,
    /// Pinned hot path.
    pub file_path: PathBuf,
    /// When the pin was created.
    pub pinned_at: DateTime<Utc>,
}

/// A failed operation against a cold location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    /// Identifier.
    pub id: Uuid,
    /// Location the operation targeted.
    pub location_id: Uuid,
    /// Owning path when known.
    pub path_id: Option<Uuid>,
    /// File involved.
    pub file_path: PathBuf,
    /// When the failure happened.
    pub occurred_at: DateTime<Utc>,
    /// Failure description.
    pub message: String,
}

/// Filter for inventory queries; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryFilter {
    /// Owning path.
    pub path_id: Option<Uuid>,
    /// Status.
    pub status: Option<FileStatus>,
    /// Tier.
    pub tier: Option<StorageTier>,
    /// Cold location.
    pub cold_location_id: Option<Uuid>,
}

impl InventoryFilter {
    /// Filter on a single path.
    #[must_use]
    pub fn for_path(path_id: Uuid) -> Self {
        Self {
            path_id: Some(path_id),
            ..Self::default()
        }
    }

    /// Restrict to a status.
    #[must_use]
    pub const fn with_status(mut self, status: FileStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to a tier.
    #[must_use]
    pub const fn with_tier(mut self, tier: StorageTier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Whether `entry` passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &FileInventoryEntry) -> bool {
        self.path_id.is_none_or(|id| id == entry.path_id)
            && self.status.is_none_or(|status| status == entry.status)
            && self.tier.is_none_or(|tier| tier == entry.storage_tier)
            && self
                .cold_location_id
                .is_none_or(|id| entry.cold_location_id == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn enums_round_trip_through_wire_names() -> Result<(), DataError> {
        for mode in [OperationMode::Move, OperationMode::Copy, OperationMode::Symlink] {
            assert_eq!(mode.as_str().parse::<OperationMode>()?, mode);
        }
        assert_eq!("migrating".parse::<FileStatus>()?, FileStatus::Migrating);
        assert!(matches!(
            "frozen".parse::<FileStatus>(),
            Err(DataError::Decode { field: "status", .. })
        ));
        Ok(())
    }

    #[test]
    fn unknown_operator_is_preserved() {
        let operator = CriterionOperator::from("~=");
        assert_eq!(operator, CriterionOperator::Unknown("~=".to_string()));
        assert_eq!(operator.as_str(), "~=");
        assert_eq!(CriterionOperator::from(">="), CriterionOperator::Ge);
        assert_eq!("regex".parse::<CriterionOperator>(), Ok(CriterionOperator::Regex));
        assert_eq!(
            "between".parse::<CriterionOperator>(),
            Ok(CriterionOperator::Unknown("between".to_string()))
        );
    }

    #[test]
    fn path_is_due_after_interval() {
        let now = Utc::now();
        let mut path = MonitoredPath::new("docs", "/srv/docs", OperationMode::Move);
        assert!(path.is_due(now));
        path.last_scan_at = Some(now - ChronoDuration::seconds(10));
        assert!(!path.is_due(now));
        path.last_scan_at = Some(now - ChronoDuration::hours(2));
        assert!(path.is_due(now));
        path.enabled = false;
        assert!(!path.is_due(now));
    }
}
