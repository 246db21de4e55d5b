//! Keep-in-hot rule evaluation.
//!
//! # Design
//! - Criteria describe what must hold for a file to stay hot; all enabled criteria
//!   must match, and an empty or fully disabled set keeps nothing.
//! - Unparsable values, invalid patterns, and unknown operators never error; they
//!   simply fail to match, which pushes the file towards cold storage.
//! - Access time comes from a pluggable [`AccessTimeSource`]; a source that reports
//!   [`AccessTime::NeverOpened`] makes the file infinitely old.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use globset::GlobBuilder;
use regex::RegexBuilder;
use tierkeep_data::{Criterion, CriterionOperator, CriterionType};
use tierkeep_fsops::{EntryKind, FileSnapshot, parse_octal_mode, resolve_group, resolve_user};
use uuid::Uuid;

/// Tolerance applied to `=` on time criteria.
const TIME_EQUALITY_TOLERANCE_SECS: f64 = 30.0;

/// Effective last-access signal for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTime {
    /// Last accessed at the given instant.
    At(DateTime<Utc>),
    /// The platform reports the file was never opened by a user.
    NeverOpened,
}

/// Strategy for determining when a file was last genuinely accessed.
pub trait AccessTimeSource: Send + Sync {
    /// Access signal for `snapshot`.
    fn access_time(&self, snapshot: &FileSnapshot) -> AccessTime;
}

/// Uses the raw filesystem atime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawAccessTime;

impl AccessTimeSource for RawAccessTime {
    fn access_time(&self, snapshot: &FileSnapshot) -> AccessTime {
        AccessTime::At(snapshot.accessed)
    }
}

/// Combines raw atime with a "last opened" signal, taking the more recent of the two.
///
/// The lookup returns `None` when no signal is available for the file (raw atime is
/// used) and `Some(None)` when the platform says the file was never opened.
pub struct LastOpenedAccessTime<F> {
    lookup: F,
}

impl<F> LastOpenedAccessTime<F>
where
    F: Fn(&Path) -> Option<Option<DateTime<Utc>>> + Send + Sync,
{
    /// Wrap a last-opened lookup.
    pub const fn new(lookup: F) -> Self {
        Self { lookup }
    }
}

impl<F> AccessTimeSource for LastOpenedAccessTime<F>
where
    F: Fn(&Path) -> Option<Option<DateTime<Utc>>> + Send + Sync,
{
    fn access_time(&self, snapshot: &FileSnapshot) -> AccessTime {
        match (self.lookup)(&snapshot.path) {
            None => AccessTime::At(snapshot.accessed),
            Some(None) => AccessTime::NeverOpened,
            Some(Some(opened)) => AccessTime::At(opened.max(snapshot.accessed)),
        }
    }
}

/// Outcome of evaluating a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Evaluation {
    /// Whether the file should stay in (or return to) hot storage.
    pub keep_in_hot: bool,
    /// Enabled criterion ids, populated only when every one matched.
    pub matched: Vec<Uuid>,
}

impl Evaluation {
    const fn move_to_cold() -> Self {
        Self {
            keep_in_hot: false,
            matched: Vec::new(),
        }
    }
}

/// Evaluates file metadata against a path's criteria.
#[derive(Clone)]
pub struct CriteriaMatcher {
    access: Arc<dyn AccessTimeSource>,
}

impl std::fmt::Debug for CriteriaMatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("CriteriaMatcher").finish_non_exhaustive()
    }
}

impl Default for CriteriaMatcher {
    fn default() -> Self {
        Self::new(Arc::new(RawAccessTime))
    }
}

impl CriteriaMatcher {
    /// Matcher using the given access-time strategy.
    #[must_use]
    pub fn new(access: Arc<dyn AccessTimeSource>) -> Self {
        Self { access }
    }

    /// Evaluate `file` (with its resolved symlink `target`, if any) against `criteria`.
    ///
    /// Name criteria use `file`'s name; every other criterion reads the target's
    /// metadata when one is given.
    #[must_use]
    pub fn evaluate(
        &self,
        file: &FileSnapshot,
        target: Option<&FileSnapshot>,
        criteria: &[Criterion],
        now: DateTime<Utc>,
    ) -> Evaluation {
        let effective = target.unwrap_or(file);
        let name = file.file_name();
        let mut matched = Vec::new();
        for criterion in criteria.iter().filter(|criterion| criterion.enabled) {
            if !self.matches(criterion, effective, &name, now) {
                return Evaluation::move_to_cold();
            }
            matched.push(criterion.id);
        }
        if matched.is_empty() {
            return Evaluation::move_to_cold();
        }
        Evaluation {
            keep_in_hot: true,
            matched,
        }
    }

    /// Stat `path` (following symlinks) and evaluate it; unreadable files move to cold.
    #[must_use]
    pub fn evaluate_path(&self, path: &Path, criteria: &[Criterion], now: DateTime<Utc>) -> Evaluation {
        let Ok(file) = FileSnapshot::stat(path) else {
            return Evaluation::move_to_cold();
        };
        if file.kind == EntryKind::Symlink {
            let Ok(target) = FileSnapshot::follow(path) else {
                return Evaluation::move_to_cold();
            };
            return self.evaluate(&file, Some(&target), criteria, now);
        }
        self.evaluate(&file, None, criteria, now)
    }

    fn matches(
        &self,
        criterion: &Criterion,
        file: &FileSnapshot,
        name: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let value = criterion.value.trim();
        let operator = &criterion.operator;
        match criterion.criterion_type {
            CriterionType::Mtime => match_age(operator, value, age_minutes(now, file.modified)),
            CriterionType::Ctime => match_age(operator, value, age_minutes(now, file.changed)),
            CriterionType::Atime => {
                let age = match self.access.access_time(file) {
                    AccessTime::At(at) => age_minutes(now, at),
                    AccessTime::NeverOpened => f64::INFINITY,
                };
                match_age(operator, value, age)
            }
            CriterionType::Size => {
                parse_size(value).is_some_and(|threshold| compare(operator, file.size, threshold))
            }
            CriterionType::Name => match_name(operator, value, name, false),
            CriterionType::Iname => match_name(operator, value, name, true),
            CriterionType::Type => match_type(operator, value, file.kind),
            CriterionType::Perm => match_perm(operator, value, file.mode),
            CriterionType::User => {
                *operator == CriterionOperator::Eq
                    && resolve_user(value).is_ok_and(|uid| uid == file.uid)
            }
            CriterionType::Group => {
                *operator == CriterionOperator::Eq
                    && resolve_group(value).is_ok_and(|gid| gid == file.gid)
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn age_minutes(now: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (now - at).num_milliseconds() as f64 / 60_000.0
}

fn match_age(operator: &CriterionOperator, value: &str, age: f64) -> bool {
    let Ok(threshold) = value.parse::<f64>() else {
        return false;
    };
    if !threshold.is_finite() {
        return false;
    }
    match operator {
        CriterionOperator::Gt => age > threshold,
        CriterionOperator::Lt => age < threshold,
        CriterionOperator::Ge => age >= threshold,
        CriterionOperator::Le => age <= threshold,
        CriterionOperator::Eq => ((age - threshold) * 60.0).abs() <= TIME_EQUALITY_TOLERANCE_SECS,
        _ => false,
    }
}

fn compare(operator: &CriterionOperator, actual: u64, threshold: u64) -> bool {
    match operator {
        CriterionOperator::Gt => actual > threshold,
        CriterionOperator::Lt => actual < threshold,
        CriterionOperator::Ge => actual >= threshold,
        CriterionOperator::Le => actual <= threshold,
        CriterionOperator::Eq => actual == threshold,
        _ => false,
    }
}

/// Parse sizes such as `512`, `10KB`, `1.5G` using binary multiples.
#[must_use]
pub fn parse_size(value: &str) -> Option<u64> {
    let normalized = value.trim().to_ascii_uppercase();
    let digits_end = normalized
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(normalized.len());
    let (number, unit) = normalized.split_at(digits_end);
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return None,
    };
    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }
    fractional_bytes(number.parse::<f64>().ok()?, multiplier)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn fractional_bytes(value: f64, multiplier: u64) -> Option<u64> {
    let bytes = (value * multiplier as f64).round();
    (bytes.is_finite() && bytes >= 0.0 && bytes <= u64::MAX as f64).then_some(bytes as u64)
}

fn match_name(operator: &CriterionOperator, pattern: &str, name: &str, insensitive: bool) -> bool {
    match operator {
        CriterionOperator::Eq if insensitive => name.eq_ignore_ascii_case(pattern),
        CriterionOperator::Eq => name == pattern,
        CriterionOperator::Contains if insensitive => name
            .to_lowercase()
            .contains(&pattern.to_lowercase()),
        CriterionOperator::Contains => name.contains(pattern),
        CriterionOperator::Matches => GlobBuilder::new(pattern)
            .case_insensitive(insensitive)
            .literal_separator(true)
            .build()
            .is_ok_and(|glob| glob.compile_matcher().is_match(name)),
        CriterionOperator::Regex => RegexBuilder::new(pattern)
            .case_insensitive(insensitive)
            .build()
            .is_ok_and(|regex| regex.is_match(name)),
        _ => false,
    }
}

fn match_type(operator: &CriterionOperator, value: &str, kind: EntryKind) -> bool {
    let expected = match value.to_ascii_lowercase().as_str() {
        "f" | "file" => EntryKind::File,
        "d" | "dir" | "directory" => EntryKind::Directory,
        "l" | "link" | "symlink" => EntryKind::Symlink,
        _ => return false,
    };
    *operator == CriterionOperator::Eq && kind == expected
}

fn match_perm(operator: &CriterionOperator, value: &str, mode: u32) -> bool {
    if value.chars().all(|c| matches!(c, 'r' | 'w' | 'x')) && !value.is_empty() {
        if !matches!(operator, CriterionOperator::Eq | CriterionOperator::Contains) {
            return false;
        }
        let required = value.chars().fold(0, |bits, c| {
            bits | match c {
                'r' => 0o400,
                'w' => 0o200,
                _ => 0o100,
            }
        });
        return mode & required == required;
    }
    *operator == CriterionOperator::Eq
        && parse_octal_mode(value).is_ok_and(|expected| mode & 0o7777 == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    fn snapshot(name: &str, size: u64, age: Duration) -> FileSnapshot {
        let now = Utc::now();
        FileSnapshot {
            path: PathBuf::from("/srv/hot").join(name),
            kind: EntryKind::File,
            size,
            modified: now - age,
            accessed: now - age,
            changed: now - age,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
        }
    }

    fn rule(kind: CriterionType, operator: &str, value: &str) -> Criterion {
        Criterion::new(Uuid::nil(), kind, operator, value)
    }

    fn keeps(criteria: &[Criterion], file: &FileSnapshot) -> bool {
        CriteriaMatcher::default()
            .evaluate(file, None, criteria, Utc::now())
            .keep_in_hot
    }

    #[test]
    fn empty_or_disabled_rules_keep_nothing() {
        let file = snapshot("a.txt", 1, Duration::zero());
        assert!(!keeps(&[], &file));
        let mut disabled = rule(CriterionType::Size, "<", "10MB");
        disabled.enabled = false;
        assert!(!keeps(&[disabled], &file));
    }

    #[test]
    fn size_threshold_scenario() {
        let criteria = [rule(CriterionType::Size, "<", "10MB")];
        assert!(keeps(&criteria, &snapshot("small.bin", 5 * 1024 * 1024, Duration::zero())));
        assert!(!keeps(&criteria, &snapshot("large.bin", 50 * 1024 * 1024, Duration::zero())));
    }

    #[test]
    fn mtime_boundary_scenario() {
        let criteria = [rule(CriterionType::Mtime, "<", "60")];
        assert!(keeps(&criteria, &snapshot("fresh", 1, Duration::minutes(59))));
        assert!(!keeps(&criteria, &snapshot("stale", 1, Duration::minutes(61))));
    }

    #[test]
    fn time_equality_has_tolerance() {
        let criteria = [rule(CriterionType::Mtime, "=", "10")];
        assert!(keeps(&criteria, &snapshot("a", 1, Duration::seconds(10 * 60 + 20))));
        assert!(!keeps(&criteria, &snapshot("b", 1, Duration::seconds(10 * 60 + 45))));
    }

    #[test]
    fn matched_ids_are_all_enabled_ids_or_empty() {
        let file = snapshot("report.pdf", 100, Duration::minutes(5));
        let size = rule(CriterionType::Size, "<", "1KB");
        let name = rule(CriterionType::Name, "matches", "*.pdf");
        let mut disabled = rule(CriterionType::Size, ">", "1GB");
        disabled.enabled = false;
        let criteria = vec![size.clone(), disabled, name.clone()];

        let evaluation = CriteriaMatcher::default().evaluate(&file, None, &criteria, Utc::now());
        assert!(evaluation.keep_in_hot);
        assert_eq!(evaluation.matched, vec![size.id, name.id]);

        let failing = vec![size, rule(CriterionType::Name, "=", "other.pdf")];
        let evaluation = CriteriaMatcher::default().evaluate(&file, None, &failing, Utc::now());
        assert_eq!(evaluation, Evaluation::default());
    }

    #[test]
    fn name_operators() {
        let file = snapshot("Holiday.JPG", 1, Duration::zero());
        assert!(keeps(&[rule(CriterionType::Name, "contains", "day")], &file));
        assert!(!keeps(&[rule(CriterionType::Name, "matches", "*.jpg")], &file));
        assert!(keeps(&[rule(CriterionType::Iname, "matches", "*.jpg")], &file));
        assert!(keeps(&[rule(CriterionType::Iname, "=", "holiday.jpg")], &file));
        assert!(keeps(&[rule(CriterionType::Name, "regex", r"^Holi\w+\.JPG$")], &file));
        assert!(!keeps(&[rule(CriterionType::Name, "regex", "([")], &file));
    }

    #[test]
    fn unknown_operator_and_bad_values_do_not_match() {
        let file = snapshot("a.txt", 10, Duration::minutes(5));
        assert!(!keeps(&[rule(CriterionType::Size, "~", "10")], &file));
        assert!(!keeps(&[rule(CriterionType::Size, "<", "ten")], &file));
        assert!(!keeps(&[rule(CriterionType::Mtime, "<", "soon")], &file));
        assert!(!keeps(&[rule(CriterionType::Mtime, "contains", "5")], &file));
    }

    #[test]
    fn never_opened_files_are_infinitely_old() {
        let file = snapshot("a.txt", 10, Duration::minutes(1));
        let criteria = [rule(CriterionType::Atime, "<", "60")];
        assert!(keeps(&criteria, &file));

        let never = CriteriaMatcher::new(Arc::new(LastOpenedAccessTime::new(|_: &Path| Some(None))));
        assert!(!never.evaluate(&file, None, &criteria, Utc::now()).keep_in_hot);

        let opened_recently = LastOpenedAccessTime::new(|_: &Path| Some(Some(Utc::now())));
        let stale = snapshot("b.txt", 10, Duration::minutes(600));
        let matcher = CriteriaMatcher::new(Arc::new(opened_recently));
        assert!(matcher.evaluate(&stale, None, &criteria, Utc::now()).keep_in_hot);
    }

    #[test]
    fn type_and_permission_rules() {
        let file = snapshot("script.sh", 1, Duration::zero());
        assert!(keeps(&[rule(CriterionType::Type, "=", "file")], &file));
        assert!(!keeps(&[rule(CriterionType::Type, "=", "directory")], &file));
        assert!(keeps(&[rule(CriterionType::Perm, "=", "644")], &file));
        assert!(keeps(&[rule(CriterionType::Perm, "contains", "rw")], &file));
        assert!(!keeps(&[rule(CriterionType::Perm, "=", "rwx")], &file));
        assert!(keeps(&[rule(CriterionType::User, "=", "1000")], &file));
        assert!(!keeps(&[rule(CriterionType::Group, "=", "0")], &file));
    }

    #[test]
    fn symlink_targets_supply_metadata() {
        let link = FileSnapshot {
            kind: EntryKind::Symlink,
            size: 12,
            ..snapshot("clip.mp4", 12, Duration::zero())
        };
        let target = snapshot("clip.mp4", 80 * 1024 * 1024, Duration::zero());
        let criteria = [rule(CriterionType::Size, "<", "10MB")];
        let matcher = CriteriaMatcher::default();
        assert!(matcher.evaluate(&link, None, &criteria, Utc::now()).keep_in_hot);
        assert!(!matcher.evaluate(&link, Some(&target), &criteria, Utc::now()).keep_in_hot);
    }

    #[test]
    fn unreadable_paths_move_to_cold() {
        let criteria = [rule(CriterionType::Size, ">=", "0")];
        let evaluation = CriteriaMatcher::default().evaluate_path(
            Path::new("/definitely/not/here"),
            &criteria,
            Utc::now(),
        );
        assert!(!evaluation.keep_in_hot);
    }

    #[test]
    fn size_parser_accepts_suffixes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("10KB"), Some(10 * 1024));
        assert_eq!(parse_size("10 mb"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("1.5G"), Some(1_610_612_736));
        assert_eq!(parse_size("12XB"), None);
        assert_eq!(parse_size(""), None);
    }
}
