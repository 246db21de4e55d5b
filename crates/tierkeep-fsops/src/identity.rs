//! Owner, group, and mode parsing for permission criteria.

use crate::error::{FsOpsError, FsOpsResult};

/// Resolve a user name or numeric uid to a raw uid.
///
/// # Errors
///
/// Returns an error when the value is empty, the lookup fails, or no such user exists.
#[cfg(unix)]
pub fn resolve_user(value: &str) -> FsOpsResult<u32> {
    use nix::unistd::User;

    let trimmed = non_empty("user", value)?;
    if let Ok(id) = trimmed.parse::<u32>() {
        return Ok(id);
    }
    let user = User::from_name(trimmed)
        .map_err(|source_err| FsOpsError::UserLookup {
            user: trimmed.to_string(),
            source: source_err,
        })?
        .ok_or_else(|| FsOpsError::invalid("user", "not_found", trimmed))?;
    Ok(user.uid.as_raw())
}

/// Resolve a group name or numeric gid to a raw gid.
///
/// # Errors
///
/// Returns an error when the value is empty, the lookup fails, or no such group exists.
#[cfg(unix)]
pub fn resolve_group(value: &str) -> FsOpsResult<u32> {
    use nix::unistd::Group;

    let trimmed = non_empty("group", value)?;
    if let Ok(id) = trimmed.parse::<u32>() {
        return Ok(id);
    }
    let group = Group::from_name(trimmed)
        .map_err(|source_err| FsOpsError::GroupLookup {
            group: trimmed.to_string(),
            source: source_err,
        })?
        .ok_or_else(|| FsOpsError::invalid("group", "not_found", trimmed))?;
    Ok(group.gid.as_raw())
}

/// Numeric ids only on platforms without a passwd database.
///
/// # Errors
///
/// Returns an error when the value is not numeric.
#[cfg(not(unix))]
pub fn resolve_user(value: &str) -> FsOpsResult<u32> {
    let trimmed = non_empty("user", value)?;
    trimmed
        .parse()
        .map_err(|_| FsOpsError::invalid("user", "unix_only", trimmed))
}

/// Numeric ids only on platforms without a group database.
///
/// # Errors
///
/// Returns an error when the value is not numeric.
#[cfg(not(unix))]
pub fn resolve_group(value: &str) -> FsOpsResult<u32> {
    let trimmed = non_empty("group", value)?;
    trimmed
        .parse()
        .map_err(|_| FsOpsError::invalid("group", "unix_only", trimmed))
}

/// Parse an octal permission string such as `644`, `0755` or `0o600`.
///
/// # Errors
///
/// Returns an error when the value is not valid octal or exceeds `0o7777`.
pub fn parse_octal_mode(value: &str) -> FsOpsResult<u32> {
    let trimmed = value.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| FsOpsError::invalid("mode", "invalid_octal", value))?;
    if digits.is_empty() || mode > 0o7777 {
        return Err(FsOpsError::invalid("mode", "out_of_range", value));
    }
    Ok(mode)
}

fn non_empty<'a>(field: &'static str, value: &'a str) -> FsOpsResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FsOpsError::invalid(field, "empty", value));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult<T> = anyhow::Result<T>;

    #[test]
    fn parse_octal_mode_validates_values() -> TestResult<()> {
        assert_eq!(parse_octal_mode("644")?, 0o644);
        assert_eq!(parse_octal_mode("0755")?, 0o755);
        assert_eq!(parse_octal_mode("0o600")?, 0o600);
        assert!(parse_octal_mode("999").is_err());
        assert!(parse_octal_mode("17777").is_err());
        assert!(parse_octal_mode("").is_err());
        Ok(())
    }

    #[test]
    fn numeric_ids_bypass_lookup() -> TestResult<()> {
        assert_eq!(resolve_user("1000")?, 1000);
        assert_eq!(resolve_group(" 42 ")?, 42);
        assert!(matches!(
            resolve_user("  "),
            Err(FsOpsError::InvalidInput { reason: "empty", .. })
        ));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn root_resolves_by_name() -> TestResult<()> {
        assert_eq!(resolve_user("root")?, 0);
        assert!(matches!(
            resolve_user("tierkeep-no-such-user"),
            Err(FsOpsError::InvalidInput {
                reason: "not_found",
                ..
            })
        ));
        Ok(())
    }
}
