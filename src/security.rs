//! Security utilities (spec §4.7): email/cron validation, path-traversal-safe
//! token path derivation, and atomic file writes for persisted tokens and
//! config.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("unsafe token path for email: {0}")]
    UnsafeTokenPath(String),
    #[error("atomic write failed: {0}")]
    Io(String),
}

/// Must contain `@`, and the part after `@` must contain `.`. Empty string
/// is rejected. (spec §4.5; the exact local-part charset is left to Open
/// Question (c), resolved in DESIGN.md to "non-empty and `@`-free".)
pub fn validate_email(email: &str) -> Result<(), SecurityError> {
    if email.is_empty() {
        return Err(SecurityError::InvalidEmail(email.to_string()));
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(SecurityError::InvalidEmail(email.to_string()));
    };
    if local.is_empty() || local.contains('@') || !domain.contains('.') {
        return Err(SecurityError::InvalidEmail(email.to_string()));
    }
    Ok(())
}

/// Delegates to the scheduler's cron parser (spec §4.4, §4.7).
pub fn validate_cron_expr(expr: &str) -> Result<(), SecurityError> {
    crate::scheduler::validate_cron_expr(expr).map_err(|e| SecurityError::InvalidCron(e.to_string()))
}

/// Derive a path-traversal-safe destination for a refresh-token upload
/// (spec §4.5): the joined path must remain strictly inside `tokens_dir`,
/// the basename must not contain path separators, and the result must end
/// in `.json`.
pub fn token_path_for_email(tokens_dir: &Path, email: &str) -> Result<PathBuf, SecurityError> {
    if email.is_empty() || email.contains('/') || email.contains('\\') || email.contains("..") {
        return Err(SecurityError::UnsafeTokenPath(email.to_string()));
    }

    let basename = format!("{email}.json");
    if basename.contains('/') || basename.contains('\\') {
        return Err(SecurityError::UnsafeTokenPath(email.to_string()));
    }

    let joined = tokens_dir.join(&basename);
    let normalized = normalize_path(&joined);
    let base_normalized = normalize_path(tokens_dir);

    if !normalized.starts_with(&base_normalized) {
        return Err(SecurityError::UnsafeTokenPath(email.to_string()));
    }
    if normalized.extension().and_then(|e| e.to_str()) != Some("json") {
        return Err(SecurityError::UnsafeTokenPath(email.to_string()));
    }

    Ok(normalized)
}

/// Resolve `.` and `..` components without requiring the path to exist.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                if matches!(components.last(), Some(Normal(_))) {
                    components.pop();
                }
            }
            CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Write `contents` to `path` atomically: write to `<path>.tmp.<random>` in
/// the same directory with mode 0600, fsync, then rename over the
/// destination. The temp file is removed on any failure (spec §4.5, §4.7).
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), SecurityError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| SecurityError::Io(e.to_string()))?;

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tmp");
    let tmp_path = dir.join(format!("{file_name}.tmp.{suffix}"));

    let write_result = (|| -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?;
            f.write_all(contents)?;
            f.sync_all()?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&tmp_path, contents)?;
        }
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(SecurityError::Io(e.to_string()));
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(SecurityError::Io(e.to_string()));
    }

    Ok(())
}

/// Constant-time comparison for the API key check (spec §4.2).
pub fn keys_match(provided: &str, expected: &str) -> bool {
    use subtle::ConstantTimeEq;
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_requires_at_and_dot_after_it() {
        assert!(validate_email("a@b.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("nodomain").is_err());
        assert!(validate_email("a@bcom").is_err());
        assert!(validate_email("@b.com").is_err());
    }

    #[test]
    fn token_path_stays_inside_tokens_dir() {
        let dir = Path::new("/data/tokens");
        let p = token_path_for_email(dir, "user@example.com").unwrap();
        assert_eq!(p, PathBuf::from("/data/tokens/user@example.com.json"));
    }

    #[test]
    fn token_path_rejects_traversal() {
        let dir = Path::new("/data/tokens");
        assert!(token_path_for_email(dir, "../../etc/passwd").is_err());
        assert!(token_path_for_email(dir, "a/b@example.com").is_err());
        assert!(token_path_for_email(dir, "").is_err());
    }

    #[test]
    fn atomic_write_produces_final_file_with_no_temp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        atomic_write(&path, b"{\"refresh_token\":\"abc\"}").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"refresh_token\":\"abc\"}");

        let leftover_tmp = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".tmp."));
        assert!(!leftover_tmp, "no temp file should remain after a successful write");
    }

    #[test]
    fn keys_match_compares_equal_and_unequal() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "wrong"));
        assert!(!keys_match("", "secret"));
    }
}
