//! Object path rules.
//!
//! An object path is the plain concatenation `folder + name`; folders carry
//! their own trailing `/`. Backup copies keep the folder and embed the
//! superseded version's update time in the name.

use chrono::{DateTime, Utc};

/// Timestamp layout embedded in backup names.
pub const BACKUP_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Full object path of `name` inside `folder`.
pub fn join(folder: &str, name: &str) -> String {
    format!("{}{}", folder, name)
}

/// Split a path after its last `/` into `(folder, name)`.
///
/// The folder keeps the trailing separator, so `join(split(p)) == p`.
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path),
    }
}

/// Extension of a name including the leading dot, or `""`.
pub fn extension(name: &str) -> &str {
    let (_, base) = split(name);
    match base.rfind('.') {
        Some(idx) => &base[idx..],
        None => "",
    }
}

/// Name without its extension.
pub fn stem(name: &str) -> &str {
    let (_, base) = split(name);
    &base[..base.len() - extension(base).len()]
}

/// Name of the backup copy of `name` whose superseded version was last
/// updated at `updated`.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use portal_mirror_core::path::backup_name;
///
/// let updated = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
/// assert_eq!(backup_name("vo123.html", updated), "vo123_2024-03-01-09-05-07.html");
/// ```
pub fn backup_name(name: &str, updated: DateTime<Utc>) -> String {
    sanitize_name(&format!(
        "{}_{}{}",
        stem(name),
        updated.format(BACKUP_TIME_FORMAT),
        extension(name)
    ))
}

/// Make a portal-supplied name safe to use as an object name.
///
/// Runs of whitespace become a single `-`; letters, digits, `.`, `_` and
/// `-` are kept; everything else (including `/`) is dropped.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            pending_dash = true;
            continue;
        }
        if !(ch.is_alphanumeric() || matches!(ch, '.' | '_' | '-')) {
            continue;
        }
        if pending_dash {
            out.push('-');
            pending_dash = false;
        }
        out.push(ch);
    }
    out
}
