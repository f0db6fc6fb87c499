use std::path::{Path, PathBuf};

use tracing::debug;

use crate::session::SessionRecord;

pub const DEFAULT_MARKER_FILES: [&str; 2] = [".here", ".somewhere"];

/// Decides whether a user has asked to be included on the map.
pub trait OptInCheck {
    fn is_opted_in(&self, username: &str) -> bool;
}

impl<F> OptInCheck for F
where
    F: Fn(&str) -> bool,
{
    fn is_opted_in(&self, username: &str) -> bool {
        self(username)
    }
}

/// A user is opted in when any marker file exists in their home directory.
#[derive(Debug, Clone)]
pub struct MarkerFileOptIn {
    home_root: PathBuf,
    marker_files: Vec<String>,
}

impl MarkerFileOptIn {
    pub fn new(home_root: impl Into<PathBuf>, marker_files: Vec<String>) -> Self {
        Self {
            home_root: home_root.into(),
            marker_files,
        }
    }

    pub fn home_root(&self) -> &Path {
        &self.home_root
    }
}

impl OptInCheck for MarkerFileOptIn {
    fn is_opted_in(&self, username: &str) -> bool {
        if !is_plain_username(username) {
            return false;
        }
        let home = self.home_root.join(username);
        self.marker_files
            .iter()
            .any(|marker| home.join(marker).exists())
    }
}

fn is_plain_username(username: &str) -> bool {
    !username.is_empty()
        && username != "."
        && username != ".."
        && !username.contains(['/', '\\'])
}

pub fn filter_opted_in(records: Vec<SessionRecord>, check: &impl OptInCheck) -> Vec<SessionRecord> {
    records
        .into_iter()
        .filter(|record| {
            let admitted = check.is_opted_in(record.username());
            if !admitted {
                debug!(user = record.username(), "skipping user without opt-in marker");
            }
            admitted
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn marker_check(root: &Path) -> MarkerFileOptIn {
        MarkerFileOptIn::new(
            root,
            DEFAULT_MARKER_FILES.iter().map(|m| m.to_string()).collect(),
        )
    }

    fn record(name: &str) -> SessionRecord {
        SessionRecord::new(vec![name.to_string()])
    }

    #[test]
    fn either_marker_file_opts_in() {
        let tmp = TempDir::new().expect("temp dir");
        fs::create_dir_all(tmp.path().join("alice")).expect("alice home");
        fs::create_dir_all(tmp.path().join("bob")).expect("bob home");
        fs::create_dir_all(tmp.path().join("carol")).expect("carol home");
        fs::write(tmp.path().join("alice/.here"), "").expect("alice marker");
        fs::write(tmp.path().join("bob/.somewhere"), "").expect("bob marker");

        let check = marker_check(tmp.path());
        assert!(check.is_opted_in("alice"));
        assert!(check.is_opted_in("bob"));
        assert!(!check.is_opted_in("carol"));
        assert!(!check.is_opted_in("dave"));
    }

    #[test]
    fn path_like_usernames_are_rejected() {
        let tmp = TempDir::new().expect("temp dir");
        fs::write(tmp.path().join(".here"), "").expect("root marker");

        let check = marker_check(&tmp.path().join("nested"));
        assert!(!check.is_opted_in(".."));
        assert!(!check.is_opted_in("../nested"));
        assert!(!check.is_opted_in(""));
    }

    #[test]
    fn filter_keeps_order_of_admitted_records() {
        let check = |name: &str| name != "bob";
        let kept = filter_opted_in(vec![record("carol"), record("bob"), record("alice")], &check);
        let names: Vec<&str> = kept.iter().map(SessionRecord::username).collect();
        assert_eq!(names, vec!["carol", "alice"]);
    }
}
