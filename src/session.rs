use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

const USERNAME_FIELD: usize = 0;
const ADDRESS_FIELD: usize = 4;

/// One line of the session listing, split into its whitespace-delimited fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    fields: Vec<String>,
}

impl SessionRecord {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn username(&self) -> &str {
        self.fields
            .get(USERNAME_FIELD)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// The raw address token, if the line is long enough to carry one.
    pub fn raw_address(&self) -> Option<&str> {
        self.fields.get(ADDRESS_FIELD).map(String::as_str)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Where the session listing comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSource {
    Command { program: String, args: Vec<String> },
    File(PathBuf),
}

impl Default for SessionSource {
    fn default() -> Self {
        Self::Command {
            program: "who".to_string(),
            args: vec!["--ips".to_string()],
        }
    }
}

impl SessionSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Command { program, args } if args.is_empty() => format!("`{program}`"),
            Self::Command { program, args } => format!("`{program} {}`", args.join(" ")),
            Self::File(path) => path.display().to_string(),
        }
    }
}

pub fn read_listing(source: &SessionSource) -> Result<Vec<u8>> {
    match source {
        SessionSource::File(path) => fs::read(path)
            .with_context(|| format!("failed to read session listing {}", path.display())),
        SessionSource::Command { program, args } => {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .with_context(|| format!("failed to run {}", source.describe()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "{} exited with {}: {}",
                    source.describe(),
                    output.status,
                    stderr.trim()
                );
            }
            Ok(output.stdout)
        }
    }
}

/// Splits a raw session listing into records, keeping only the first line seen
/// for each username.
pub fn parse_sessions(raw: &[u8]) -> Vec<SessionRecord> {
    let text = String::from_utf8_lossy(raw);
    let mut records: Vec<SessionRecord> = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut token = String::new();

    for ch in text.chars() {
        match ch {
            ' ' | '\t' => flush_token(&mut token, &mut fields),
            '\r' => {}
            '\n' => {
                flush_token(&mut token, &mut fields);
                accept_line(&mut records, std::mem::take(&mut fields));
            }
            _ => token.push(ch),
        }
    }

    flush_token(&mut token, &mut fields);
    accept_line(&mut records, fields);
    records
}

fn flush_token(token: &mut String, fields: &mut Vec<String>) {
    if !token.is_empty() {
        fields.push(std::mem::take(token));
    }
}

fn accept_line(records: &mut Vec<SessionRecord>, fields: Vec<String>) {
    let Some(username) = fields.first() else {
        return;
    };
    if records.iter().any(|record| record.username() == username) {
        return;
    }
    records.push(SessionRecord::new(fields));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WHO_IPS: &str = "alice    pts/0        2021-03-04 10:11 1.2.3.4\n\
bob      pts/1        2021-03-04 10:12 (mosh [12345])\n\
alice    pts/2        2021-03-04 10:13 5.6.7.8\n\
carol    pts/3        2021-03-04 10:14 (10.0.0.9:S.0)\n";

    fn usernames(records: &[SessionRecord]) -> Vec<&str> {
        records.iter().map(SessionRecord::username).collect()
    }

    #[test]
    fn splits_fields_on_runs_of_spaces() {
        let records = parse_sessions(b"alice pts/0 - - 1.2.3.4 extra\n");
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].fields(),
            &["alice", "pts/0", "-", "-", "1.2.3.4", "extra"]
        );
        assert_eq!(records[0].raw_address(), Some("1.2.3.4"));
    }

    #[test]
    fn keeps_first_session_per_username() {
        let records = parse_sessions(WHO_IPS.as_bytes());
        assert_eq!(usernames(&records), vec!["alice", "bob", "carol"]);
        assert_eq!(records[0].raw_address(), Some("1.2.3.4"));
    }

    #[test]
    fn parsing_is_idempotent() {
        assert_eq!(
            parse_sessions(WHO_IPS.as_bytes()),
            parse_sessions(WHO_IPS.as_bytes())
        );
    }

    #[test]
    fn drops_blank_lines_and_trailing_newline() {
        let records = parse_sessions(b"\n   \nalice a b c 1.2.3.4\n\n");
        assert_eq!(usernames(&records), vec!["alice"]);
    }

    #[test]
    fn accepts_final_line_without_newline() {
        let records = parse_sessions(b"alice a b c 1.2.3.4\nbob a b c 5.6.7.8");
        assert_eq!(usernames(&records), vec!["alice", "bob"]);
        assert_eq!(records[1].raw_address(), Some("5.6.7.8"));
    }

    #[test]
    fn short_lines_have_no_address() {
        let records = parse_sessions(b"alice pts/0\r\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].username(), "alice");
        assert_eq!(records[0].raw_address(), None);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(parse_sessions(b"").is_empty());
    }

    #[test]
    fn reads_listing_from_file() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("whoips");
        std::fs::write(&path, WHO_IPS).expect("write listing");

        let raw = read_listing(&SessionSource::File(path)).expect("read listing");
        assert_eq!(raw, WHO_IPS.as_bytes());
    }

    #[test]
    fn missing_listing_file_is_an_error() {
        let tmp = TempDir::new().expect("temp dir");
        let source = SessionSource::File(tmp.path().join("absent"));
        assert!(read_listing(&source).is_err());
    }

    #[test]
    fn default_source_is_who_ips() {
        assert_eq!(SessionSource::default().describe(), "`who --ips`");
    }
}
