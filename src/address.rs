use crate::session::SessionRecord;

pub const DEFAULT_MULTIPLEX_MARKERS: [&str; 3] = ["mosh", "tmux", "screen"];

/// A session that passed the opt-in filter, with the address we will try to
/// geolocate. `None` means the session carries no usable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedSession {
    pub username: String,
    pub address: Option<String>,
}

/// Turns the raw address column of `who --ips` into something resolvable.
///
/// Decorated entries such as `(10.0.0.9:S.0)` or `(host)` yield the bare host.
/// Multiplexed sessions (`(mosh [1234])`, `(tmux(1234).%0)`) carry no external
/// address.
pub fn extract_address(raw: Option<&str>, multiplex_markers: &[String]) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    let Some(inner) = raw.strip_prefix('(') else {
        return Some(raw.to_string());
    };

    if multiplex_markers
        .iter()
        .any(|marker| !marker.is_empty() && raw.contains(marker.as_str()))
    {
        return None;
    }

    let end = inner
        .find(':')
        .or_else(|| inner.find(')'))
        .unwrap_or(inner.len());
    let host = inner[..end].trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

pub fn admit(records: &[SessionRecord], multiplex_markers: &[String]) -> Vec<AdmittedSession> {
    records
        .iter()
        .map(|record| AdmittedSession {
            username: record.username().to_string(),
            address: extract_address(record.raw_address(), multiplex_markers),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        DEFAULT_MULTIPLEX_MARKERS
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    fn extract(raw: &str) -> Option<String> {
        extract_address(Some(raw), &markers())
    }

    #[test]
    fn bare_address_is_kept_verbatim() {
        assert_eq!(extract("1.2.3.4").as_deref(), Some("1.2.3.4"));
        assert_eq!(extract("host.example").as_deref(), Some("host.example"));
    }

    #[test]
    fn decorated_address_is_unwrapped() {
        assert_eq!(extract("(1.2.3.4:5678)").as_deref(), Some("1.2.3.4"));
        assert_eq!(extract("(10.0.0.9:S.0)").as_deref(), Some("10.0.0.9"));
        assert_eq!(extract("(host)").as_deref(), Some("host"));
        assert_eq!(extract("(unterminated").as_deref(), Some("unterminated"));
    }

    #[test]
    fn multiplexed_sessions_are_unresolvable() {
        assert_eq!(extract("(mosh-abcd)"), None);
        assert_eq!(extract("(mosh"), None);
        assert_eq!(extract("(tmux(1234).%0)"), None);
        assert_eq!(extract("(screen)"), None);
    }

    #[test]
    fn missing_or_empty_addresses_are_unresolvable() {
        assert_eq!(extract_address(None, &markers()), None);
        assert_eq!(extract(""), None);
        assert_eq!(extract("()"), None);
        assert_eq!(extract("(:0)"), None);
    }

    #[test]
    fn admit_preserves_usernames_of_unresolvable_sessions() {
        let records = vec![
            SessionRecord::new(
                ["alice", "pts/0", "-", "-", "1.2.3.4"]
                    .iter()
                    .map(|f| f.to_string())
                    .collect(),
            ),
            SessionRecord::new(vec!["bob".to_string(), "pts/1".to_string()]),
        ];

        let admitted = admit(&records, &markers());
        assert_eq!(
            admitted,
            vec![
                AdmittedSession {
                    username: "alice".to_string(),
                    address: Some("1.2.3.4".to_string()),
                },
                AdmittedSession {
                    username: "bob".to_string(),
                    address: None,
                },
            ]
        );
    }
}
