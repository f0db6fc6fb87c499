use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::address::AdmittedSession;

pub const DEFAULT_API_BASE_URL: &str = "http://api.ipstack.com";
const USAGE_LIMIT_REACHED_CODE: i64 = 104;
const USAGE_LIMIT_REACHED_TYPE: &str = "usage_limit_reached";
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// A named point on the map. `(0, 0)` means the location is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    #[serde(rename = "Lat", alias = "lat", default)]
    pub lat: f64,
    #[serde(rename = "Lng", alias = "lng", default)]
    pub lng: f64,
}

impl LocationRecord {
    pub fn new(name: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            name: name.into(),
            lat,
            lng,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error("no address provided")]
    NoAddress,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("lookup quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("lookup service returned HTTP {code}")]
    Status { code: u16 },
    #[error("lookup service error {code}: {info}")]
    Provider { code: i64, info: String },
    #[error("malformed lookup response: {0}")]
    MalformedBody(String),
    #[error("failed to start lookup thread: {0}")]
    Spawn(String),
    #[error("lookup thread exited without reporting")]
    Lost,
}

impl LookupError {
    /// Failures that point at the provider rather than at one session.
    pub fn is_provider_warning(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_) | Self::Status { .. })
    }
}

/// Resolves a single address to coordinates.
pub trait Geolocator: Send + Sync {
    fn locate(&self, address: &str) -> Result<Coordinates, LookupError>;
}

#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub username: String,
    pub result: Result<Coordinates, LookupError>,
}

pub struct IpStackClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl IpStackClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl Geolocator for IpStackClient {
    fn locate(&self, address: &str) -> Result<Coordinates, LookupError> {
        if address.is_empty() {
            return Err(LookupError::NoAddress);
        }

        let url = format!("{}/{}", self.base_url, address);
        let body = match self
            .agent
            .get(&url)
            .query("access_key", &self.api_key)
            .call()
        {
            Ok(response) => response
                .into_string()
                .map_err(|err| LookupError::Transport(err.to_string()))?,
            Err(ureq::Error::Status(code, _)) => return Err(classify_status(code)),
            Err(ureq::Error::Transport(transport)) => {
                return Err(LookupError::Transport(transport.to_string()));
            }
        };
        parse_lookup_body(&body)
    }
}

#[derive(Deserialize)]
struct IpStackResponse {
    success: Option<bool>,
    error: Option<IpStackErrorBody>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Deserialize)]
struct IpStackErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    info: String,
}

fn classify_status(code: u16) -> LookupError {
    match code {
        403 | 429 => LookupError::QuotaExceeded(format!("HTTP {code}")),
        _ => LookupError::Status { code },
    }
}

/// Reads `{latitude, longitude}` out of a lookup response. Missing or null
/// coordinates resolve to `(0, 0)`.
pub fn parse_lookup_body(body: &str) -> Result<Coordinates, LookupError> {
    let parsed: IpStackResponse =
        serde_json::from_str(body).map_err(|err| LookupError::MalformedBody(err.to_string()))?;

    if parsed.success != Some(true)
        && let Some(error) = parsed.error
    {
        let quota = error.code == USAGE_LIMIT_REACHED_CODE || error.kind == USAGE_LIMIT_REACHED_TYPE;
        let info = if error.info.trim().is_empty() {
            error.kind
        } else {
            error.info
        };
        if quota {
            return Err(LookupError::QuotaExceeded(info));
        }
        return Err(LookupError::Provider {
            code: error.code,
            info,
        });
    }

    Ok(Coordinates {
        lat: parsed.latitude.unwrap_or(0.0),
        lng: parsed.longitude.unwrap_or(0.0),
    })
}

/// Looks up every session at once, one thread per session, and returns the
/// outcomes in the same order as `sessions`.
///
/// Returns an error only when `stop` is raised before every lookup reported
/// back; the remaining threads are left to finish on their own.
pub fn resolve_all(
    sessions: &[AdmittedSession],
    geolocator: Arc<dyn Geolocator>,
    stop: &AtomicBool,
) -> Result<Vec<ResolutionOutcome>> {
    let (tx, rx) = mpsc::channel::<(usize, Result<Coordinates, LookupError>)>();
    let mut slots: Vec<Option<Result<Coordinates, LookupError>>> = vec![None; sessions.len()];
    let mut dispatched = 0usize;

    for (index, session) in sessions.iter().enumerate() {
        let tx = tx.clone();
        let geolocator = Arc::clone(&geolocator);
        let address = session.address.clone();
        let spawned = thread::Builder::new()
            .name(format!("lookup-{index}"))
            .spawn(move || {
                let result = match address.as_deref() {
                    Some(address) => geolocator.locate(address),
                    None => Err(LookupError::NoAddress),
                };
                let _ = tx.send((index, result));
            });
        match spawned {
            Ok(_) => dispatched += 1,
            Err(err) => slots[index] = Some(Err(LookupError::Spawn(err.to_string()))),
        }
    }
    drop(tx);

    let mut received = 0usize;
    while received < dispatched {
        if stop.load(Ordering::Relaxed) {
            bail!(
                "interrupted with {} of {dispatched} lookup(s) outstanding",
                dispatched - received
            );
        }
        match rx.recv_timeout(STOP_POLL_INTERVAL) {
            Ok((index, result)) => {
                slots[index] = Some(result);
                received += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(sessions
        .iter()
        .zip(slots)
        .map(|(session, slot)| ResolutionOutcome {
            username: session.username.clone(),
            result: slot.unwrap_or(Err(LookupError::Lost)),
        })
        .collect())
}

/// Successful lookups as location records, in dispatch order. Failures are
/// logged and left out.
pub fn fresh_records(outcomes: &[ResolutionOutcome]) -> Vec<LocationRecord> {
    let mut records = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match &outcome.result {
            Ok(coordinates) => {
                debug!(
                    user = %outcome.username,
                    lat = coordinates.lat,
                    lng = coordinates.lng,
                    "resolved location"
                );
                records.push(LocationRecord::new(
                    outcome.username.clone(),
                    coordinates.lat,
                    coordinates.lng,
                ));
            }
            Err(LookupError::NoAddress) => {
                debug!(user = %outcome.username, "session has no resolvable address");
            }
            Err(err) if err.is_provider_warning() => {
                warn!(user = %outcome.username, error = %err, "location lookup rejected by provider");
            }
            Err(err) => {
                info!(user = %outcome.username, error = %err, "location lookup failed");
            }
        }
    }
    records
}
