use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::address::admit;
use crate::config::WhereConfig;
use crate::geolocate::{Geolocator, IpStackClient, fresh_records, resolve_all};
use crate::optin::{MarkerFileOptIn, OptInCheck, filter_opted_in};
use crate::reconcile::{pinned, reconcile};
use crate::session::{SessionSource, parse_sessions, read_listing};
use crate::store::{self, RunLock};
use crate::util::{format_modified, plural};

/// Command-line values that take precedence over the config file and
/// environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_key: Option<String>,
    pub cache: Option<PathBuf>,
    pub home_root: Option<PathBuf>,
    pub sessions_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub source: SessionSource,
    pub cache_path: PathBuf,
    pub home_root: PathBuf,
    pub marker_files: Vec<String>,
    pub multiplex_markers: Vec<String>,
    pub api_key: Option<String>,
}

impl RunSettings {
    pub fn resolve(config: &WhereConfig, overrides: Overrides) -> Self {
        Self {
            source: overrides
                .sessions_file
                .map(SessionSource::File)
                .unwrap_or_default(),
            cache_path: overrides
                .cache
                .unwrap_or_else(|| config.cache_path.clone()),
            home_root: overrides
                .home_root
                .unwrap_or_else(|| config.home_root.clone()),
            marker_files: config.marker_files.clone(),
            multiplex_markers: config.multiplex_markers.clone(),
            api_key: overrides
                .api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .or_else(|| config.effective_api_key()),
        }
    }

    pub fn opt_in_check(&self) -> MarkerFileOptIn {
        MarkerFileOptIn::new(&self.home_root, self.marker_files.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub sessions: usize,
    pub opted_in: usize,
    pub resolved: usize,
    pub saved: usize,
    pub pinned: usize,
    pub cache_path: PathBuf,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resolved {} of {} opted-in ({} logged in); saved {} ({} pinned) to {}",
            self.resolved,
            plural(self.opted_in, "session", "sessions"),
            self.sessions,
            plural(self.saved, "location", "locations"),
            self.pinned,
            self.cache_path.display()
        )
    }
}

pub fn run(config: &WhereConfig, settings: &RunSettings) -> Result<RunSummary> {
    let api_key = settings.api_key.clone().context(
        "no ipstack access key configured; set `api_key` in the config file, \
         TILDE_WHERE_API_KEY, or pass --api-key",
    )?;
    let stop = install_stop_signal()?;
    let geolocator: Arc<dyn Geolocator> = Arc::new(IpStackClient::new(
        &config.api_base_url,
        &api_key,
        config.request_timeout(),
    ));
    let check = settings.opt_in_check();
    run_pipeline(settings, &check, geolocator, &stop)
}

/// One full pass: read sessions, look them up, merge with the cache and
/// replace it. The cache is only written once everything else succeeded.
pub fn run_pipeline(
    settings: &RunSettings,
    check: &impl OptInCheck,
    geolocator: Arc<dyn Geolocator>,
    stop: &AtomicBool,
) -> Result<RunSummary> {
    let _lock = RunLock::acquire(&settings.cache_path)?;

    let raw = read_listing(&settings.source)?;
    let persisted = store::load(&settings.cache_path)?;
    if persisted.is_none() {
        info!(cache = %settings.cache_path.display(), "no location cache yet; starting fresh");
    }

    let sessions = parse_sessions(&raw);
    let session_count = sessions.len();
    let opted_in = filter_opted_in(sessions, check);
    let admitted = admit(&opted_in, &settings.multiplex_markers);
    info!(
        sessions = session_count,
        opted_in = admitted.len(),
        "looking up session locations"
    );

    let outcomes = resolve_all(&admitted, geolocator, stop)?;
    let fresh = fresh_records(&outcomes);
    let merged = reconcile(&fresh, &persisted.unwrap_or_default(), check);

    if stop.load(Ordering::Relaxed) {
        bail!(
            "interrupted before saving; {} left unchanged",
            settings.cache_path.display()
        );
    }
    store::save(&settings.cache_path, &merged)?;

    Ok(RunSummary {
        sessions: session_count,
        opted_in: admitted.len(),
        resolved: fresh.len(),
        saved: merged.len(),
        pinned: pinned(&merged).len(),
        cache_path: settings.cache_path.clone(),
    })
}

pub fn print_status(config_path: &Path, settings: &RunSettings) -> Result<()> {
    println!("tilde-where status");
    println!("config: {}", config_path.display());
    println!("sessions_source: {}", settings.source.describe());
    println!("home_root: {}", settings.home_root.display());
    println!(
        "api_key: {}",
        if settings.api_key.is_some() {
            "configured"
        } else {
            "missing"
        }
    );
    println!("cache: {}", settings.cache_path.display());

    let Some(records) = store::load(&settings.cache_path)? else {
        println!("cache_state: absent");
        return Ok(());
    };
    if let Ok(modified) = fs::metadata(&settings.cache_path).and_then(|meta| meta.modified()) {
        println!("cache_updated: {}", format_modified(modified));
    }
    println!("cached_locations: {}", records.len());
    println!("pinned_locations: {}", pinned(&records).len());
    Ok(())
}

pub fn doctor(config_path: &Path, settings: &RunSettings) -> Result<u8> {
    let mut issues = 0u8;

    println!("tilde-where doctor");
    println!("config_path: {}", config_path.display());

    if settings.api_key.is_some() {
        println!("[OK] ipstack access key configured.");
    } else {
        issues += 1;
        println!("[WARN] ipstack access key not configured.");
    }

    match &settings.source {
        SessionSource::Command { program, .. } => {
            if command_available(program) {
                println!("[OK] {program} command available.");
            } else {
                issues += 1;
                println!("[WARN] {program} command not found in PATH.");
            }
        }
        SessionSource::File(path) => {
            if path.is_file() {
                println!("[OK] session listing {} readable.", path.display());
            } else {
                issues += 1;
                println!("[WARN] session listing {} not found.", path.display());
            }
        }
    }

    if settings.home_root.is_dir() {
        let check = settings.opt_in_check();
        let opted_in = count_opted_in(&settings.home_root, &check);
        println!(
            "[OK] home root {} accessible ({} opted in).",
            settings.home_root.display(),
            plural(opted_in, "user", "users")
        );
    } else {
        issues += 1;
        println!(
            "[WARN] home root {} is not an accessible directory.",
            settings.home_root.display()
        );
    }

    match store::load(&settings.cache_path) {
        Ok(Some(records)) => println!(
            "[OK] cache {} holds {}.",
            settings.cache_path.display(),
            plural(records.len(), "location", "locations")
        ),
        Ok(None) => println!(
            "[INFO] cache {} does not exist yet (created on first run).",
            settings.cache_path.display()
        ),
        Err(err) => {
            issues += 1;
            println!("[WARN] cache unreadable: {err:#}");
        }
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn count_opted_in(home_root: &Path, check: &impl OptInCheck) -> usize {
    let Ok(entries) = fs::read_dir(home_root) else {
        return 0;
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| check.is_opted_in(name))
        })
        .count()
}

fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
