//! Configuration management for unslave
//!
//! Persistent settings live in `<config dir>/unslave/config.json`. Command
//! line flags override them for one run; [`RunConfig::resolve`] merges both.

use crate::crawl::{Granularity, QueryFilters, DEFAULT_KEYWORD, DEFAULT_PER_PAGE};
use crate::ledger::LEDGER_FILE;
use crate::pipeline::RemediationSettings;
use crate::quota::PacingPolicy;
use crate::rewrite::BoundaryPolicy;
use crate::util::{preserve_corrupt, write_atomic};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const APP_DIR: &str = "unslave";
const CONFIG_FILE: &str = "config.json";
const WORKDIR_NAME: &str = "unslave-worktree";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Commit email used instead of the account's public one.
    pub email: Option<String>,
    pub keyword: String,
    pub language: Option<String>,
    pub granularity: Granularity,
    pub per_page: u32,
    pub boundary: BoundaryPolicy,
    pub workdir: Option<PathBuf>,
    /// Remaining-call threshold below which API calls wait for the reset.
    pub low_water: u32,
    pub safety_margin_secs: u64,
    pub remediation: RemediationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let pacing = PacingPolicy::default();
        Self {
            email: None,
            keyword: DEFAULT_KEYWORD.to_string(),
            language: None,
            granularity: Granularity::default(),
            per_page: DEFAULT_PER_PAGE,
            boundary: BoundaryPolicy::default(),
            workdir: None,
            low_water: pacing.low_water,
            safety_margin_secs: pacing.safety_margin.as_secs(),
            remediation: RemediationSettings::default(),
        }
    }
}

impl Settings {
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR))
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load from `path`, or defaults when missing. A corrupt file is backed
    /// up and replaced by defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(err) => {
                let backup = preserve_corrupt(path, &content);
                warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %err,
                    "config file was corrupted, loaded defaults"
                );
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Config path has no parent: {}", path.display()))?;
        fs::create_dir_all(dir).context("Failed to create config directory")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                warn!(error = %e, "failed to set config directory permissions");
            }
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_atomic(path, &content).context("Failed to write config")?;
        Ok(())
    }

    pub fn pacing(&self) -> PacingPolicy {
        PacingPolicy {
            low_water: self.low_water,
            safety_margin: Duration::from_secs(self.safety_margin_secs),
        }
    }
}

/// Parse a crawl start or end time.
///
/// Accepts RFC 3339, `YYYY-MM-DD` (midnight UTC) and `YYYY-MM-DDTHH`
/// (top of the hour, UTC).
pub fn parse_start_time(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(&format!("{}:00:00", value), "%Y-%m-%dT%H:%M:%S")
    {
        return Ok(ts.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts.and_utc());
        }
    }
    anyhow::bail!(
        "Invalid time '{}': expected RFC 3339, YYYY-MM-DD or YYYY-MM-DDTHH",
        value
    )
}

/// Per-run values taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub email: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub granularity: Option<Granularity>,
    pub workdir: Option<PathBuf>,
    pub max_size_kb: Option<u64>,
    pub boundary: Option<BoundaryPolicy>,
    pub language: Option<String>,
    pub max_windows: Option<u32>,
}

/// Everything one run needs, after merging settings and flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub email: Option<String>,
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub granularity: Granularity,
    pub per_page: u32,
    pub workdir: PathBuf,
    pub ledger_path: PathBuf,
    pub filters: QueryFilters,
    pub boundary: BoundaryPolicy,
    pub pacing: PacingPolicy,
    pub remediation: RemediationSettings,
    pub max_windows: Option<u32>,
}

impl RunConfig {
    /// Merge `settings` with `overrides`. `now` is the default start time
    /// and `state_dir` holds the ledger.
    pub fn resolve(
        settings: Settings,
        overrides: RunOverrides,
        now: DateTime<Utc>,
        state_dir: &Path,
    ) -> anyhow::Result<Self> {
        let since = match overrides.since.as_deref() {
            Some(value) => parse_start_time(value).context("Bad --since")?,
            None => now,
        };
        let until = overrides
            .until
            .as_deref()
            .map(parse_start_time)
            .transpose()
            .context("Bad --until")?;
        if let Some(until) = until {
            if until > since {
                anyhow::bail!("--until ({}) is later than the start time ({})", until, since);
            }
        }

        let mut remediation = settings.remediation.clone();
        if let Some(limit) = overrides.max_size_kb {
            remediation.max_size_kb = limit;
        }

        let workdir = overrides
            .workdir
            .or_else(|| settings.workdir.clone())
            .unwrap_or_else(|| std::env::temp_dir().join(WORKDIR_NAME));

        Ok(Self {
            email: overrides.email.or_else(|| settings.email.clone()),
            since,
            until,
            granularity: overrides.granularity.unwrap_or(settings.granularity),
            per_page: settings.per_page.max(1),
            workdir,
            ledger_path: state_dir.join(LEDGER_FILE),
            filters: QueryFilters {
                keyword: settings.keyword.clone(),
                language: overrides.language.or_else(|| settings.language.clone()),
                max_size_kb: Some(remediation.max_size_kb),
            },
            boundary: overrides.boundary.unwrap_or(settings.boundary),
            pacing: settings.pacing(),
            remediation,
            max_windows: overrides.max_windows,
        })
    }
}
