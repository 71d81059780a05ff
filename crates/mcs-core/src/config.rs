use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    domain::{DepartmentId, MatrixUserId},
    errors::Error,
    Result,
};

/// Typed configuration, resolved once at startup and passed by `Arc` into
/// each component constructor.
///
/// Secrets and endpoints come from the environment (with `.env` support);
/// the department list, observer, and space naming come from a JSON file
/// (`DEPARTMENTS_FILE`, default `departments.json`).
#[derive(Clone, Debug)]
pub struct Config {
    // Matrix backend
    pub homeserver_url: String,
    pub access_token: String,

    // Telegram
    pub telegram_bot_token: String,

    // Routing
    pub departments: Vec<Department>,
    pub observer: Option<Observer>,
    pub spaces: SpaceNaming,

    /// Senders whose events the relay loop never forwards (service accounts,
    /// bridge ghosts). The bridge's own identity is always added at runtime.
    pub system_senders: Vec<MatrixUserId>,

    // Relay tuning
    pub poll_interval: Duration,
    pub poll_timeout: Duration,

    // Persistence
    pub mapping_file: PathBuf,
    pub session_file: PathBuf,
    pub session_fallback_file: PathBuf,

    // Session store
    pub invalid_room_retention_days: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Department {
    pub id: DepartmentId,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Support users invited into every room of this department.
    #[serde(default)]
    pub recipients: Vec<MatrixUserId>,
    /// Telegram command (without the leading `/`) that selects this
    /// department directly, e.g. `support_technical`.
    #[serde(default)]
    pub telegram_command: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Observer {
    pub user_id: MatrixUserId,
    #[serde(default)]
    pub enabled: bool,
}

/// Naming templates for the root > channel > department space tree.
///
/// `{channel}` and `{department}` are the substitution tokens.
#[derive(Clone, Debug, Deserialize)]
pub struct SpaceNaming {
    pub root_name: String,
    #[serde(default = "default_channel_template")]
    pub channel_template: String,
    #[serde(default = "default_department_template")]
    pub department_template: String,
}

impl Default for SpaceNaming {
    fn default() -> Self {
        Self {
            root_name: "Customer Support".to_string(),
            channel_template: default_channel_template(),
            department_template: default_department_template(),
        }
    }
}

fn default_channel_template() -> String {
    "{channel} Support".to_string()
}

fn default_department_template() -> String {
    "{channel} - {department}".to_string()
}

#[derive(Debug, Deserialize)]
struct DepartmentsFile {
    departments: Vec<Department>,
    #[serde(default)]
    observer: Option<Observer>,
    #[serde(default)]
    spaces: Option<SpaceNaming>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let homeserver_url = env_str("MATRIX_HOMESERVER_URL")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("MATRIX_HOMESERVER_URL environment variable is required".to_string())
            })?;
        let homeserver_url = homeserver_url.trim_end_matches('/').to_string();

        let access_token = env_str("MATRIX_ACCESS_TOKEN")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("MATRIX_ACCESS_TOKEN environment variable is required".to_string())
            })?;

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
            })?;

        let departments_file =
            env_path("DEPARTMENTS_FILE").unwrap_or_else(|| PathBuf::from("departments.json"));
        let parsed = load_departments_file(&departments_file)?;

        let system_senders = parse_csv(env_str("SYSTEM_SENDERS"))
            .into_iter()
            .map(MatrixUserId)
            .collect();

        let poll_interval = Duration::from_millis(env_u64("POLL_INTERVAL_MS").unwrap_or(2_000));
        let poll_timeout = Duration::from_millis(env_u64("POLL_TIMEOUT_MS").unwrap_or(30_000));

        let mapping_file = env_path("MAPPING_FILE")
            .unwrap_or_else(|| PathBuf::from("/tmp/mcs-telegram-rooms.json"));
        let session_file =
            env_path("SESSION_FILE").unwrap_or_else(|| PathBuf::from("/tmp/mcs-session.json"));
        let session_fallback_file = env_path("SESSION_FALLBACK_FILE")
            .unwrap_or_else(|| PathBuf::from("/tmp/mcs-session.bak.json"));

        let invalid_room_retention_days = env_u64("INVALID_ROOM_RETENTION_DAYS")
            .map(|v| v as i64)
            .unwrap_or(7);

        let cfg = Self {
            homeserver_url,
            access_token,
            telegram_bot_token,
            departments: parsed.departments,
            observer: parsed.observer,
            spaces: parsed.spaces.unwrap_or_default(),
            system_senders,
            poll_interval,
            poll_timeout,
            mapping_file,
            session_file,
            session_fallback_file,
            invalid_room_retention_days,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.departments.is_empty() {
            return Err(Error::Config(
                "at least one department must be configured".to_string(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for dept in &self.departments {
            if dept.id.0.trim().is_empty() || dept.name.trim().is_empty() {
                return Err(Error::Config(
                    "department id and name must be non-empty".to_string(),
                ));
            }
            if !seen.insert(dept.id.0.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate department id: {}",
                    dept.id
                )));
            }
        }
        Ok(())
    }

    pub fn department(&self, id: &DepartmentId) -> Option<&Department> {
        self.departments.iter().find(|d| &d.id == id)
    }

    /// Resolve a Telegram command (no leading `/`) to its department.
    pub fn department_for_command(&self, command: &str) -> Option<&Department> {
        self.departments
            .iter()
            .find(|d| d.telegram_command.as_deref() == Some(command))
    }

    /// The observer identity, if configured and enabled.
    pub fn enabled_observer(&self) -> Option<&MatrixUserId> {
        self.observer
            .as_ref()
            .filter(|o| o.enabled)
            .map(|o| &o.user_id)
    }
}

fn load_departments_file(path: &Path) -> Result<DepartmentsFile> {
    let txt = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read departments file {}: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&txt).map_err(|e| {
        Error::Config(format!(
            "failed to parse departments file {}: {e}",
            path.display()
        ))
    })
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
