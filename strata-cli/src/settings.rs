//! Layered settings: `~/.strata.yaml`, then `./.strata.yaml`, then `STRATA_*` environment
//! variables, then the file given with `--config`. Later layers win.

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = ".strata.yaml";
pub const ENV_PREFIX: &str = "STRATA";

/// Name of the template that is always available to `make`.
pub const BUILTIN_TEMPLATE: &str = "schema";

const BUILTIN_UP: &str = "-- {{migration}}\n-- author: {{author}}\n-- created: {{timestamp}}\n\n";
const BUILTIN_DOWN: &str = "-- revert {{migration}}\n\n";

/// Where migration identities and order come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Commits that added each migration directory.
    #[default]
    Git,
    /// Directory names and contents, for trees outside version control.
    Directory,
}

/// A pair of handlebars templates used by `make`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Template {
    pub up: String,
    pub down: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub migration_path: PathBuf,
    pub source: SourceKind,
    pub ledger_table: String,
    pub busy_timeout_secs: u64,
    pub templates: HashMap<String, Template>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            migration_path: PathBuf::from("."),
            source: SourceKind::default(),
            ledger_table: "_strata_ledger_".to_string(),
            busy_timeout_secs: 30,
            templates: HashMap::new(),
        }
    }
}

impl Settings {
    /// Look up a template by name. The built-in `schema` template is used unless the
    /// settings define their own.
    pub fn template(&self, name: &str) -> Option<Template> {
        match self.templates.get(name) {
            Some(template) => Some(template.clone()),
            None if name == BUILTIN_TEMPLATE => Some(Template {
                up: BUILTIN_UP.to_string(),
                down: BUILTIN_DOWN.to_string(),
            }),
            None => None,
        }
    }
}

/// The inputs settings are read from.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    pub home: Option<PathBuf>,
    pub cwd: PathBuf,
    pub explicit: Option<PathBuf>,
    /// Environment variables to read instead of the process environment.
    pub env: Option<config::Map<String, String>>,
}

impl Sources {
    pub fn from_process(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            home: std::env::var_os("HOME").map(PathBuf::from),
            cwd: std::env::current_dir().context("failed to read the working directory")?,
            explicit,
            env: None,
        })
    }
}

fn optional_file(path: &Path) -> File<config::FileSourceFile, FileFormat> {
    File::from(path).format(FileFormat::Yaml).required(false)
}

pub fn load(sources: &Sources) -> anyhow::Result<Settings> {
    let mut builder = Config::builder();
    if let Some(home) = &sources.home {
        builder = builder.add_source(optional_file(&home.join(CONFIG_FILE_NAME)));
    }
    builder = builder
        .add_source(optional_file(&sources.cwd.join(CONFIG_FILE_NAME)))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(sources.env.clone()),
        );
    if let Some(explicit) = &sources.explicit {
        builder = builder.add_source(
            File::from(explicit.as_path())
                .format(FileFormat::Yaml)
                .required(true),
        );
    }

    let settings: Settings = builder
        .build()
        .context("failed to read settings")?
        .try_deserialize()
        .context("invalid settings")?;

    tracing::debug!(?settings, "Loaded settings");
    Ok(settings)
}

/// The database a `database_url` points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Sqlite(PathBuf),
    Postgres(String),
}

impl DatabaseTarget {
    /// `postgres://` and `postgresql://` URLs select PostgreSQL. `sqlite://<path>` or a bare
    /// path selects SQLite.
    pub fn parse(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseTarget::Postgres(url.to_string())
        } else {
            let path = url.strip_prefix("sqlite://").unwrap_or(url);
            DatabaseTarget::Sqlite(PathBuf::from(path))
        }
    }
}
