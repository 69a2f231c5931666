use crate::make;
use crate::settings::{self, DatabaseTarget, Settings, SourceKind, Sources};
use anyhow::Context;
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use strata::sqlite::SqliteStore;
use strata::{
    Backend, Catalog, DirectoryHistory, ExecutionReport, GitHistory, MigrationUnit, Migrator,
    Steps,
};

/// Reversible SQL migrations, ordered by source history and applied in batches.
#[derive(Debug, Parser)]
#[command(name = "strata", version)]
pub struct Cli {
    /// Settings file read after ~/.strata.yaml, ./.strata.yaml and STRATA_* variables
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log more (-v info, -vv debug); RUST_LOG is used when not given
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq)]
pub enum Command {
    /// Apply pending migrations as a new batch
    Up {
        /// Number of migrations to apply; all when omitted or 0
        steps: Option<u32>,
    },
    /// Undo migrations, newest first, across batch boundaries
    Down {
        /// Number of migrations to undo; all when omitted or 0
        steps: Option<u32>,
    },
    /// Undo the most recent batch
    Rollback,
    /// Undo the most recent batch and apply it again
    Redo,
    /// List migrations relative to the current position
    List {
        #[command(subcommand)]
        which: ListCommand,
        /// Print JSON instead of one line per migration
        #[arg(long, global = true)]
        json: bool,
    },
    /// Create the ledger table, optionally recording an already-applied baseline
    Init {
        /// Identity of the last migration already present in the database
        identity: Option<String>,
    },
    /// Create a new migration directory from a template
    Make {
        first: String,
        last: String,
        message: String,
        /// Template from the `templates` setting
        #[arg(short, long, default_value = settings::BUILTIN_TEMPLATE)]
        template: String,
    },
}

#[derive(Debug, Subcommand, PartialEq, Eq, Clone, Copy)]
pub enum ListCommand {
    /// Migrations at or before the current position, newest first
    Executed,
    /// Migrations after the current position, oldest first
    Pending,
}

#[derive(Debug, Serialize)]
struct Listing<'a> {
    identity: &'a str,
    directory: &'a str,
    author: &'a str,
    created_at: NaiveDateTime,
    merged_at: DateTime<FixedOffset>,
}

impl<'a> From<&'a MigrationUnit> for Listing<'a> {
    fn from(unit: &'a MigrationUnit) -> Self {
        Self {
            identity: unit.identity(),
            directory: unit.directory(),
            author: unit.author(),
            created_at: unit.created_at(),
            merged_at: unit.merged_at(),
        }
    }
}

pub fn start(cli: Cli) -> anyhow::Result<()> {
    let settings = settings::load(&Sources::from_process(cli.config)?)?;
    run(&settings, cli.command)
}

pub fn run(settings: &Settings, command: Command) -> anyhow::Result<()> {
    if let Command::Make {
        first,
        last,
        message,
        template,
    } = &command
    {
        let directory = make::scaffold(
            settings,
            first,
            last,
            message,
            template,
            Local::now().naive_local(),
        )?;
        println!("created {}", directory.display());
        return Ok(());
    }

    let migrator = migrator(settings)?;
    let mut store = open_store(settings)?;
    let store = store.as_mut();

    match command {
        Command::Up { steps } => {
            let report = migrator.up(store, Steps::from(steps))?;
            finish(report)?;
        }
        Command::Down { steps } => {
            let report = migrator.down(store, Steps::from(steps))?;
            finish(report)?;
        }
        Command::Rollback => {
            let report = migrator.rollback(store)?;
            finish(report)?;
        }
        Command::Redo => {
            let redo = migrator.redo(store)?;
            if redo.rollback.is_empty() {
                println!("nothing to redo");
            }
            redo.into_result()?;
        }
        Command::List { which, json } => {
            let units = match which {
                ListCommand::Executed => migrator.list_executed(store)?,
                ListCommand::Pending => migrator.list_pending(store)?,
            };
            if json {
                let listing: Vec<Listing<'_>> = units.into_iter().map(Listing::from).collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for unit in units {
                    println!("{} {}", unit.identity(), unit.directory());
                }
            }
        }
        Command::Init { identity } => {
            migrator.init(store, identity.as_deref())?;
            match identity {
                Some(identity) => println!(
                    "created ledger table {} seeded at {}",
                    settings.ledger_table, identity
                ),
                None => println!("created ledger table {}", settings.ledger_table),
            }
        }
        Command::Make { .. } => {}
    }
    Ok(())
}

fn finish(report: ExecutionReport) -> anyhow::Result<()> {
    if report.is_empty() {
        println!("nothing to do");
    }
    report.into_result()?;
    Ok(())
}

fn migrator(settings: &Settings) -> anyhow::Result<Migrator> {
    let root = &settings.migration_path;
    let catalog = match settings.source {
        SourceKind::Git => Catalog::build(&GitHistory::new(root)),
        SourceKind::Directory => Catalog::build(&DirectoryHistory::new(root)),
    }
    .with_context(|| format!("failed to read migrations from {}", root.display()))?;

    Ok(Migrator::new(catalog)
        .on_unit_complete(|unit, direction, duration: Duration| {
            println!(
                "{} {} ✓ ({} ms)",
                direction.arrow(),
                unit.directory(),
                duration.as_millis()
            )
        })
        .on_unit_error(|unit, direction, error| {
            println!("{} {} ✗ {}", direction.arrow(), unit.directory(), error)
        })
        .on_unit_excluded(|unit, _| println!("stopped before {}", unit.directory())))
}

fn open_store(settings: &Settings) -> anyhow::Result<Box<dyn Backend>> {
    let url = settings.database_url.as_deref().context(
        "database_url is not set; add it to .strata.yaml or set STRATA_DATABASE_URL",
    )?;

    match DatabaseTarget::parse(url) {
        DatabaseTarget::Sqlite(path) => {
            let store = SqliteStore::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?
                .with_table_name(&settings.ledger_table)
                .with_busy_timeout(Duration::from_secs(settings.busy_timeout_secs))?;
            Ok(Box::new(store))
        }
        #[cfg(feature = "postgres")]
        DatabaseTarget::Postgres(url) => {
            use strata::postgres::{NoTls, PostgresClient, PostgresStore};
            let client = PostgresClient::connect(&url, NoTls)
                .context("failed to connect to PostgreSQL")?;
            Ok(Box::new(
                PostgresStore::new(client).with_table_name(&settings.ledger_table),
            ))
        }
        #[cfg(not(feature = "postgres"))]
        DatabaseTarget::Postgres(_) => {
            anyhow::bail!("this build of strata does not include PostgreSQL support")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use strata::Ledger;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn step_arguments() {
        let parse = |args: &[&str]| Cli::try_parse_from(args).map(|cli| cli.command);

        assert_eq!(parse(&["strata", "up"]).unwrap(), Command::Up { steps: None });
        assert_eq!(
            parse(&["strata", "down", "3"]).unwrap(),
            Command::Down { steps: Some(3) }
        );
        assert!(parse(&["strata", "up", "three"]).is_err());
        assert!(parse(&["strata", "up", "1", "2"]).is_err());
        assert!(parse(&["strata", "down", "-1"]).is_err());
        assert!(parse(&["strata", "rollback", "1"]).is_err());
    }

    #[test]
    fn global_flags_and_list() {
        let cli = Cli::try_parse_from(["strata", "list", "pending", "--json", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(
            cli.command,
            Command::List {
                which: ListCommand::Pending,
                json: true
            }
        );
        let cli = Cli::try_parse_from(["strata", "--config", "x.yaml", "make", "a", "b", "c"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
        assert_eq!(
            cli.command,
            Command::Make {
                first: "a".to_string(),
                last: "b".to_string(),
                message: "c".to_string(),
                template: "schema".to_string(),
            }
        );
    }

    fn write_migration(root: &std::path::Path, name: &str, table: &str) {
        let dir = root.join(name);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join("up.sql"),
            format!("CREATE TABLE {} (id INTEGER PRIMARY KEY);", table),
        )
        .unwrap();
        std::fs::write(dir.join("down.sql"), format!("DROP TABLE {};", table)).unwrap();
    }

    #[test]
    fn commands_against_sqlite_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("migrations");
        std::fs::create_dir(&migrations).unwrap();
        write_migration(&migrations, "20200101_120000_jane_doe_users", "users");
        write_migration(&migrations, "20200102_120000_jane_doe_posts", "posts");
        write_migration(&migrations, "20200103_120000_jane_doe_tags", "tags");

        let db = dir.path().join("app.db");
        let settings = Settings {
            database_url: Some(format!("sqlite://{}", db.display())),
            migration_path: migrations,
            source: SourceKind::Directory,
            ..Settings::default()
        };

        // the ledger must exist first
        assert!(run(&settings, Command::Up { steps: None }).is_err());

        run(&settings, Command::Init { identity: None }).unwrap();
        run(&settings, Command::Up { steps: Some(2) }).unwrap();
        run(&settings, Command::Up { steps: None }).unwrap();
        run(&settings, Command::Rollback).unwrap();
        run(&settings, Command::Redo).unwrap();
        run(&settings, Command::Down { steps: Some(1) }).unwrap();
        run(
            &settings,
            Command::List {
                which: ListCommand::Executed,
                json: true,
            },
        )
        .unwrap();

        let mut store = SqliteStore::open(&db).unwrap();
        let rows: Vec<String> = store
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.author)
            .collect();
        assert_eq!(rows, vec!["jane doe".to_string(), "jane doe".to_string()]);
        assert_eq!(
            store.position_at_offset(0).unwrap(),
            store.entries().unwrap().last().map(|e| e.identity.clone())
        );
    }

    #[test]
    fn database_commands_need_a_url() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            migration_path: dir.path().to_path_buf(),
            source: SourceKind::Directory,
            ..Settings::default()
        };
        let err = run(&settings, Command::Rollback).unwrap_err();
        assert!(err.to_string().contains("database_url"));
    }
}
