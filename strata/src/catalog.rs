use crate::core::{Direction, MigrationUnit, Order, ScriptRef};
use crate::error::Error;
use crate::history::{HistoryEvent, HistorySource};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// `YYYYMMDD_HHMMSS_<first>_<last>_<message>`; either name may be empty.
const DIRECTORY_PATTERN: &str =
    r"^(?P<timestamp>\d{8}_\d{6})_(?P<first>[^_]*)_(?P<last>[^_]*)_(?P<message>.+)$";

const DIRECTORY_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

fn directory_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(DIRECTORY_PATTERN).expect("directory pattern is valid"))
}

/// Creation time and author encoded in a migration directory name.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryName {
    pub created_at: NaiveDateTime,
    pub author: String,
    pub message: String,
}

/// Parse a directory name of the form `YYYYMMDD_HHMMSS_<first>_<last>_<message>`.
pub fn parse_directory_name(name: &str) -> Result<DirectoryName, Error> {
    let captures = directory_regex().captures(name).ok_or_else(|| {
        Error::Discovery(format!(
            "invalid directory name {}: expected timestamp_firstname_lastname_message",
            name
        ))
    })?;

    let created_at =
        NaiveDateTime::parse_from_str(&captures["timestamp"], DIRECTORY_TIMESTAMP_FORMAT)
            .map_err(|e| {
                Error::Discovery(format!("invalid timestamp in directory name {}: {}", name, e))
            })?;
    let author = format!("{} {}", &captures["first"], &captures["last"])
        .trim()
        .to_string();

    Ok(DirectoryName {
        created_at,
        author,
        message: captures["message"].to_string(),
    })
}

/// The full, ordered list of migration units known to the history.
///
/// Both the ascending and the descending ordering are computed once at construction, so
/// callers pick an [Order] explicitly instead of re-sorting the list.
#[derive(Debug, Clone)]
pub struct Catalog {
    units: Vec<MigrationUnit>,
    descending: Vec<usize>,
}

impl Catalog {
    /// Build the catalog from a history source.
    ///
    /// Every event that added files must add exactly one `up.sql` and one `down.sql` in a
    /// single directory whose name follows the naming convention.
    pub fn build(source: &dyn HistorySource) -> Result<Self, Error> {
        let root = source.root().to_path_buf();
        let mut units = Vec::new();

        for event in source.events()? {
            if event.added.is_empty() {
                continue;
            }
            let index = units.len();
            units.push(unit_from_event(&root, event, index)?);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            root = %root.display(),
            units = units.len(),
            "Built migration catalog"
        );

        Self::from_units(units)
    }

    /// Assemble a catalog from already-built units, ordered by sequence index.
    pub fn from_units(mut units: Vec<MigrationUnit>) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.identity.as_str()) {
                return Err(Error::Discovery(format!(
                    "duplicate migration identity {} ({})",
                    unit.identity, unit.directory
                )));
            }
        }

        units.sort_by_key(|u| u.sequence_index);
        let descending = (0..units.len()).rev().collect();
        Ok(Self { units, descending })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// The unit at `index` of the given ordering.
    pub fn get(&self, order: Order, index: usize) -> Option<&MigrationUnit> {
        match order {
            Order::Ascending => self.units.get(index),
            Order::Descending => self.descending.get(index).map(|&i| &self.units[i]),
        }
    }

    /// All units in the given ordering.
    pub fn ordered(&self, order: Order) -> Vec<&MigrationUnit> {
        self.select(order, 0..self.len())
    }

    /// Index of `identity` within the given ordering.
    pub fn position_of(&self, order: Order, identity: &str) -> Option<usize> {
        let ascending = self.units.iter().position(|u| u.identity == identity)?;
        match order {
            Order::Ascending => Some(ascending),
            Order::Descending => Some(self.units.len() - 1 - ascending),
        }
    }

    /// Look up a unit by identity.
    pub fn find(&self, identity: &str) -> Option<&MigrationUnit> {
        self.units.iter().find(|u| u.identity == identity)
    }

    /// The units in `range` of the given ordering. The range is clamped to the catalog.
    pub fn select(&self, order: Order, range: Range<usize>) -> Vec<&MigrationUnit> {
        let stop = range.end.min(self.len());
        let start = range.start.min(stop);
        (start..stop).filter_map(|i| self.get(order, i)).collect()
    }
}

fn unit_from_event(root: &Path, event: HistoryEvent, index: usize) -> Result<MigrationUnit, Error> {
    let (directory, up, down) = pair_scripts(&event)?;
    let name = directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Discovery(format!(
                "migration {} adds scripts outside of a migration directory",
                event.identity
            ))
        })?;
    let parsed = parse_directory_name(&name)?;

    Ok(MigrationUnit {
        identity: event.identity,
        sequence_index: index,
        directory: name,
        author: parsed.author,
        created_at: parsed.created_at,
        merged_at: event.committed_at,
        up: ScriptRef::new(root.join(up), Direction::Up),
        down: ScriptRef::new(root.join(down), Direction::Down),
    })
}

/// Find the single `up.sql` / `down.sql` pair an event adds, and the directory holding it.
fn pair_scripts(event: &HistoryEvent) -> Result<(PathBuf, PathBuf, PathBuf), Error> {
    let scripts_named = |direction: Direction| -> Vec<&PathBuf> {
        event
            .added
            .iter()
            .filter(|p| p.file_name().is_some_and(|n| n == direction.script_file_name()))
            .collect()
    };
    let ups = scripts_named(Direction::Up);
    let downs = scripts_named(Direction::Down);

    if ups.len() != 1 || downs.len() != 1 {
        return Err(Error::Discovery(format!(
            "migration {} must add exactly one up.sql and one down.sql, found {} up and {} down in {:?}",
            event.identity,
            ups.len(),
            downs.len(),
            event.added
        )));
    }

    let up_dir = ups[0].parent().unwrap_or(Path::new(""));
    let down_dir = downs[0].parent().unwrap_or(Path::new(""));
    if up_dir != down_dir {
        return Err(Error::Discovery(format!(
            "migration {} adds up.sql and down.sql in different directories: {} and {}",
            event.identity,
            up_dir.display(),
            down_dir.display()
        )));
    }

    Ok((up_dir.to_path_buf(), ups[0].clone(), downs[0].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_catalog, Fixture, FixtureHistory};
    use chrono::{DateTime, NaiveDate};

    fn event(identity: &str, added: &[&str]) -> HistoryEvent {
        HistoryEvent {
            identity: identity.to_string(),
            committed_at: DateTime::parse_from_rfc3339("2020-11-14T13:03:03-08:00").unwrap(),
            added: added.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn parse_directory_name_author() {
        let cases = [
            ("20200101_120000_john_zoidberg_message", "john zoidberg"),
            ("20200101_120000_john__message", "john"),
            ("20200101_120000__zoidberg_message", "zoidberg"),
            ("20200101_120000_john_zoidberg_longer_message_here", "john zoidberg"),
        ];
        for (name, expected) in cases {
            assert_eq!(parse_directory_name(name).unwrap().author, expected, "{}", name);
        }
    }

    #[test]
    fn parse_directory_name_timestamp() {
        let parsed = parse_directory_name("20200101_150405_a_b_c").unwrap();
        assert_eq!(
            parsed.created_at,
            NaiveDate::from_ymd_opt(2020, 1, 1)
                .unwrap()
                .and_hms_opt(15, 4, 5)
                .unwrap()
        );
        assert_eq!(parsed.message, "c");
    }

    #[test]
    fn parse_directory_name_rejects_malformed() {
        for name in [
            "date_zoidberg_message",
            "foo",
            "20200101_120000_john",
            "20201301_120000_a_b_c",
        ] {
            assert!(
                matches!(parse_directory_name(name), Err(Error::Discovery(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn build_assigns_sequence_in_event_order() {
        let fixture = Fixture::new(&["a", "b", "c", "d", "e", "f", "g"]).unwrap();
        let catalog = fixture.catalog();

        assert_eq!(catalog.len(), 7);
        let identities: Vec<&str> = catalog
            .ordered(Order::Ascending)
            .iter()
            .map(|u| u.identity())
            .collect();
        assert_eq!(identities, vec!["a", "b", "c", "d", "e", "f", "g"]);
        for (i, unit) in catalog.ordered(Order::Ascending).iter().enumerate() {
            assert_eq!(unit.sequence_index(), i);
            assert!(unit.directory().ends_with(&format!("_{}", unit.identity())));
        }

        let c = catalog.find("c").unwrap();
        assert_eq!(c.author(), "c c");
        assert!(c.up().path().ends_with("up.sql"));
        assert!(c.down().path().ends_with("down.sql"));
        assert_eq!(c.up().read().unwrap(), "CREATE TABLE c (id INTEGER PRIMARY KEY)");
    }

    #[test]
    fn descending_order_without_rebuilding() {
        let (_fixture, catalog) = fixture_catalog(&["a", "b", "c"]).unwrap();

        let identities: Vec<&str> = catalog
            .ordered(Order::Descending)
            .iter()
            .map(|u| u.identity())
            .collect();
        assert_eq!(identities, vec!["c", "b", "a"]);
        assert_eq!(catalog.position_of(Order::Ascending, "c"), Some(2));
        assert_eq!(catalog.position_of(Order::Descending, "c"), Some(0));
        assert_eq!(catalog.position_of(Order::Descending, "zzz"), None);
        assert_eq!(catalog.get(Order::Descending, 2).unwrap().identity(), "a");
    }

    #[test]
    fn select_clamps_to_bounds() {
        let (_fixture, catalog) = fixture_catalog(&["a", "b", "c"]).unwrap();
        assert_eq!(catalog.select(Order::Ascending, 1..10).len(), 2);
        assert!(catalog.select(Order::Ascending, 5..10).is_empty());
    }

    #[test]
    fn build_skips_events_without_files() {
        let history = FixtureHistory::new(
            "/migrations",
            vec![
                event("x", &[]),
                event("y", &["20200101_120000_a_b_c/up.sql", "20200101_120000_a_b_c/down.sql"]),
            ],
        );
        let catalog = Catalog::build(&history).unwrap();
        assert_eq!(catalog.len(), 1);
        let unit = catalog.find("y").unwrap();
        assert_eq!(unit.sequence_index(), 0);
        assert_eq!(
            unit.up().path(),
            Path::new("/migrations/20200101_120000_a_b_c/up.sql")
        );
        assert_eq!(unit.merged_at().to_rfc3339(), "2020-11-14T13:03:03-08:00");
    }

    #[test]
    fn build_rejects_missing_down_script() {
        let history = FixtureHistory::new(
            "/migrations",
            vec![event("x", &["20200101_120000_a_b_c/up.sql"])],
        );
        let err = Catalog::build(&history).unwrap_err();
        assert!(matches!(err, Error::Discovery(ref m) if m.contains("exactly one")));
    }

    #[test]
    fn build_rejects_two_migrations_in_one_event() {
        let history = FixtureHistory::new(
            "/migrations",
            vec![event(
                "x",
                &[
                    "20200101_120000_a_b_c/up.sql",
                    "20200101_120000_a_b_c/down.sql",
                    "20200102_120000_a_b_d/up.sql",
                    "20200102_120000_a_b_d/down.sql",
                ],
            )],
        );
        assert!(matches!(Catalog::build(&history), Err(Error::Discovery(_))));
    }

    #[test]
    fn build_rejects_split_directories() {
        let history = FixtureHistory::new(
            "/migrations",
            vec![event(
                "x",
                &["20200101_120000_a_b_c/up.sql", "20200102_120000_a_b_d/down.sql"],
            )],
        );
        let err = Catalog::build(&history).unwrap_err();
        assert!(matches!(err, Error::Discovery(ref m) if m.contains("different directories")));
    }

    #[test]
    fn build_rejects_bad_directory_name() {
        let history = FixtureHistory::new(
            "/migrations",
            vec![event("x", &["not_a_migration/up.sql", "not_a_migration/down.sql"])],
        );
        assert!(matches!(Catalog::build(&history), Err(Error::Discovery(_))));
    }

    #[test]
    fn build_rejects_scripts_at_root() {
        let history = FixtureHistory::new("/migrations", vec![event("x", &["up.sql", "down.sql"])]);
        assert!(matches!(Catalog::build(&history), Err(Error::Discovery(_))));
    }

    #[test]
    fn build_ignores_non_script_files_next_to_scripts() {
        let history = FixtureHistory::new(
            "/migrations",
            vec![event(
                "x",
                &[
                    "20200101_120000_a_b_c/README.md",
                    "20200101_120000_a_b_c/up.sql",
                    "20200101_120000_a_b_c/down.sql",
                ],
            )],
        );
        assert_eq!(Catalog::build(&history).unwrap().len(), 1);
    }

    #[test]
    fn from_units_rejects_duplicate_identities() {
        let (_fixture, catalog) = fixture_catalog(&["a", "b"]).unwrap();
        let mut units: Vec<MigrationUnit> =
            catalog.ordered(Order::Ascending).into_iter().cloned().collect();
        let mut duplicate = units[0].clone();
        duplicate.sequence_index = 5;
        units.push(duplicate);

        let err = Catalog::from_units(units).unwrap_err();
        assert!(matches!(err, Error::Discovery(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn build_from_directory_scan() {
        let fixture = Fixture::new(&["a", "b", "c"]).unwrap();
        let catalog = Catalog::build(&crate::DirectoryHistory::new(fixture.root())).unwrap();

        let directories: Vec<&str> = catalog
            .ordered(Order::Ascending)
            .iter()
            .map(|u| u.directory())
            .collect();
        assert_eq!(directories.len(), 3);
        assert!(directories[0].ends_with("_a_a_a"));
        assert!(directories[2].ends_with("_c_c_c"));
    }
}
