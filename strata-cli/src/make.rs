use crate::settings::Settings;
use anyhow::{bail, Context};
use chrono::NaiveDateTime;
use handlebars::Handlebars;
use serde::Serialize;
use std::path::PathBuf;

/// Values available to `make` templates.
#[derive(Debug, Serialize)]
struct TemplateValues {
    migration: String,
    author: String,
    directory: String,
    timestamp: String,
}

/// Create a new migration directory with `up.sql` and `down.sql` rendered from `template`.
///
/// The directory is named `<YYYYMMDD_HHMMSS>_<first>_<last>_<message>` under the configured
/// migration path. Returns the directory created.
pub fn scaffold(
    settings: &Settings,
    first: &str,
    last: &str,
    message: &str,
    template: &str,
    now: NaiveDateTime,
) -> anyhow::Result<PathBuf> {
    for (what, name) in [("first name", first), ("last name", last)] {
        if name.contains('_') || name.contains(std::path::MAIN_SEPARATOR) {
            bail!("{} {:?} may not contain '_' or path separators", what, name);
        }
    }
    if message.is_empty() || message.contains(std::path::MAIN_SEPARATOR) {
        bail!("message {:?} must be a non-empty directory name", message);
    }

    let templates = settings
        .template(template)
        .with_context(|| format!("no template named {:?} in settings", template))?;

    let timestamp = now.format("%Y%m%d_%H%M%S").to_string();
    let migration = format!("{}_{}_{}_{}", timestamp, first, last, message);
    strata::parse_directory_name(&migration)?;

    let directory = settings.migration_path.join(&migration);
    let values = TemplateValues {
        migration,
        author: format!("{} {}", first, last).trim().to_string(),
        directory: directory.display().to_string(),
        timestamp,
    };

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    let up = handlebars
        .render_template(&templates.up, &values)
        .with_context(|| format!("failed to render the up script of template {:?}", template))?;
    let down = handlebars
        .render_template(&templates.down, &values)
        .with_context(|| format!("failed to render the down script of template {:?}", template))?;

    std::fs::create_dir(&directory)
        .with_context(|| format!("failed to create {}", directory.display()))?;
    std::fs::write(directory.join("up.sql"), up)?;
    std::fs::write(directory.join("down.sql"), down)?;

    tracing::info!(directory = %directory.display(), template, "Created migration");
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Template;
    use chrono::NaiveDate;
    use strata::{Catalog, DirectoryHistory, Order};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 3, 4)
            .unwrap()
            .and_hms_opt(17, 5, 6)
            .unwrap()
    }

    fn settings(dir: &std::path::Path) -> Settings {
        Settings {
            migration_path: dir.to_path_buf(),
            ..Settings::default()
        }
    }

    #[test]
    fn creates_directory_from_builtin_template() {
        let dir = tempfile::tempdir().unwrap();
        let created = scaffold(&settings(dir.path()), "jane", "doe", "add_users", "schema", now())
            .unwrap();

        assert_eq!(
            created,
            dir.path().join("20210304_170506_jane_doe_add_users")
        );
        let up = std::fs::read_to_string(created.join("up.sql")).unwrap();
        assert!(up.contains("-- 20210304_170506_jane_doe_add_users"));
        assert!(up.contains("-- author: jane doe"));
        assert!(up.contains("-- created: 20210304_170506"));
        assert!(created.join("down.sql").exists());

        // the new directory is picked up as a migration
        let catalog = Catalog::build(&DirectoryHistory::new(dir.path())).unwrap();
        let unit = catalog.get(Order::Ascending, 0).unwrap();
        assert_eq!(unit.author(), "jane doe");
        assert_eq!(unit.created_at(), now());
    }

    #[test]
    fn renders_configured_template_without_escaping() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.templates.insert(
            "table".to_string(),
            Template {
                up: "CREATE TABLE \"{{author}}\" (note TEXT DEFAULT '<{{timestamp}}>');".to_string(),
                down: "DROP TABLE \"{{author}}\";".to_string(),
            },
        );

        let created = scaffold(&settings, "jane", "doe", "notes", "table", now()).unwrap();
        assert_eq!(
            std::fs::read_to_string(created.join("up.sql")).unwrap(),
            "CREATE TABLE \"jane doe\" (note TEXT DEFAULT '<20210304_170506>');"
        );
        assert_eq!(
            std::fs::read_to_string(created.join("down.sql")).unwrap(),
            "DROP TABLE \"jane doe\";"
        );
    }

    #[test]
    fn unknown_template_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scaffold(&settings(dir.path()), "jane", "doe", "x", "missing", now()).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unknown_template_variable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.templates.insert(
            "bad".to_string(),
            Template {
                up: "{{nope}}".to_string(),
                down: "".to_string(),
            },
        );
        assert!(scaffold(&settings, "jane", "doe", "x", "bad", now()).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn existing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        scaffold(&settings, "jane", "doe", "x", "schema", now()).unwrap();
        assert!(scaffold(&settings, "jane", "doe", "x", "schema", now()).is_err());
    }

    #[test]
    fn names_with_underscores_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        assert!(scaffold(&settings, "mary_jane", "doe", "x", "schema", now()).is_err());
        assert!(scaffold(&settings, "jane", "doe", "", "schema", now()).is_err());
    }
}
