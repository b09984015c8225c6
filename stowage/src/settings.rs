use crate::error::AppError;
use crate::redo::RedoOptions;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Supplies every option setup needs.
pub trait Configurator {
    fn redo_options(&self) -> Option<RedoOptions>;
    /// Options handed to `Driver::init`; `Value::Null` when none are configured.
    fn driver_options(&self, driver: &str) -> Value;
    fn dao_options(&self, dao_key: &str) -> Option<Value>;
    fn table_options(&self, driver: &str, namespace: &str) -> Option<TableOptions>;
    /// Commit and cache as usual, never write to storage.
    fn dry_run(&self) -> bool;
}

fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

fn default_concurrence() -> usize {
    1
}

fn default_save_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_sync_interval() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableOptions {
    pub dao_key: String,
    #[serde(default = "default_concurrence")]
    pub concurrence: usize,
    #[serde(default = "default_save_timeout", deserialize_with = "duration_from_millis")]
    pub save_timeout: Duration,
    #[serde(default = "default_sync_interval", deserialize_with = "duration_from_millis")]
    pub sync_interval: Duration,
}

impl TableOptions {
    pub fn new(dao_key: impl Into<String>) -> Self {
        TableOptions {
            dao_key: dao_key.into(),
            concurrence: default_concurrence(),
            save_timeout: default_save_timeout(),
            sync_interval: default_sync_interval(),
        }
    }

    pub fn concurrence(self, concurrence: usize) -> Self {
        TableOptions { concurrence, ..self }
    }

    pub fn save_timeout(self, save_timeout: Duration) -> Self {
        TableOptions { save_timeout, ..self }
    }

    pub fn sync_interval(self, sync_interval: Duration) -> Self {
        TableOptions { sync_interval, ..self }
    }
}

/// File and environment backed configuration.
///
/// ```toml
/// dry_run = false
///
/// [daos.main]
/// path = "/var/lib/game/main.redb"
///
/// [defaults.redb]
/// dao_key = "main"
///
/// [tables.player]
/// dao_key = "main"
/// concurrence = 4
/// sync_interval = 50
/// ```
///
/// `tables` is keyed by namespace, `defaults` by driver name. Any key can be overridden
/// through `STOWAGE__<KEY>` environment variables, e.g. `STOWAGE__DRY_RUN=true`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub redo: Option<RedoOptions>,
    #[serde(default)]
    pub drivers: HashMap<String, Value>,
    #[serde(default)]
    pub daos: HashMap<String, Value>,
    #[serde(default)]
    pub tables: HashMap<String, TableOptions>,
    #[serde(default)]
    pub defaults: HashMap<String, TableOptions>,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, AppError> {
        let builder =
            Config::builder()
                .add_source(File::with_name(path).required(true))
                .add_source(Environment::with_prefix("STOWAGE").try_parsing(true).separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn from_toml(text: &str) -> Result<Self, AppError> {
        let config = Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_dao(mut self, dao_key: &str, options: Value) -> Self {
        self.daos.insert(dao_key.to_string(), options);
        self
    }

    pub fn with_table(mut self, namespace: &str, options: TableOptions) -> Self {
        self.tables.insert(namespace.to_string(), options);
        self
    }

    pub fn with_default(mut self, driver: &str, options: TableOptions) -> Self {
        self.defaults.insert(driver.to_string(), options);
        self
    }
}

impl Configurator for Settings {
    fn redo_options(&self) -> Option<RedoOptions> {
        self.redo.clone()
    }

    fn driver_options(&self, driver: &str) -> Value {
        self.drivers.get(driver).cloned().unwrap_or(Value::Null)
    }

    fn dao_options(&self, dao_key: &str) -> Option<Value> {
        self.daos.get(dao_key).cloned()
    }

    fn table_options(&self, driver: &str, namespace: &str) -> Option<TableOptions> {
        self.tables.get(namespace).or_else(|| self.defaults.get(driver)).cloned()
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_path;
    use serde_json::json;

    const SAMPLE: &str = r#"
dry_run = true

[redo]
enabled = false

[drivers.redb]
strict = true

[daos.main]
path = "/tmp/stowage/main.redb"
cache_size_mb = 16

[defaults.redb]
dao_key = "main"

[tables.player]
dao_key = "main"
concurrence = 4
sync_interval = 50
save_timeout = 2000
"#;

    #[test]
    fn toml_settings_resolve_table_options() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert!(settings.dry_run());
        assert_eq!(settings.redo_options(), Some(RedoOptions::default()));
        assert_eq!(settings.driver_options("redb"), json!({ "strict": true }));
        assert_eq!(settings.driver_options("memory"), Value::Null);
        assert_eq!(settings.dao_options("main").unwrap()["cache_size_mb"], json!(16));

        let player = settings.table_options("redb", "player").unwrap();
        assert_eq!(player.concurrence, 4);
        assert_eq!(player.sync_interval, Duration::from_millis(50));
        assert_eq!(player.save_timeout, Duration::from_secs(2));

        let item = settings.table_options("redb", "item").unwrap();
        assert_eq!(item, TableOptions::new("main"));
        assert!(settings.table_options("memory", "item").is_none());
    }

    #[test]
    fn settings_load_from_file() {
        let dir = temp_path("stowage_settings");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stowage.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let settings = Settings::new(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.tables.len(), 1);
        assert!(Settings::new(dir.join("missing.toml").to_str().unwrap()).is_err());
    }

    #[test]
    fn builder_overrides() {
        let settings = Settings::default()
            .with_dao("mem", json!({}))
            .with_default("memory", TableOptions::new("mem").concurrence(2))
            .with_table("hero", TableOptions::new("mem").sync_interval(Duration::from_millis(10)))
            .with_dry_run(true);
        assert_eq!(settings.table_options("memory", "hero").unwrap().sync_interval, Duration::from_millis(10));
        assert_eq!(settings.table_options("memory", "villain").unwrap().concurrence, 2);
        assert!(settings.dry_run());
    }
}
