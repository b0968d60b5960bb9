use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Map;
use crate::common::error::PipeqError;
use crate::scheduler::ManagerType;

pub const RCFILE_ENV: &str = "PIPEQ_RCFILE";
pub const DEFAULT_RCFILE_NAME: &str = ".pipeqrc.toml";

/// Settings shared by every command.
///
/// Loaded from the rcfile and then overridden from the command line. Stage parameters that a
/// declaration leaves out fall back to these values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Directory where the run directories of experiments are created.
    pub root: PathBuf,
    /// Directories where HTML reports are written, `<root>/html` when empty.
    pub html_root: Vec<PathBuf>,
    /// Public URL prefix of the first HTML root, used in notifications.
    pub html_root_alias: Option<String>,
    pub notification_command_on_error: Option<String>,
    pub notification_command_on_success: Option<String>,
    pub strftime: String,
    /// Maximum number of characters of a job stdout shown in reports.
    pub max_stdout_size: usize,
    #[serde(
        serialize_with = "serialize_human_duration",
        deserialize_with = "deserialize_human_duration"
    )]
    pub sleep_between_queue_checks: Duration,
    pub manager: ManagerType,
    pub path: Vec<String>,
    pub ld_library_path: Vec<String>,
    pub source: Vec<String>,
    pub env: Map<String, String>,
    pub queue: Option<String>,
    pub mem_lo_gb: f64,
    pub mem_hi_gb: f64,
    pub parallel_jobs: u32,
    pub batch_size: u32,
    /// `pipeq` binary used on compute nodes, the current executable by default.
    pub wrapper: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".pipeq"),
            html_root: vec![],
            html_root_alias: None,
            notification_command_on_error: None,
            notification_command_on_success: None,
            strftime: "%d/%m/%Y %H:%M:%S".to_string(),
            max_stdout_size: 2048,
            sleep_between_queue_checks: Duration::from_secs(2),
            manager: ManagerType::Sge,
            path: vec![],
            ld_library_path: vec![],
            source: vec![],
            env: Default::default(),
            queue: None,
            mem_lo_gb: 10.0,
            mem_hi_gb: 64.0,
            parallel_jobs: 4,
            batch_size: 1,
            wrapper: None,
        }
    }
}

impl Config {
    pub fn parse(content: &str) -> crate::Result<Config> {
        Ok(toml::from_str(content)?)
    }

    /// Loads the rcfile, a missing file yields the default configuration.
    pub fn load(rcfile: &Path) -> crate::Result<Config> {
        match std::fs::read_to_string(rcfile) {
            Ok(content) => Self::parse(&content).map_err(|error| {
                PipeqError::DeserializationError(format!(
                    "Invalid configuration {}: {error}",
                    rcfile.display()
                ))
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Configuration {} not found, using defaults", rcfile.display());
                Ok(Config::default())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn html_roots(&self) -> Vec<PathBuf> {
        if self.html_root.is_empty() {
            vec![self.root.join("html")]
        } else {
            self.html_root.clone()
        }
    }

    /// Where the report of `name_code` can be found by people receiving notifications.
    pub fn report_url(&self, name_code: &str) -> String {
        let file = format!("{name_code}.html");
        match &self.html_root_alias {
            Some(alias) => format!("{}/{file}", alias.trim_end_matches('/')),
            None => self
                .html_roots()
                .first()
                .map(|root| root.join(&file).display().to_string())
                .unwrap_or(file),
        }
    }

    pub fn wrapper_path(&self) -> crate::Result<PathBuf> {
        match &self.wrapper {
            Some(wrapper) => Ok(wrapper.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// Flattened `config.<key>` entries shown as run metadata in reports.
    pub fn items(&self) -> crate::Result<Vec<(String, String)>> {
        let value = serde_json::to_value(self)?;
        let mut items = vec![];
        if let serde_json::Value::Object(map) = value {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::Null => continue,
                    serde_json::Value::String(value) => value,
                    value => value.to_string(),
                };
                items.push((format!("config.{key}"), value));
            }
        }
        Ok(items)
    }
}

/// `--rcfile`, then `PIPEQ_RCFILE` (handled by clap), then `~/.pipeqrc.toml`.
pub fn default_rcfile() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_RCFILE_NAME)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationDef {
    Seconds(f64),
    Text(String),
}

/// Accepts a humantime string (`"2s"`, `"1m 30s"`) or a number of seconds.
fn deserialize_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationDef::deserialize(deserializer)? {
        DurationDef::Seconds(seconds) => {
            Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
        }
        DurationDef::Text(text) => {
            humantime::parse_duration(&text).map_err(serde::de::Error::custom)
        }
    }
}

fn serialize_human_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::common::config::Config;
    use crate::scheduler::ManagerType;

    #[test]
    fn test_empty_config() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_config() {
        let config = Config::parse(
            r#"
root = "/scratch/pipeq"
manager = "slurm"
sleep_between_queue_checks = "1m 30s"
path = ["/opt/bin"]
env = { LANG = "C" }
parallel_jobs = 10
"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/scratch/pipeq"));
        assert_eq!(config.manager, ManagerType::Slurm);
        assert_eq!(config.sleep_between_queue_checks, Duration::from_secs(90));
        assert_eq!(config.env["LANG"], "C");
        assert_eq!(config.parallel_jobs, 10);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_duration_in_seconds() {
        let config = Config::parse("sleep_between_queue_checks = 0.5").unwrap();
        assert_eq!(config.sleep_between_queue_checks, Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_key() {
        assert!(Config::parse("rooot = \"x\"").is_err());
    }

    #[test]
    fn test_missing_rcfile() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        let config = Config::load(&tmp.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());

        let rcfile = tmp.path().join("rc.toml");
        std::fs::write(&rcfile, "queue = [1]").unwrap();
        assert!(Config::load(&rcfile).is_err());
    }

    #[test]
    fn test_report_url() {
        let mut config = Config {
            root: PathBuf::from("/r"),
            ..Default::default()
        };
        assert_eq!(config.html_roots(), vec![Path::new("/r/html").to_path_buf()]);
        assert_eq!(config.report_url("exp_ABC"), "/r/html/exp_ABC.html");
        config.html_root_alias = Some("https://reports.example.org/".to_string());
        assert_eq!(
            config.report_url("exp_ABC"),
            "https://reports.example.org/exp_ABC.html"
        );
    }

    #[test]
    fn test_items() {
        let items = Config::default().items().unwrap();
        assert!(items.contains(&("config.manager".to_string(), "sge".to_string())));
        assert!(items.contains(&(
            "config.sleep_between_queue_checks".to_string(),
            "2s".to_string()
        )));
        assert!(!items.iter().any(|(key, _)| key == "config.queue"));
    }
}
