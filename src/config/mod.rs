//! `KEY=VALUE` configuration file with environment overlay, plus the typed
//! settings the cache and runtime are built from.

use std::{
    collections::HashMap,
    env, fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::BaseDirs;

use crate::error::{Error, Result};

mod training;

pub use training::TrainingSettings;

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(default_config_path())
    }

    pub fn load_from(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        let mut map = default_map();

        // Read the rc file if present; unreadable lines are skipped
        if config_path.exists() {
            if let Ok(pairs) = read_kv_file(&config_path) {
                map.extend(pairs);
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        // ENV first
        if let Ok(v) = env::var(key) {
            return Some(v);
        }
        self.inner.get(key).cloned()
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from)
    }

    fn require_path(&self, key: &str) -> Result<PathBuf> {
        self.get_path(key)
            .ok_or_else(|| Error::Configuration(format!("{key} is not set")))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64> {
        let raw = self
            .get(key)
            .ok_or_else(|| Error::Configuration(format!("{key} is not set")))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| Error::Configuration(format!("{key}={raw}: {e}")))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        let raw = self
            .get(key)
            .ok_or_else(|| Error::Configuration(format!("{key} is not set")))?;
        raw.trim()
            .parse::<i64>()
            .map_err(|e| Error::Configuration(format!("{key}={raw}: {e}")))
    }

    /// Comma separated list, blanks dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn result_store_path(&self) -> Result<PathBuf> {
        self.require_path("RESULT_STORE_PATH")
    }

    pub fn training_settings_path(&self) -> Result<PathBuf> {
        self.require_path("TRAINING_SETTINGS_PATH")
    }

    /// Settings resolved once at startup. Any error here is fatal for the process.
    pub fn settings(&self) -> Result<Settings> {
        let ttl = Duration::from_secs(self.get_u64("CACHE_TTL_SECS")?);
        if ttl.is_zero() {
            return Err(Error::Configuration("CACHE_TTL_SECS must be positive".into()));
        }
        let modules = self.get_list("RUNTIME_MODULES");
        if modules.is_empty() {
            return Err(Error::Configuration("RUNTIME_MODULES lists no modules".into()));
        }

        Ok(Settings {
            store_root: self.result_store_path()?,
            ttl,
            runtime: RuntimeSettings {
                modules_root: self.require_path("MODULES_ROOT")?,
                modules,
                staging_prefix: self
                    .get("STAGING_PREFIX")
                    .unwrap_or_else(|| "forestcache-pymod-".into()),
                staging_root: self.get_path("STAGING_ROOT"),
                env_file: self.get_path("RUNTIME_ENV_FILE"),
                python_bin: self.get("PYTHON_BIN").unwrap_or_else(|| "python3".into()),
                entry: EntryPoint {
                    module: self.entry_value("RUNTIME_ENTRY_MODULE")?,
                    class: self.entry_value("RUNTIME_ENTRY_CLASS")?,
                    configure_fn: self.entry_value("RUNTIME_CONFIGURE_FN")?,
                    train_fn: self.entry_value("RUNTIME_TRAIN_FN")?,
                    predict_fn: self.entry_value("RUNTIME_PREDICT_FN")?,
                },
            },
            compute_input: self.get("COMPUTE_INPUT").unwrap_or_default(),
        })
    }

    /// Settings re-read before every external call; they may change while
    /// the runtime stays resident.
    pub fn invocation_settings(&self) -> Result<InvocationSettings> {
        Ok(InvocationSettings {
            config_file: self.require_path("MODEL_CONFIG_FILE")?,
            work_dir: self.require_path("MODEL_WORK_DIR")?,
            training: TrainingSettings::load(self)?,
        })
    }

    fn entry_value(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Configuration(format!("{key} is not set")))
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub store_root: PathBuf,
    pub ttl: Duration,
    pub runtime: RuntimeSettings,
    pub compute_input: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub modules_root: PathBuf,
    /// Module paths relative to `modules_root`.
    pub modules: Vec<String>,
    pub staging_prefix: String,
    /// Parent of the staging area; the system temp directory when unset.
    pub staging_root: Option<PathBuf>,
    /// Interpreter key/value settings applied to the interpreter's environment.
    pub env_file: Option<PathBuf>,
    pub python_bin: String,
    pub entry: EntryPoint,
}

/// Names the bridge resolves inside the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub module: String,
    pub class: String,
    pub configure_fn: String,
    pub train_fn: String,
    pub predict_fn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSettings {
    pub config_file: PathBuf,
    pub work_dir: PathBuf,
    pub training: TrainingSettings,
}

/// Parse a `KEY=VALUE` file, ignoring blank lines and `#` comments.
pub fn read_kv_file(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut map = HashMap::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    Ok(map)
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &[
        "RESULT_STORE_PATH",
        "CACHE_TTL_SECS",
        "MODULES_ROOT",
        "RUNTIME_MODULES",
        "STAGING_PREFIX",
        "STAGING_ROOT",
        "RUNTIME_ENV_FILE",
        "PYTHON_BIN",
        "RUNTIME_ENTRY_MODULE",
        "RUNTIME_ENTRY_CLASS",
        "RUNTIME_CONFIGURE_FN",
        "RUNTIME_TRAIN_FN",
        "RUNTIME_PREDICT_FN",
        "MODEL_CONFIG_FILE",
        "MODEL_WORK_DIR",
        "TRAINING_RANDOM_STATE",
        "TRAINING_ESTIMATORS",
        "TRAINING_SETTINGS_PATH",
        "COMPUTE_INPUT",
    ];

    KEYS.contains(&k) || k.starts_with("FORESTCACHE_")
}

fn config_base() -> PathBuf {
    BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("forestcache")
}

fn default_config_path() -> PathBuf {
    if let Ok(p) = env::var("FORESTCACHE_CONFIG") {
        return PathBuf::from(p);
    }
    config_base().join(".forestcacherc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    // Paths
    let base = config_base();
    let temp = env::temp_dir().join("forestcache");

    m.insert(
        "RESULT_STORE_PATH".into(),
        temp.join("results").to_string_lossy().into_owned(),
    );
    m.insert(
        "MODEL_WORK_DIR".into(),
        temp.join("work").to_string_lossy().into_owned(),
    );
    m.insert("MODULES_ROOT".into(), base.join("modules").to_string_lossy().into_owned());
    m.insert(
        "RUNTIME_ENV_FILE".into(),
        base.join("runtime.properties").to_string_lossy().into_owned(),
    );
    m.insert(
        "MODEL_CONFIG_FILE".into(),
        base.join("rfConf.properties").to_string_lossy().into_owned(),
    );
    m.insert(
        "TRAINING_SETTINGS_PATH".into(),
        base.join("training.json").to_string_lossy().into_owned(),
    );

    // Numbers
    m.insert("CACHE_TTL_SECS".into(), "300".into());
    m.insert("TRAINING_RANDOM_STATE".into(), "42".into());
    m.insert("TRAINING_ESTIMATORS".into(), "100".into());

    // Runtime
    m.insert(
        "RUNTIME_MODULES".into(),
        "RandomForestModules/AWRandomForestModule.py,RandomForestModules/Utilities/AWLogger.py".into(),
    );
    m.insert("STAGING_PREFIX".into(), "forestcache-pymod-".into());
    m.insert("PYTHON_BIN".into(), "python3".into());
    m.insert("RUNTIME_ENTRY_MODULE".into(), "AWRandomForestModule".into());
    m.insert("RUNTIME_ENTRY_CLASS".into(), "AnimalWelfareRandomForest".into());
    m.insert("RUNTIME_CONFIGURE_FN".into(), "initConfiguration".into());
    m.insert("RUNTIME_TRAIN_FN".into(), "execRFTraining".into());
    m.insert("RUNTIME_PREDICT_FN".into(), "execRFPrediction".into());
    m.insert("COMPUTE_INPUT".into(), String::new());

    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rc(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(".forestcacherc");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn rc_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let rc = write_rc(
            dir.path(),
            "# comment\nCACHE_TTL_SECS = 60\n\nRUNTIME_MODULES=a.py, sub/b.py ,\n",
        );
        let cfg = Config::load_from(rc);
        let settings = cfg.settings().unwrap();
        assert_eq!(settings.ttl, Duration::from_secs(60));
        assert_eq!(settings.runtime.modules, vec!["a.py".to_string(), "sub/b.py".to_string()]);
        assert_eq!(settings.runtime.entry.train_fn, "execRFTraining");
    }

    #[test]
    fn malformed_ttl_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let rc = write_rc(dir.path(), "CACHE_TTL_SECS=soon\n");
        let err = Config::load_from(rc).settings().unwrap_err();
        assert_eq!(err.category(), "configuration error");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rc = write_rc(dir.path(), "CACHE_TTL_SECS=0\n");
        assert!(matches!(Config::load_from(rc).settings(), Err(Error::Configuration(_))));
    }

    #[test]
    fn missing_rc_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(dir.path().join("absent"));
        assert_eq!(cfg.get("RUNTIME_ENTRY_CLASS").as_deref(), Some("AnimalWelfareRandomForest"));
    }
}
