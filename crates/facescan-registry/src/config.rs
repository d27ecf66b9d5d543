use facescan_core::{DetectorParams, DEFAULT_TOLERANCE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("tolerance must be in (0, 1], got {0}")]
    ToleranceOutOfRange(f64),
    #[error("scale factor must be greater than 1, got {0}")]
    InvalidScaleFactor(f64),
}

/// Registry configuration.
///
/// Resolved from built-in defaults, then an optional TOML file, then
/// `FACESCAN_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cascade file (JSON, or OpenCV XML by `.xml` extension). When unset an
    /// installed OpenCV frontal-face cascade is used, else the bundled one.
    pub cascade_path: Option<PathBuf>,
    /// Match tolerance in (0, 1]; the acceptance threshold is `(1 - tolerance) * 100`.
    pub tolerance: f64,
    /// Detector window growth per scale step.
    pub scale_factor: f64,
    /// Raw hits a face region needs beyond the first.
    pub min_neighbors: u32,
    /// Smallest face side in pixels (0 = cascade window).
    pub min_face_size: u32,
}

/// On-disk form: every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    cascade_path: Option<PathBuf>,
    tolerance: Option<f64>,
    scale_factor: Option<f64>,
    min_neighbors: Option<u32>,
    min_face_size: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults(&env_lookup)
    }
}

impl Config {
    fn defaults(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let params = DetectorParams::default();
        Self {
            db_path: data_dir(lookup).join("faces.db"),
            cascade_path: None,
            tolerance: DEFAULT_TOLERANCE,
            scale_factor: params.scale_factor,
            min_neighbors: params.min_neighbors,
            min_face_size: params.min_size,
        }
    }

    /// Load configuration from the config file (if any) and `FACESCAN_*`
    /// environment variables, then validate it.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::resolve()?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation, so callers can layer
    /// further overrides before a single [`Config::validate`].
    pub fn resolve() -> Result<Self, ConfigError> {
        Self::resolve_from(env_lookup)
    }

    /// [`Config::resolve`] with variables read through `lookup`.
    pub fn resolve_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&lookup);
        if let Some(path) = config_file_path(&lookup) {
            config.apply_file(&path)?;
        }
        config.apply_overrides(&lookup);
        Ok(config)
    }

    /// Defaults overlaid with a single TOML file, validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.apply_toml(&raw, path)?;
        tracing::debug!(path = %path.display(), "applied config file");
        Ok(())
    }

    fn apply_toml(&mut self, raw: &str, path: &Path) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.cascade_path {
            self.cascade_path = Some(v);
        }
        if let Some(v) = file.tolerance {
            self.tolerance = v;
        }
        if let Some(v) = file.scale_factor {
            self.scale_factor = v;
        }
        if let Some(v) = file.min_neighbors {
            self.min_neighbors = v;
        }
        if let Some(v) = file.min_face_size {
            self.min_face_size = v;
        }
        Ok(())
    }

    /// Overlay `FACESCAN_*` variables obtained through `lookup`.
    ///
    /// Unparseable numbers are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACESCAN_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACESCAN_CASCADE_PATH") {
            self.cascade_path = Some(PathBuf::from(v));
        }
        parse_into(&lookup, "FACESCAN_TOLERANCE", &mut self.tolerance);
        parse_into(&lookup, "FACESCAN_SCALE_FACTOR", &mut self.scale_factor);
        parse_into(&lookup, "FACESCAN_MIN_NEIGHBORS", &mut self.min_neighbors);
        parse_into(&lookup, "FACESCAN_MIN_FACE_SIZE", &mut self.min_face_size);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_tolerance(self.tolerance)?;
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return Err(ConfigError::InvalidScaleFactor(self.scale_factor));
        }
        Ok(())
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_face_size,
        }
    }
}

/// Tolerance must lie in (0, 1].
pub fn validate_tolerance(tolerance: f64) -> Result<(), ConfigError> {
    if tolerance > 0.0 && tolerance <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::ToleranceOutOfRange(tolerance))
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// `FACESCAN_CONFIG`, else `<config dir>/facescan/config.toml` when it exists.
fn config_file_path(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = lookup("FACESCAN_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let default = xdg_dir(lookup, "XDG_CONFIG_HOME", ".config").join("facescan/config.toml");
    default.exists().then_some(default)
}

fn data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    xdg_dir(lookup, "XDG_DATA_HOME", ".local/share").join("facescan")
}

fn xdg_dir(lookup: &impl Fn(&str) -> Option<String>, var: &str, home_relative: &str) -> PathBuf {
    lookup(var).map(PathBuf::from).unwrap_or_else(|| {
        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
        PathBuf::from(home).join(home_relative)
    })
}
