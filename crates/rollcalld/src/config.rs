use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

/// Placeholder secret so development setups work out of the box. The
/// daemon logs a loud warning whenever it is still in use.
pub const DEV_DESCRIPTOR_SECRET: &str = "insecure-dev-secret";

/// Daemon configuration: built-in defaults, overlaid by an optional TOML
/// file, overlaid by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP server binds (default: 127.0.0.1:5000).
    pub listen_addr: String,
    /// Directory holding both SQLite databases.
    pub data_dir: PathBuf,
    /// Path to the school database file (default: `<data_dir>/school.db`).
    pub school_db: Option<PathBuf>,
    /// Path to the descriptor database file (default: `<data_dir>/descriptors.db`).
    pub descriptor_db: Option<PathBuf>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Euclidean distance a face must come strictly under to claim a student.
    pub match_threshold: f32,
    /// Secret the descriptor store derives its sealing key from.
    pub descriptor_secret: String,
    /// Largest accepted photo upload, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            listen_addr: "127.0.0.1:5000".to_string(),
            school_db: None,
            descriptor_db: None,
            model_dir: data_dir.join("models"),
            data_dir,
            match_threshold: 0.40,
            descriptor_secret: DEV_DESCRIPTOR_SECRET.to_string(),
            max_upload_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration. `ROLLCALL_CONFIG` names the TOML file to read
    /// and must then exist; otherwise `rollcall.toml` in the working
    /// directory is read if present. Environment variables win over both.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match config_file()? {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let config: Config = toml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                tracing::info!(path = %path.display(), "config file loaded");
                config
            }
            None => {
                tracing::warn!("no config file found, using built-in defaults");
                Self::default()
            }
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_SCHOOL_DB") {
            self.school_db = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ROLLCALL_DESCRIPTOR_DB") {
            self.descriptor_db = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_DESCRIPTOR_SECRET") {
            self.descriptor_secret = v;
        }
        self.match_threshold = env_f32("ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.max_upload_bytes = env_usize("ROLLCALL_MAX_UPLOAD_BYTES", self.max_upload_bytes);
    }

    /// Path to the school database (users, courses, ledger).
    pub fn school_db_path(&self) -> PathBuf {
        self.school_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join("school.db"))
    }

    /// Path to the encrypted descriptor database.
    pub fn descriptor_db_path(&self) -> PathBuf {
        self.descriptor_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join("descriptors.db"))
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn descriptor_secret_is_default(&self) -> bool {
        self.descriptor_secret == DEV_DESCRIPTOR_SECRET
    }
}

fn config_file() -> anyhow::Result<Option<PathBuf>> {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        let path = PathBuf::from(path);
        if !path.exists() {
            anyhow::bail!("ROLLCALL_CONFIG points at {}, which does not exist", path.display());
        }
        return Ok(Some(path));
    }
    let fallback = PathBuf::from("rollcall.toml");
    Ok(fallback.exists().then_some(fallback))
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_overrides_defaults() {
        let config: Config = toml::from_str(
            "listen_addr = \"0.0.0.0:8080\"\nmatch_threshold = 0.5\n",
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.max_upload_bytes, 8 * 1024 * 1024);
        assert!(config.descriptor_secret_is_default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Config>("listen_adr = \"x\"\n").is_err());
    }

    #[test]
    fn test_db_paths_live_under_data_dir() {
        let config: Config = toml::from_str("data_dir = \"/var/lib/rollcall\"\n").unwrap();
        assert_eq!(
            config.school_db_path(),
            PathBuf::from("/var/lib/rollcall/school.db")
        );
        assert_eq!(
            config.descriptor_db_path(),
            PathBuf::from("/var/lib/rollcall/descriptors.db")
        );
    }

    #[test]
    fn test_explicit_db_paths_win_over_data_dir() {
        let config: Config = toml::from_str(
            "data_dir = \"/var/lib/rollcall\"\nschool_db = \"/srv/school.db\"\n",
        )
        .unwrap();
        assert_eq!(config.school_db_path(), PathBuf::from("/srv/school.db"));
        assert_eq!(
            config.descriptor_db_path(),
            PathBuf::from("/var/lib/rollcall/descriptors.db")
        );
    }
}
