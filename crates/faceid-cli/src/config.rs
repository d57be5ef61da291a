use anyhow::{Context, Result};
use faceid_core::{EnrollmentPolicy, MatchConfig, OrchestratorConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Where the sealed gallery lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    File,
    Sqlite,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }

    fn default_file_name(self) -> &'static str {
        match self {
            Self::File => "gallery.enc",
            Self::Sqlite => "gallery.db",
        }
    }
}

/// Optional TOML file named by `FACEID_CONFIG`. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub gallery_path: Option<PathBuf>,
    pub backend: Option<Backend>,
    pub key_path: Option<PathBuf>,
    pub key: Option<String>,
    pub matcher: Option<MatchConfig>,
    pub enrollment: Option<EnrollmentPolicy>,
    pub detection: Option<OrchestratorConfig>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// CLI configuration: TOML file (if any) overlaid by `FACEID_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Sealed gallery file or SQLite database.
    pub gallery_path: PathBuf,
    pub backend: Backend,
    /// Raw 32-byte key file.
    pub key_path: PathBuf,
    /// Hex key that takes precedence over `key_path`.
    pub key_hex: Option<String>,
    pub matcher: MatchConfig,
    pub enrollment: EnrollmentPolicy,
    pub detection: OrchestratorConfig,
}

impl Config {
    /// Load from the process environment, reading `FACEID_CONFIG` first when set.
    pub fn load() -> Result<Self> {
        let file = match std::env::var_os("FACEID_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge a file config with an environment lookup; the environment wins.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("FACEID_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let backend = env("FACEID_BACKEND")
            .and_then(|v| {
                let parsed = Backend::parse(&v);
                if parsed.is_none() {
                    tracing::warn!(value = %v, "unknown FACEID_BACKEND; ignoring");
                }
                parsed
            })
            .or(file.backend)
            .unwrap_or(Backend::File);

        let gallery_path = env("FACEID_GALLERY_PATH")
            .map(PathBuf::from)
            .or(file.gallery_path)
            .unwrap_or_else(|| data_dir.join(backend.default_file_name()));

        let key_path = env("FACEID_KEY_PATH")
            .map(PathBuf::from)
            .or(file.key_path)
            .unwrap_or_else(|| data_dir.join("gallery.key"));

        let key_hex = env("FACEID_KEY").or(file.key);

        let matcher = file.matcher.unwrap_or_default();
        let matcher = MatchConfig {
            min_cosine: env_f32(&env, "FACEID_MIN_COSINE", matcher.min_cosine),
            min_confidence: env_f32(&env, "FACEID_MIN_CONFIDENCE", matcher.min_confidence),
            ..matcher.clone()
        }
        .with_tolerance(env_f32(&env, "FACEID_TOLERANCE", matcher.base_tolerance));

        let enrollment = file.enrollment.unwrap_or_default();
        let enrollment = EnrollmentPolicy {
            requested_frames: env_usize(&env, "FACEID_ENROLL_FRAMES", enrollment.requested_frames),
            min_capture_ratio: env_f32(&env, "FACEID_MIN_CAPTURE_RATIO", enrollment.min_capture_ratio),
            min_quality: env_f32(&env, "FACEID_MIN_QUALITY", enrollment.min_quality),
            ..enrollment
        };

        let detection = file.detection.unwrap_or_default();
        let detection = OrchestratorConfig {
            dimension: env("FACEID_DIMENSION")
                .and_then(|v| v.parse().ok())
                .or(detection.dimension),
            normalize: env("FACEID_NORMALIZE")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(detection.normalize),
            ..detection
        };

        Self {
            data_dir,
            gallery_path,
            backend,
            key_path,
            key_hex,
            matcher,
            enrollment,
            detection,
        }
    }

    /// Default location for encrypted backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceid")
}

fn env_f32(env: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(env: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
