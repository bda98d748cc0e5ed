use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

impl AppConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults. The result is validated.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str::<AppConfig>(&text).map_err(|e| {
                AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file {} not found, using defaults", path.display());
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Open the store, writing the defaults if the file does not exist yet
    pub async fn open(path: &Path) -> Result<Self> {
        let existed = tokio::fs::try_exists(path).await.unwrap_or(false);
        let config = AppConfig::load(path).await?;
        if !existed {
            Self::save_to_file(path, &config).await?;
            info!("Wrote default configuration to {}", path.display());
        }

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    async fn save_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = toml::to_string_pretty(config)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Update configuration with a closure
    ///
    /// The modified config is validated and persisted before it becomes
    /// visible to readers.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        config.validate()?;

        Self::save_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        Ok(())
    }
}
