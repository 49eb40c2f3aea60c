use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use url::Url;

use crate::cli::chat::store::{FileStore, KeyValueStore, MemoryStore};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const API_URL_ENV: &str = "DR_CHATBOT_API_URL";
pub const DATA_DIR_ENV: &str = "DR_CHATBOT_DATA_DIR";

const APP_DIR_NAME: &str = "dr-chatbot";

/// Runtime settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: Url,
    pub data_dir: PathBuf,
    pub ephemeral: bool,
    pub color: bool,
}

impl Config {
    /// Build the config from command line overrides, falling back to the
    /// environment and then to defaults.
    pub fn resolve(
        api_url: Option<String>,
        data_dir: Option<PathBuf>,
        ephemeral: bool,
        color: bool,
    ) -> Result<Self> {
        let api_url = resolve_api_url(api_url.as_deref(), env::var(API_URL_ENV).ok().as_deref())?;
        let data_dir = data_dir
            .or_else(|| env::var_os(DATA_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            api_url,
            data_dir,
            ephemeral,
            color,
        })
    }

    /// Open the local store this config points at.
    pub fn open_store(&self) -> Result<Arc<dyn KeyValueStore>> {
        if self.ephemeral {
            return Ok(Arc::new(MemoryStore::new()));
        }

        let store = FileStore::in_dir(&self.data_dir)?;
        tracing::debug!("Using store at {}", store.path().display());
        Ok(Arc::new(store))
    }
}

/// Pick the API base url: explicit flag, then environment, then the local default.
/// Blank values count as unset.
pub fn resolve_api_url(flag: Option<&str>, env_value: Option<&str>) -> Result<Url> {
    let raw = [flag, env_value]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or(DEFAULT_API_URL);

    let url = Url::parse(raw).wrap_err_with(|| format!("Invalid API url: {}", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        eyre::bail!("API url must use http or https: {}", raw);
    }

    Ok(url)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".dr-chatbot"))
}
