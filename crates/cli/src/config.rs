use anyhow::Result;
use clap::Args;
use confique::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Expand `$HOME` in a path.
pub fn expand_home_in_path(path: &Path) -> Result<PathBuf> {
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in path"))?;

    if path_str.contains("$HOME") {
        let expanded = path_str.replace("$HOME", home_dir.to_str().unwrap_or("."));
        Ok(PathBuf::from(expanded))
    } else {
        Ok(path.to_path_buf())
    }
}

#[derive(Config, Clone, Default, Serialize, Deserialize)]
#[config(layer_attr(derive(Args, Serialize, Clone)))]
pub struct AppConfig {
    #[config(nested, layer_attr(command(flatten)))]
    pub store: StoreConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub operator: OperatorConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub log: LogConfig,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct StoreConfig {
    /// Where the ledger snapshot is kept
    #[config(
        env = "FAIRDRAW_SNAPSHOT",
        default = "$HOME/.fairdraw/ledger.json",
        layer_attr(arg(long))
    )]
    pub snapshot_path: PathBuf,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct OperatorConfig {
    /// The operator whose ledger commands act on
    #[config(env = "FAIRDRAW_OPERATOR", layer_attr(arg(long = "operator")))]
    pub operator_id: Option<String>,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct LogConfig {
    /// Tracing filter used unless --verbose is given
    #[config(env = "FAIRDRAW_LOG", default = "info", layer_attr(arg(long)))]
    pub log_filter: String,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve `$HOME` placeholders once, at startup.
    pub fn with_resolved_paths(mut self) -> Result<Self> {
        self.store.snapshot_path = expand_home_in_path(&self.store.snapshot_path)?;
        Ok(self)
    }

    /// The configured operator, or an error telling the user how to set one.
    pub fn operator_id(&self) -> Result<&str> {
        self.operator.operator_id.as_deref().ok_or_else(|| {
            anyhow::anyhow!("no operator configured: pass --operator or set FAIRDRAW_OPERATOR")
        })
    }
}
