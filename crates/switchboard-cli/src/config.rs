use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default = "default_seed_file")]
    pub seed_file: String,
}

fn default_seed_file() -> String {
    "seed.toml".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    /// Bearer credential injected into remote capability calls
    #[serde(default)]
    pub capability_credential: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_router_model")]
    pub router_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("capability_credential", &mask_secret(&self.capability_credential))
            .field("base_url", &self.base_url)
            .field("router_model", &self.router_model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_router_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
    #[serde(default = "default_window")]
    pub window: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            budget_secs: default_budget_secs(),
            window: default_window(),
        }
    }
}

fn default_budget_secs() -> u64 {
    30
}

fn default_window() -> usize {
    10
}

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("switchboard.toml")
}

impl SwitchboardConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path.clone().unwrap_or_else(default_config_path);

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config file {}. Run 'switchboard init' first.",
                path.display()
            )
        })?;

        let mut config: SwitchboardConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        // Environment overrides the file so the key never has to live on disk
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                config.provider.api_key = key;
            }
        }

        Ok(config)
    }

    /// Seed file path, resolved relative to the config file's directory
    pub fn seed_path(&self, config_path: &Option<PathBuf>) -> PathBuf {
        let base = config_path
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or_else(|| Path::new("."));
        base.join(&self.seed_file)
    }
}

pub fn default_config() -> &'static str {
    r#"# switchboard configuration

[provider]
# Or set ANTHROPIC_API_KEY in the environment
api_key = ""
# Bearer credential passed to remote capability endpoints
capability_credential = ""
base_url = "https://api.anthropic.com"
router_model = "claude-sonnet-4-5"
max_tokens = 4096

[pipeline]
budget_secs = 30
window = 10

seed_file = "seed.toml"
"#
}
