use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};

use crate::room::SelfIdentity;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub ws_url: String,
    pub auth_token: Option<String>,
    pub self_id: String,
    /// Other ids that also mean "me", such as a wallet address.
    pub self_aliases: Vec<String>,
    pub display_name: String,
    pub ping_interval_secs: u64,
    /// Capacity of the socket-to-room event queue.
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            auth_token: None,
            self_id: String::new(),
            self_aliases: Vec::new(),
            display_name: "Me".to_string(),
            ping_interval_secs: 30,
            event_buffer: 256,
        }
    }
}

impl Settings {
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .context("Failed to parse settings JSON")?;
        Ok(settings)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings dir: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn identity(&self) -> SelfIdentity {
        self.self_aliases
            .iter()
            .fold(SelfIdentity::new(&self.self_id, &self.display_name), |me, alias| {
                me.with_alias(alias)
            })
    }
}
