//! JSON snapshot of a store's contents.

use crate::config::Config;
use crate::core::{AgentActivity, HumanInteraction, Task};
use crate::error::Result;
use crate::events::Event;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub interactions: Vec<HumanInteraction>,
    #[serde(default)]
    pub activities: Vec<AgentActivity>,
}

impl Snapshot {
    /// Load `~/.cadre/state.json`, or an empty snapshot if there is none.
    pub fn load() -> Result<Self> {
        Self::load_from(&Config::state_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No state file, starting empty");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&content)?;
        debug!(
            path = %path.display(),
            tasks = snapshot.tasks.len(),
            events = snapshot.events.len(),
            "State loaded"
        );
        Ok(snapshot)
    }

    pub fn save(&self) -> Result<()> {
        Config::ensure_dirs()?;
        self.save_to(&Config::state_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!(path = %path.display(), tasks = self.tasks.len(), "State saved");
        Ok(())
    }
}
