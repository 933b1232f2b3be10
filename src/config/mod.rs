//! # Configuration
//!
//! A single TOML file with four tables and an optional template list:
//!
//! ```toml
//! [world]
//! width = 6144
//! height = 4096
//! overworld_width = 5120
//! view_radius_default = 18
//! tick_ms = 100
//!
//! [server]
//! intent_queue = 1024
//! outbound_queue = 256
//! autosave_minutes = 10
//!
//! [storage]
//! data_dir = "./data"
//! save_file = "world.sav"
//! backups = true
//! backup_retention = 10
//!
//! [logging]
//! level = "info"
//! file = "shardcore.log"
//!
//! [[templates]]
//! name = "lantern"
//! kind = "item"
//! display_name = "a lantern"
//! weight = 2
//! ```
//!
//! Every field has a default, so a partial file (or an empty one) loads.
//! [`Config::load`] validates before returning.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::world::geometry::{MapGeometry, CHUNK_SIZE};
use crate::world::templates::{Template, TemplateRegistry, TemplateRegistryBuilder};
use crate::world::WorldSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub width: u16,
    pub height: u16,
    pub overworld_width: u16,
    pub view_radius_min: u32,
    pub view_radius_max: u32,
    pub view_radius_default: u32,
    /// Tick length in milliseconds.
    pub tick_ms: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        let geometry = MapGeometry::default();
        let settings = WorldSettings::default();
        Self {
            width: geometry.width,
            height: geometry.height,
            overworld_width: geometry.overworld_width,
            view_radius_min: settings.view_radius_min,
            view_radius_max: settings.view_radius_max,
            view_radius_default: settings.view_radius_default,
            tick_ms: settings.tick_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Capacity of the shared intent queue feeding the tick loop.
    pub intent_queue: usize,
    /// Capacity of each connection's outbound event queue. A connection whose
    /// queue is full is disconnected.
    pub outbound_queue: usize,
    /// Minutes between autosaves; 0 disables autosave.
    pub autosave_minutes: u64,
    /// Seconds between metrics log lines; 0 disables them.
    pub metrics_log_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            intent_queue: 1024,
            outbound_queue: 256,
            autosave_minutes: 10,
            metrics_log_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub save_file: String,
    /// Keep a compressed copy of the previous save before each overwrite.
    pub backups: bool,
    /// Defaults to `<data_dir>/backups`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<String>,
    /// Number of backups kept; older ones are pruned after each save.
    pub backup_retention: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            save_file: "world.sav".to_string(),
            backups: true,
            backup_dir: None,
            backup_retention: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("shardcore.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub world: WorldConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    /// Extra templates registered on top of the built-in ones. A template
    /// with a built-in name replaces it.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,
}

impl Config {
    /// Load and validate configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        let config = Self::parse(&content)
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to `path`.
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.world;
        for (name, value) in [
            ("width", w.width),
            ("height", w.height),
            ("overworld_width", w.overworld_width),
        ] {
            if value == 0 || value % CHUNK_SIZE != 0 {
                bail!("world.{} must be a positive multiple of {}", name, CHUNK_SIZE);
            }
        }
        if w.overworld_width > w.width {
            bail!(
                "world.overworld_width ({}) exceeds world.width ({})",
                w.overworld_width,
                w.width
            );
        }
        if !(w.view_radius_min <= w.view_radius_default && w.view_radius_default <= w.view_radius_max) {
            bail!(
                "view radii must satisfy min <= default <= max (got {} / {} / {})",
                w.view_radius_min,
                w.view_radius_default,
                w.view_radius_max
            );
        }
        if w.tick_ms == 0 || w.tick_ms > 1000 {
            bail!("world.tick_ms must be between 1 and 1000");
        }
        if self.server.intent_queue == 0 || self.server.outbound_queue == 0 {
            bail!("server queue capacities must be greater than zero");
        }
        if self.storage.save_file.trim().is_empty() {
            bail!("storage.save_file must not be empty");
        }
        let mut seen = std::collections::HashSet::new();
        for template in &self.templates {
            if template.name.trim().is_empty() {
                bail!("template with empty name");
            }
            if !seen.insert(template.name.as_str()) {
                bail!("template '{}' defined twice", template.name);
            }
        }
        Ok(())
    }

    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            geometry: MapGeometry::new(self.world.width, self.world.height, self.world.overworld_width),
            view_radius_min: self.world.view_radius_min,
            view_radius_max: self.world.view_radius_max,
            view_radius_default: self.world.view_radius_default,
            tick_ms: self.world.tick_ms,
        }
    }

    /// Built-in templates plus any from the config file.
    pub fn template_registry(&self) -> Arc<TemplateRegistry> {
        TemplateRegistryBuilder::new()
            .with_builtins()
            .extend(self.templates.iter().cloned())
            .build()
    }

    pub fn save_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join(&self.storage.save_file)
    }

    pub fn backup_dir(&self) -> PathBuf {
        match &self.storage.backup_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&self.storage.data_dir).join("backups"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::entity::EntityKind;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").expect("parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.world_settings(), WorldSettings::default());
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = Config::parse("[world]\ntick_ms = 50\n[server]\noutbound_queue = 8\n").expect("parse");
        assert_eq!(config.world.tick_ms, 50);
        assert_eq!(config.world.width, 6144);
        assert_eq!(config.server.outbound_queue, 8);
        assert_eq!(config.server.intent_queue, 1024);
        assert_eq!(config.world_settings().ticks_per_second(), 20);
    }

    #[test]
    fn validation_rejects_bad_geometry_and_radii() {
        assert!(Config::parse("[world]\nwidth = 100\n").is_err());
        assert!(Config::parse("[world]\noverworld_width = 8192\n").is_err());
        assert!(Config::parse("[world]\nview_radius_default = 40\n").is_err());
        assert!(Config::parse("[world]\ntick_ms = 0\n").is_err());
        assert!(Config::parse("[server]\nintent_queue = 0\n").is_err());
    }

    #[test]
    fn templates_extend_the_builtins() {
        let config = Config::parse(
            r#"
            [[templates]]
            name = "lantern"
            kind = "item"
            display_name = "a lantern"
            weight = 2
            "#,
        )
        .expect("parse");
        let registry = config.template_registry();
        let lantern = registry.get("lantern").expect("lantern");
        assert_eq!(lantern.kind, EntityKind::Item);
        assert_eq!(lantern.weight, 2);
        assert!(registry.get("backpack").is_some());
    }

    #[test]
    fn duplicate_template_names_are_rejected() {
        let toml = "[[templates]]\nname = \"a\"\n[[templates]]\nname = \"a\"\n";
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn default_config_serializes_and_reparses() {
        let text = toml::to_string_pretty(&Config::default()).expect("serialize");
        assert_eq!(Config::parse(&text).expect("parse"), Config::default());
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let config = Config::default();
        assert_eq!(config.save_path(), PathBuf::from("./data/world.sav"));
        assert_eq!(config.backup_dir(), PathBuf::from("./data/backups"));
    }
}
