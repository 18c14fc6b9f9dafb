use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::tree::DEFAULT_SCORE_VISIBLE_AFTER;

const DEFAULT_ENV_PREFIX: &str = "THREADVIEW";

/// Product policy values. These are deliberately configuration, not
/// code: deployments tune them without touching the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub comments: CommentsConfig,
    #[serde(default)]
    pub bookmarks: BookmarksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentsConfig {
    /// Age at which a comment's points become visible to every viewer.
    /// Younger comments only show points to admins and their author.
    #[serde(default = "default_score_visible_after", with = "humantime_serde")]
    pub score_visible_after: Duration,
}

impl Default for CommentsConfig {
    fn default() -> Self {
        Self {
            score_visible_after: default_score_visible_after(),
        }
    }
}

fn default_score_visible_after() -> Duration {
    DEFAULT_SCORE_VISIBLE_AFTER
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookmarksConfig {
    /// Names of the server-curated special bookmark categories.
    #[serde(default = "default_special_bookmarks")]
    pub special: Vec<String>,
}

impl Default for BookmarksConfig {
    fn default() -> Self {
        Self {
            special: default_special_bookmarks(),
        }
    }
}

fn default_special_bookmarks() -> Vec<String> {
    vec!["Best of".into(), "Kontrovers".into(), "Text".into()]
}

impl BookmarksConfig {
    pub fn is_special(&self, name: &str) -> bool {
        self.special
            .iter()
            .any(|special| special.eq_ignore_ascii_case(name.trim()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix));

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    base.comments.score_visible_after = other.comments.score_visible_after;
    if !other.bookmarks.special.is_empty() {
        base.bookmarks.special = other.bookmarks.special;
    }
    base
}

fn load_env(prefix: &str) -> Config {
    let mut cfg = Config::default();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(&mut cfg, &normalized, value);
        }
    }

    cfg
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "comments.score_visible_after" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.comments.score_visible_after = duration;
            }
        }
        "bookmarks.special" => {
            cfg.bookmarks.special = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("threadview").join("config.yaml"))
}
