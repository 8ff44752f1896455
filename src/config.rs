//! Configuration: the JSON config file, environment overrides, CLI merge,
//! and the immutable per-slot prompt profiles built from all three.
//!
//! Profiles are constructed once at startup and shared read-only for the
//! life of the process; nothing here mutates after [`resolve`] returns.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hotkey::HotkeyError;
use crate::hotkey::keybinding;
use crate::loader::LoadStrategy;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:1234";
pub const DEFAULT_BINDING: &str = "ctrl+shift+1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Overrides the request budget, in seconds.
pub const TIMEOUT_ENV: &str = "LMKEYD_TIMEOUT";
/// Fallback system prompt when neither flags nor config provide one.
pub const SYSTEM_PROMPT_ENV: &str = "LMKEYD_SYSTEM_PROMPT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid {TIMEOUT_ENV} value {0:?}")]
    InvalidTimeout(String),
    #[error("slot ids must be positive")]
    ZeroSlot,
    #[error("duplicate slot id {0}")]
    DuplicateSlot(u32),
    #[error("{scope}: system_prompt and system_prompt_file are mutually exclusive")]
    PromptConflict { scope: String },
    #[error("slot {slot}: {source}")]
    Binding { slot: u32, source: HotkeyError },
}

/// One configured hotkey slot. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptProfile {
    pub slot_id: u32,
    /// Key-combo spec, e.g. `"ctrl+shift+1"`.
    pub binding: String,
    pub system_prompt: String,
    /// Empty means "use the server default model".
    pub model_id: String,
    /// Inject a copy-selection action before reading the clipboard.
    pub auto_copy: bool,
    /// Inject a paste combo after writing the response to the clipboard.
    pub auto_paste: bool,
    /// Overrides the default paste combo; only used when `auto_paste`.
    pub paste_keys: Option<String>,
}

/// One `slots[]` entry in the config file. Unset fields fall back to the
/// file's top-level values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot: u32,
    pub binding: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub auto_copy: Option<bool>,
    #[serde(default)]
    pub auto_paste: Option<bool>,
    #[serde(default)]
    pub paste_keys: Option<String>,
}

/// The JSON config file. Every field has a default so a missing file and
/// `{}` behave identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub base_url: String,
    pub load_strategy: LoadStrategy,
    pub timeout_secs: u64,
    pub model: String,
    pub system_prompt: String,
    pub system_prompt_file: Option<PathBuf>,
    pub auto_copy: bool,
    pub auto_paste: bool,
    pub paste_keys: Option<String>,
    pub run_once_slot: Option<u32>,
    pub slots: Vec<SlotConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            load_strategy: LoadStrategy::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            model: String::new(),
            system_prompt: String::new(),
            system_prompt_file: None,
            auto_copy: false,
            auto_paste: false,
            paste_keys: None,
            run_once_slot: None,
            slots: Vec::new(),
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// CLI-level overrides, applied on top of the file config.
#[derive(Debug, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub load_strategy: Option<LoadStrategy>,
    pub timeout_secs: Option<u64>,
    /// Overrides the model for every slot.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub system_prompt_file: Option<PathBuf>,
    pub auto_copy: bool,
    pub auto_paste: bool,
    pub paste_keys: Option<String>,
    pub run_hotkey: Option<u32>,
}

/// Fully resolved runtime settings.
#[derive(Debug)]
pub struct Settings {
    pub base_url: String,
    pub load_strategy: LoadStrategy,
    pub timeout: Duration,
    pub profiles: Vec<Arc<PromptProfile>>,
    pub run_once_slot: Option<u32>,
}

fn read_prompt_file(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text.trim().to_string())
}

fn resolve_prompt(
    scope: &str,
    inline: Option<&str>,
    file: Option<&Path>,
    fallback: &str,
) -> Result<String, ConfigError> {
    match (inline, file) {
        (Some(_), Some(_)) => Err(ConfigError::PromptConflict {
            scope: scope.to_string(),
        }),
        (Some(text), None) => Ok(text.trim().to_string()),
        (None, Some(path)) => read_prompt_file(path),
        (None, None) => Ok(fallback.to_string()),
    }
}

/// Merge file config, environment, and CLI overrides into [`Settings`].
///
/// Precedence, lowest to highest: file, environment, CLI. When the file
/// defines no slots, a single slot 1 on the default binding is synthesized
/// from the top-level values.
pub fn resolve(
    file: FileConfig,
    overrides: Overrides,
    env_timeout: Option<String>,
    env_prompt: Option<String>,
) -> Result<Settings, ConfigError> {
    let base_url = overrides.base_url.unwrap_or(file.base_url);
    let load_strategy = overrides.load_strategy.unwrap_or(file.load_strategy);
    let file_run_once_slot = file.run_once_slot;

    let mut timeout_secs = file.timeout_secs;
    if let Some(raw) = env_timeout {
        timeout_secs = raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|&secs| secs > 0)
            .ok_or(ConfigError::InvalidTimeout(raw))?;
    }
    if let Some(secs) = overrides.timeout_secs {
        timeout_secs = secs;
    }

    // Default prompt: CLI flags beat the env fallback, which beats the file.
    let file_default_prompt = resolve_prompt(
        "config file",
        (!file.system_prompt.is_empty()).then_some(file.system_prompt.as_str()),
        file.system_prompt_file.as_deref(),
        "",
    )?;
    let env_or_file_prompt = env_prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or(file_default_prompt);
    let default_prompt = resolve_prompt(
        "command line",
        overrides.system_prompt.as_deref(),
        overrides.system_prompt_file.as_deref(),
        &env_or_file_prompt,
    )?;

    let default_model = overrides.model.clone().unwrap_or(file.model.clone());
    let default_auto_copy = file.auto_copy || overrides.auto_copy;
    let default_auto_paste = file.auto_paste || overrides.auto_paste;
    let default_paste_keys = overrides.paste_keys.clone().or(file.paste_keys.clone());

    let slots = if file.slots.is_empty() {
        vec![SlotConfig {
            slot: 1,
            binding: DEFAULT_BINDING.into(),
            system_prompt: None,
            system_prompt_file: None,
            model: None,
            auto_copy: None,
            auto_paste: None,
            paste_keys: None,
        }]
    } else {
        file.slots
    };

    let mut profiles = Vec::with_capacity(slots.len());
    for slot in slots {
        if slot.slot == 0 {
            return Err(ConfigError::ZeroSlot);
        }
        if profiles
            .iter()
            .any(|p: &Arc<PromptProfile>| p.slot_id == slot.slot)
        {
            return Err(ConfigError::DuplicateSlot(slot.slot));
        }

        keybinding::parse_spec(&slot.binding).map_err(|source| ConfigError::Binding {
            slot: slot.slot,
            source,
        })?;

        let system_prompt = resolve_prompt(
            &format!("slot {}", slot.slot),
            slot.system_prompt.as_deref(),
            slot.system_prompt_file.as_deref(),
            &default_prompt,
        )?;

        // A CLI-level model override applies to every slot.
        let model_id = match (&overrides.model, slot.model) {
            (Some(model), _) => model.clone(),
            (None, Some(model)) => model,
            (None, None) => default_model.clone(),
        };

        profiles.push(Arc::new(PromptProfile {
            slot_id: slot.slot,
            binding: slot.binding,
            system_prompt,
            model_id,
            auto_copy: slot.auto_copy.unwrap_or(default_auto_copy),
            auto_paste: slot.auto_paste.unwrap_or(default_auto_paste),
            paste_keys: slot.paste_keys.or(default_paste_keys.clone()),
        }));
    }

    Ok(Settings {
        base_url,
        load_strategy,
        timeout: Duration::from_secs(timeout_secs),
        profiles,
        run_once_slot: overrides.run_hotkey.or(file_run_once_slot),
    })
}
