//! Global hotkey integration: binding parsing and X11 key grabs.

pub mod keybinding;
pub mod x11;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HotkeyError {
    #[error("X11 error: {0}")]
    X11(String),
    #[error("invalid key binding {spec:?}: {reason}")]
    Binding { spec: String, reason: String },
    #[error("no keycode maps to binding {0:?}")]
    UnmappedKey(String),
}
