//! Key binding parsing.
//!
//! Turns user-facing specs like `"ctrl+shift+1"` into an X11 modifier mask
//! plus keysym. Keysym-to-keycode resolution needs the server's keyboard
//! mapping and lives on [`crate::hotkey::x11::X11Context`].

use super::HotkeyError;

/// X11 core modifier bits accepted in binding specs.
pub const SHIFT_MASK: u16 = 0x0001;
pub const CONTROL_MASK: u16 = 0x0004;
pub const MOD1_MASK: u16 = 0x0008; // Alt
pub const MOD4_MASK: u16 = 0x0040; // Super

/// Modifier bits a binding can carry; everything else in an event's state
/// field (locks, buttons) is masked off before matching.
pub const MODIFIER_FILTER: u16 = SHIFT_MASK | CONTROL_MASK | MOD1_MASK | MOD4_MASK;

/// A parsed binding spec, not yet resolved against a keyboard mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBinding {
    /// Original spec string, kept for logging.
    pub raw: String,
    pub modifiers: u16,
    pub keysym: u32,
}

/// A binding resolved to a concrete keycode, ready to grab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub raw: String,
    pub modifiers: u16,
    pub keycode: u8,
}

fn keysym_for(token: &str) -> Option<u32> {
    let mut chars = token.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            return Some(c as u32);
        }
        return None;
    }

    if let Some(n) = token.strip_prefix('f').and_then(|n| n.parse::<u32>().ok()) {
        if (1..=24).contains(&n) {
            // XK_F1 is 0xffbe.
            return Some(0xffbe + n - 1);
        }
        return None;
    }

    let keysym = match token {
        "space" => 0x0020,
        "enter" | "return" => 0xff0d,
        "tab" => 0xff09,
        "escape" | "esc" => 0xff1b,
        "backspace" => 0xff08,
        "delete" => 0xffff,
        "insert" => 0xff63,
        "home" => 0xff50,
        "end" => 0xff57,
        "pageup" => 0xff55,
        "pagedown" => 0xff56,
        "up" => 0xff52,
        "down" => 0xff54,
        "left" => 0xff51,
        "right" => 0xff53,
        _ => return None,
    };
    Some(keysym)
}

/// Parse a `"mod+mod+key"` spec.
///
/// Tokens are case-insensitive; the final token is the key, everything
/// before it a modifier. Accepted modifiers: `ctrl`/`control`, `shift`,
/// `alt`/`option`, `super`/`meta`/`win`. Keys: letters, digits, `f1`-`f24`,
/// and a small named set (`space`, `enter`, `tab`, ...).
pub fn parse_spec(spec: &str) -> Result<ParsedBinding, HotkeyError> {
    let tokens: Vec<String> = spec
        .split('+')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let Some((key, modifier_tokens)) = tokens.split_last() else {
        return Err(HotkeyError::Binding {
            spec: spec.to_string(),
            reason: "empty binding".into(),
        });
    };

    let mut modifiers = 0u16;
    for token in modifier_tokens {
        modifiers |= match token.as_str() {
            "ctrl" | "control" => CONTROL_MASK,
            "shift" => SHIFT_MASK,
            "alt" | "option" => MOD1_MASK,
            "super" | "meta" | "win" => MOD4_MASK,
            other => {
                return Err(HotkeyError::Binding {
                    spec: spec.to_string(),
                    reason: format!("unknown modifier {other:?}"),
                });
            }
        };
    }

    let keysym = keysym_for(key).ok_or_else(|| HotkeyError::Binding {
        spec: spec.to_string(),
        reason: format!("unknown key {key:?}"),
    })?;

    Ok(ParsedBinding {
        raw: spec.to_string(),
        modifiers,
        keysym,
    })
}
