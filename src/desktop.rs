//! Desktop capability: clipboard access and keystroke injection.
//!
//! Both are subprocess-backed (`xclip` for the clipboard, `xdotool` for key
//! injection) and best-effort from the daemon's point of view; the event
//! loop turns failures into operator-visible reports. The [`Desktop`] trait
//! is the seam the event loop is tested through.

use async_trait::async_trait;
use thiserror::Error;

/// Combo injected when a profile enables `auto_paste` without its own keys.
pub const DEFAULT_PASTE_KEYS: &str = "ctrl+v";

/// Combo injected for the pre-capture copy-selection action.
const COPY_KEYS: &str = "ctrl+c";

#[derive(Debug, Error)]
pub enum DesktopError {
    #[error("clipboard access failed: {0}")]
    Clipboard(String),
    #[error("key injection failed: {0}")]
    Keys(String),
}

/// OS-level primitives the event loop needs around a dispatch.
#[async_trait]
pub trait Desktop: Send + Sync {
    /// Read the clipboard. An empty or unreadable clipboard reads as `""`.
    async fn read_clipboard(&self) -> Result<String, DesktopError>;

    /// Replace the clipboard contents.
    async fn write_clipboard(&self, text: &str) -> Result<(), DesktopError>;

    /// Inject a key combo (e.g. `"ctrl+v"`) into the focused window.
    async fn send_keys(&self, combo: &str) -> Result<(), DesktopError>;

    /// Inject the copy-selection combo.
    async fn trigger_copy(&self) -> Result<(), DesktopError>;
}

/// X11 implementation via `xclip` and `xdotool`.
pub struct XDesktop;

impl XDesktop {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Desktop for XDesktop {
    async fn read_clipboard(&self) -> Result<String, DesktopError> {
        let output = tokio::process::Command::new("xclip")
            .args(["-selection", "clipboard", "-o"])
            .output()
            .await
            .map_err(|e| DesktopError::Clipboard(format!("xclip not runnable: {e}")))?;

        if !output.status.success() {
            // xclip exits non-zero when no text selection is available;
            // that reads as an empty clipboard, not an error.
            tracing::debug!(status = %output.status, "xclip -o reported no clipboard text");
            return Ok(String::new());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn write_clipboard(&self, text: &str) -> Result<(), DesktopError> {
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new("xclip")
            .args(["-selection", "clipboard"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| DesktopError::Clipboard(format!("xclip not runnable: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| DesktopError::Clipboard(e.to_string()))?;
            // Drop stdin to close the pipe so xclip can finish.
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DesktopError::Clipboard(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(DesktopError::Clipboard(format!(
                "xclip exited with {status}"
            )))
        }
    }

    async fn send_keys(&self, combo: &str) -> Result<(), DesktopError> {
        let status = tokio::process::Command::new("xdotool")
            .args(["key", "--clearmodifiers", combo])
            .status()
            .await
            .map_err(|e| DesktopError::Keys(format!("xdotool not runnable: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(DesktopError::Keys(format!(
                "xdotool key {combo} exited with {status}"
            )))
        }
    }

    async fn trigger_copy(&self) -> Result<(), DesktopError> {
        self.send_keys(COPY_KEYS).await
    }
}
