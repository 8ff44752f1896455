//! X11 integration: connection, key grabs, keycode resolution, and the
//! event thread that feeds key presses to the main async loop.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{self, GrabMode, ModMask, Window};
use x11rb::rust_connection::RustConnection;

use super::HotkeyError;
use super::keybinding::{Binding, ParsedBinding};

/// Lock modifier bits to mask during XGrabKey registration.
///
/// NumLock = Mod2 (bit 4), CapsLock = Lock (bit 1). Each grab is registered
/// 4 times with all combinations of these bits so hotkeys fire regardless
/// of lock state.
const LOCK_MASK: u16 = 0x0002; // LockMask (CapsLock)
const NUM_LOCK_MASK: u16 = 0x0010; // Mod2Mask (NumLock)
const LOCK_MASKS: [u16; 4] = [0, LOCK_MASK, NUM_LOCK_MASK, LOCK_MASK | NUM_LOCK_MASK];

/// X11 connection context for the hotkey listener.
pub struct X11Context {
    conn: Arc<RustConnection>,
    root: Window,
}

impl X11Context {
    /// Connect to the X11 display.
    pub fn connect() -> Result<Self, HotkeyError> {
        let (conn, screen_num) = RustConnection::connect(None)
            .map_err(|e| HotkeyError::X11(format!("connect failed: {e}")))?;

        let root = conn.setup().roots[screen_num].root;

        Ok(Self {
            conn: Arc::new(conn),
            root,
        })
    }

    /// Resolve a parsed binding's keysym to a concrete keycode via the
    /// server's keyboard mapping.
    pub fn resolve(&self, parsed: &ParsedBinding) -> Result<Binding, HotkeyError> {
        let setup = self.conn.setup();
        let min = setup.min_keycode;
        let count = setup.max_keycode - min + 1;

        let mapping = xproto::get_keyboard_mapping(&*self.conn, min, count)
            .map_err(|e| HotkeyError::X11(format!("get_keyboard_mapping: {e}")))?
            .reply()
            .map_err(|e| HotkeyError::X11(format!("get_keyboard_mapping reply: {e}")))?;

        let per_keycode = mapping.keysyms_per_keycode as usize;
        if per_keycode == 0 {
            return Err(HotkeyError::X11("empty keyboard mapping".into()));
        }

        for (index, keysyms) in mapping.keysyms.chunks(per_keycode).enumerate() {
            if keysyms.contains(&parsed.keysym) {
                return Ok(Binding {
                    raw: parsed.raw.clone(),
                    modifiers: parsed.modifiers,
                    keycode: min + index as u8,
                });
            }
        }

        Err(HotkeyError::UnmappedKey(parsed.raw.clone()))
    }

    /// Register a global key grab on the root window.
    ///
    /// Registers 4 grabs per binding (with/without NumLock/CapsLock).
    /// Returns `Ok(true)` on success, `Ok(false)` if a grab failed
    /// (another application holds it), `Err` on connection error.
    pub fn grab_key(&self, binding: &Binding) -> Result<bool, HotkeyError> {
        let mut all_ok = true;

        for &lock_mask in &LOCK_MASKS {
            let mods = ModMask::from(binding.modifiers | lock_mask);

            let cookie = xproto::grab_key(
                &*self.conn,
                true, // owner_events
                self.root,
                mods,
                binding.keycode,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
            )
            .map_err(|e| HotkeyError::X11(format!("grab_key send: {e}")))?;

            // Check for error reply (grab conflict).
            if let Err(e) = cookie.check() {
                tracing::warn!(
                    binding = %binding.raw,
                    lock_mask,
                    error = %e,
                    "XGrabKey failed, binding may conflict with another application"
                );
                all_ok = false;
            }
        }

        Ok(all_ok)
    }

    /// Unregister a global key grab from the root window.
    ///
    /// Ungrabs all 4 lock-mask variants. Best-effort, errors are logged.
    pub fn ungrab_key(&self, binding: &Binding) {
        for &lock_mask in &LOCK_MASKS {
            let mods = ModMask::from(binding.modifiers | lock_mask);

            if let Err(e) = xproto::ungrab_key(&*self.conn, binding.keycode, self.root, mods) {
                tracing::debug!(
                    binding = %binding.raw,
                    error = %e,
                    "XUngrabKey failed"
                );
            }
        }

        // Flush ungrab requests.
        if let Err(e) = self.conn.flush() {
            tracing::debug!(error = %e, "flush after ungrab failed");
        }
    }

    /// Get a shared reference to the X11 connection.
    pub fn conn(&self) -> &Arc<RustConnection> {
        &self.conn
    }
}

/// Spawn a dedicated thread that polls the X11 connection for events.
///
/// Uses `nix::poll()` on the X11 connection fd with a 100ms timeout.
/// When readable, drains all available events via `poll_for_event()`.
/// Checks the `stop` flag each iteration for clean shutdown.
///
/// Returns the receiver channel and the thread join handle.
pub fn spawn_event_thread(
    conn: Arc<RustConnection>,
    stop: Arc<AtomicBool>,
) -> (tokio::sync::mpsc::UnboundedReceiver<Event>, JoinHandle<()>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let handle = std::thread::Builder::new()
        .name("x11-events".into())
        .spawn(move || {
            let raw_fd = conn.stream().as_raw_fd();

            while !stop.load(Ordering::Relaxed) {
                // SAFETY: raw_fd is the X11 connection fd, valid while conn is alive.
                let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];

                match poll(&mut fds, PollTimeout::from(100u16)) {
                    Ok(0) => continue, // Timeout, check stop flag.
                    Ok(_) => {
                        // Drain all available events.
                        loop {
                            match conn.poll_for_event() {
                                Ok(Some(event)) => {
                                    if tx.send(event).is_err() {
                                        // Receiver dropped, shut down.
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::error!(error = %e, "X11 connection error");
                                    return;
                                }
                            }
                        }
                    }
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "poll error on X11 fd");
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn x11 event thread");

    (rx, handle)
}
