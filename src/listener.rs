//! Hotkey event loop.
//!
//! Owns the slot registry (binding grabs keyed by slot id, with explicit
//! `register_all`/`unregister_all` lifecycle), classifies incoming X11 key
//! events, and runs each firing through capture, dispatch, and delivery.
//!
//! Invocations for one slot are strictly serialized: a firing that arrives
//! while that slot is still working is dropped, never queued. Firings for
//! different slots run as independent tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use x11rb::protocol::Event;

use crate::config::PromptProfile;
use crate::desktop::{self, Desktop, DesktopError};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::hotkey::HotkeyError;
use crate::hotkey::keybinding::{self, Binding, MODIFIER_FILTER, ParsedBinding};
use crate::hotkey::x11::{self, X11Context};

/// Delay between injecting the copy combo and reading the clipboard, giving
/// the focused application time to service the copy.
const COPY_SETTLE: Duration = Duration::from_millis(150);

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("unknown hotkey slot {0}")]
    UnknownSlot(u32),
    #[error(transparent)]
    Desktop(#[from] DesktopError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

struct SlotEntry {
    profile: Arc<PromptProfile>,
    parsed: ParsedBinding,
    /// Set while an invocation for this slot is in flight.
    busy: Arc<AtomicBool>,
    /// Present once `register_all` has grabbed the binding.
    grabbed: Option<Binding>,
}

/// Process-wide registry of hotkey slots.
pub struct SlotRegistry {
    slots: HashMap<u32, SlotEntry>,
}

impl SlotRegistry {
    pub fn new(profiles: &[Arc<PromptProfile>]) -> Result<Self, HotkeyError> {
        let mut slots = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            let parsed = keybinding::parse_spec(&profile.binding)?;
            slots.insert(
                profile.slot_id,
                SlotEntry {
                    profile: profile.clone(),
                    parsed,
                    busy: Arc::new(AtomicBool::new(false)),
                    grabbed: None,
                },
            );
        }
        Ok(Self { slots })
    }

    pub fn profile(&self, slot_id: u32) -> Option<&Arc<PromptProfile>> {
        self.slots.get(&slot_id).map(|entry| &entry.profile)
    }

    /// Grab every slot's binding. Returns the number of bindings grabbed
    /// cleanly; partial grab conflicts are logged and tolerated.
    pub fn register_all(&mut self, x11: &X11Context) -> Result<u32, HotkeyError> {
        let mut bindings_ok = 0;
        for entry in self.slots.values_mut() {
            let binding = x11.resolve(&entry.parsed)?;
            if x11.grab_key(&binding)? {
                bindings_ok += 1;
            }
            tracing::info!(
                slot = entry.profile.slot_id,
                binding = %binding.raw,
                keycode = binding.keycode,
                "hotkey registered"
            );
            entry.grabbed = Some(binding);
        }
        Ok(bindings_ok)
    }

    /// Release every grabbed binding.
    pub fn unregister_all(&mut self, x11: &X11Context) {
        for entry in self.slots.values_mut() {
            if let Some(binding) = entry.grabbed.take() {
                x11.ungrab_key(&binding);
            }
        }
    }

    /// Map a key event's keycode + (lock-filtered) modifiers to a slot.
    fn classify(&self, keycode: u8, modifiers: u16) -> Option<u32> {
        self.slots.values().find_map(|entry| {
            let binding = entry.grabbed.as_ref()?;
            (binding.keycode == keycode && binding.modifiers == modifiers)
                .then_some(entry.profile.slot_id)
        })
    }

    #[cfg(test)]
    fn force_grabbed(&mut self, slot_id: u32, keycode: u8) {
        let entry = self.slots.get_mut(&slot_id).unwrap();
        entry.grabbed = Some(Binding {
            raw: entry.parsed.raw.clone(),
            modifiers: entry.parsed.modifiers,
            keycode,
        });
    }
}

/// Run the capture -> dispatch -> deliver sequence for one firing.
///
/// On dispatch failure nothing is written to the clipboard; the error is
/// the operator-visible report (and the exit code in run-once mode).
pub async fn run_invocation(
    profile: &PromptProfile,
    dispatcher: &Dispatcher,
    desktop: &dyn Desktop,
) -> Result<(), InvocationError> {
    if profile.auto_copy {
        desktop.trigger_copy().await?;
        tokio::time::sleep(COPY_SETTLE).await;
    }

    let input = desktop.read_clipboard().await?;
    tracing::debug!(slot = profile.slot_id, chars = input.len(), "captured input");

    let response = dispatcher.dispatch(profile, &input).await?;
    desktop.write_clipboard(&response).await?;
    tracing::info!(
        slot = profile.slot_id,
        chars = response.len(),
        "response copied to clipboard"
    );

    if profile.auto_paste {
        let keys = profile
            .paste_keys
            .as_deref()
            .unwrap_or(desktop::DEFAULT_PASTE_KEYS);
        desktop.send_keys(keys).await?;
    }

    Ok(())
}

/// Run one slot's sequence without registering any listener, for
/// `--run-hotkey N`.
pub async fn run_once(
    registry: &SlotRegistry,
    slot_id: u32,
    dispatcher: &Dispatcher,
    desktop: &dyn Desktop,
) -> Result<(), InvocationError> {
    let profile = registry
        .profile(slot_id)
        .ok_or(InvocationError::UnknownSlot(slot_id))?;
    run_invocation(profile, dispatcher, desktop).await
}

/// Persistent listener: consumes classified firings until shutdown.
pub struct EventLoop {
    registry: SlotRegistry,
    dispatcher: Arc<Dispatcher>,
    desktop: Arc<dyn Desktop>,
}

impl EventLoop {
    pub fn new(
        registry: SlotRegistry,
        dispatcher: Arc<Dispatcher>,
        desktop: Arc<dyn Desktop>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            desktop,
        }
    }

    /// Register all bindings and listen until Ctrl-C or the X11 connection
    /// drops. Always unregisters before returning.
    pub async fn run(mut self, x11: X11Context) -> Result<(), HotkeyError> {
        let bindings_ok = self.registry.register_all(&x11)?;
        if bindings_ok == 0 {
            self.registry.unregister_all(&x11);
            return Err(HotkeyError::X11(
                "no binding could be grabbed cleanly".into(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (mut events, pump) = x11::spawn_event_thread(x11.conn().clone(), stop.clone());
        tracing::info!(slots = self.registry.slots.len(), "listening for hotkeys, Ctrl+C to quit");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(Event::KeyPress(press)) => {
                        let modifiers = u16::from(press.state) & MODIFIER_FILTER;
                        if let Some(slot_id) = self.registry.classify(press.detail, modifiers) {
                            self.handle_firing(slot_id);
                        }
                    }
                    Some(_) => {}
                    None => {
                        tracing::error!("X11 event stream closed");
                        break;
                    }
                },
            }
        }

        stop.store(true, Ordering::Relaxed);
        self.registry.unregister_all(&x11);
        // The pump exits within its next 100ms poll tick.
        let _ = pump.join();
        Ok(())
    }

    /// Start an invocation for a firing, unless that slot is already in
    /// flight (in which case the firing is dropped, not queued).
    fn handle_firing(&self, slot_id: u32) -> Option<tokio::task::JoinHandle<()>> {
        let entry = self.registry.slots.get(&slot_id)?;
        if entry.busy.swap(true, Ordering::SeqCst) {
            tracing::debug!(slot = slot_id, "firing dropped, invocation still in flight");
            return None;
        }

        let profile = entry.profile.clone();
        let busy = entry.busy.clone();
        let dispatcher = self.dispatcher.clone();
        let desktop = self.desktop.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_invocation(&profile, dispatcher.as_ref(), desktop.as_ref()).await {
                tracing::error!(slot = profile.slot_id, error = %e, "hotkey invocation failed");
            }
            busy.store(false, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Clock, LoadCommand, LoadStrategy, ModelGate, SystemClock};
    use crate::server::{ChatError, ChatRequest, InferenceBackend};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeDesktop {
        clipboard: Mutex<String>,
        ops: Mutex<Vec<String>>,
    }

    impl FakeDesktop {
        fn with_clipboard(text: &str) -> Arc<Self> {
            Arc::new(Self {
                clipboard: Mutex::new(text.to_string()),
                ops: Mutex::new(Vec::new()),
            })
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn writes(&self) -> usize {
            self.ops()
                .iter()
                .filter(|op| op.starts_with("write:"))
                .count()
        }
    }

    #[async_trait]
    impl Desktop for FakeDesktop {
        async fn read_clipboard(&self) -> Result<String, DesktopError> {
            self.ops.lock().unwrap().push("read".into());
            Ok(self.clipboard.lock().unwrap().clone())
        }

        async fn write_clipboard(&self, text: &str) -> Result<(), DesktopError> {
            self.ops.lock().unwrap().push(format!("write:{text}"));
            *self.clipboard.lock().unwrap() = text.to_string();
            Ok(())
        }

        async fn send_keys(&self, combo: &str) -> Result<(), DesktopError> {
            self.ops.lock().unwrap().push(format!("keys:{combo}"));
            Ok(())
        }

        async fn trigger_copy(&self) -> Result<(), DesktopError> {
            self.ops.lock().unwrap().push("copy".into());
            Ok(())
        }
    }

    struct EchoBackend {
        reply: &'static str,
    }

    #[async_trait]
    impl InferenceBackend for EchoBackend {
        async fn chat(&self, _request: &ChatRequest) -> Result<String, ChatError> {
            Ok(self.reply.to_string())
        }

        async fn loaded_models(&self) -> Result<Vec<String>, ChatError> {
            Ok(vec![])
        }
    }

    struct NoopLoad;

    #[async_trait]
    impl LoadCommand for NoopLoad {
        async fn load(&self, _model_id: &str) -> Result<(), String> {
            Ok(())
        }
    }

    fn dispatcher(reply: &'static str) -> Arc<Dispatcher> {
        let backend = Arc::new(EchoBackend { reply });
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let gate = ModelGate::new(
            backend.clone(),
            Arc::new(NoopLoad),
            clock,
            ModelGate::DEFAULT_POLL_INTERVAL,
        );
        Arc::new(Dispatcher::new(
            backend,
            gate,
            LoadStrategy::Off,
            Duration::from_secs(60),
        ))
    }

    fn profile(slot_id: u32, binding: &str) -> Arc<PromptProfile> {
        Arc::new(PromptProfile {
            slot_id,
            binding: binding.into(),
            system_prompt: "Translate to French.".into(),
            model_id: "m1".into(),
            auto_copy: false,
            auto_paste: false,
            paste_keys: None,
        })
    }

    #[tokio::test]
    async fn invocation_copies_response_without_key_injection() {
        let desktop = FakeDesktop::with_clipboard("Hello");
        let dispatcher = dispatcher("Bonjour");
        let profile = profile(1, "ctrl+shift+1");

        run_invocation(&profile, &dispatcher, desktop.as_ref())
            .await
            .unwrap();

        assert_eq!(*desktop.clipboard.lock().unwrap(), "Bonjour");
        assert_eq!(desktop.ops(), vec!["read", "write:Bonjour"]);
    }

    #[tokio::test]
    async fn auto_copy_precedes_the_read_and_auto_paste_follows_the_write() {
        let desktop = FakeDesktop::with_clipboard("Hello");
        let dispatcher = dispatcher("Bonjour");
        let profile = Arc::new(PromptProfile {
            auto_copy: true,
            auto_paste: true,
            ..(*profile(1, "ctrl+shift+1")).clone()
        });

        run_invocation(&profile, &dispatcher, desktop.as_ref())
            .await
            .unwrap();

        assert_eq!(
            desktop.ops(),
            vec!["copy", "read", "write:Bonjour", "keys:ctrl+v"]
        );
    }

    #[tokio::test]
    async fn custom_paste_keys_override_the_default_combo() {
        let desktop = FakeDesktop::with_clipboard("Hello");
        let dispatcher = dispatcher("Bonjour");
        let profile = Arc::new(PromptProfile {
            auto_paste: true,
            paste_keys: Some("ctrl+shift+v".into()),
            ..(*profile(1, "ctrl+shift+1")).clone()
        });

        run_invocation(&profile, &dispatcher, desktop.as_ref())
            .await
            .unwrap();
        assert!(desktop.ops().contains(&"keys:ctrl+shift+v".to_string()));
    }

    #[tokio::test]
    async fn empty_clipboard_fails_without_clipboard_mutation() {
        let desktop = FakeDesktop::with_clipboard("   ");
        let dispatcher = dispatcher("Bonjour");
        let profile = profile(1, "ctrl+shift+1");

        let err = run_invocation(&profile, &dispatcher, desktop.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvocationError::Dispatch(DispatchError::EmptyInput)
        ));
        assert_eq!(desktop.writes(), 0);
    }

    #[tokio::test]
    async fn second_firing_for_a_busy_slot_is_dropped() {
        let registry = SlotRegistry::new(&[profile(1, "ctrl+shift+1")]).unwrap();
        let desktop = FakeDesktop::with_clipboard("Hello");
        let event_loop = EventLoop::new(registry, dispatcher("Bonjour"), desktop.clone());

        let first = event_loop.handle_firing(1).expect("first firing accepted");
        assert!(event_loop.handle_firing(1).is_none(), "second firing drops");

        first.await.unwrap();
        assert_eq!(desktop.writes(), 1);

        // Slot is idle again once the invocation finished.
        let third = event_loop.handle_firing(1).expect("slot idle again");
        third.await.unwrap();
        assert_eq!(desktop.writes(), 2);
    }

    #[tokio::test]
    async fn distinct_slots_fire_independently() {
        let registry =
            SlotRegistry::new(&[profile(1, "ctrl+shift+1"), profile(2, "ctrl+shift+2")]).unwrap();
        let desktop = FakeDesktop::with_clipboard("Hello");
        let event_loop = EventLoop::new(registry, dispatcher("Bonjour"), desktop.clone());

        let first = event_loop.handle_firing(1).expect("slot 1 accepted");
        let second = event_loop.handle_firing(2).expect("slot 2 accepted");
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(desktop.writes(), 2);
    }

    #[tokio::test]
    async fn failed_invocation_returns_the_slot_to_idle() {
        let registry = SlotRegistry::new(&[profile(1, "ctrl+shift+1")]).unwrap();
        let desktop = FakeDesktop::with_clipboard(""); // EmptyInput failure
        let event_loop = EventLoop::new(registry, dispatcher("Bonjour"), desktop.clone());

        event_loop.handle_firing(1).unwrap().await.unwrap();
        assert_eq!(desktop.writes(), 0);
        assert!(event_loop.handle_firing(1).is_some());
    }

    #[tokio::test]
    async fn run_once_rejects_unknown_slots() {
        let registry = SlotRegistry::new(&[profile(1, "ctrl+shift+1")]).unwrap();
        let desktop = FakeDesktop::with_clipboard("Hello");

        let err = run_once(&registry, 7, &dispatcher("Bonjour"), desktop.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::UnknownSlot(7)));
        assert!(desktop.ops().is_empty());
    }

    #[test]
    fn classify_matches_keycode_and_modifiers() {
        let mut registry =
            SlotRegistry::new(&[profile(1, "ctrl+shift+1"), profile(2, "ctrl+shift+2")]).unwrap();
        registry.force_grabbed(1, 10);
        registry.force_grabbed(2, 11);

        let mods = keybinding::CONTROL_MASK | keybinding::SHIFT_MASK;
        assert_eq!(registry.classify(10, mods), Some(1));
        assert_eq!(registry.classify(11, mods), Some(2));
        // Wrong modifiers or unknown keycode match nothing.
        assert_eq!(registry.classify(10, keybinding::CONTROL_MASK), None);
        assert_eq!(registry.classify(99, mods), None);
    }
}
