/// Collaborators notified after the state machine commits a transition.
use tracing::info;

use crate::config::Settings;
use crate::hotkey::HotkeyBinding;

/// Receives committed transitions.  All methods run on the main loop after the
/// state has been committed; none of them can veto a transition.
pub trait LockObserver: Send {
    fn on_locked(&mut self) {}
    fn on_unlocked(&mut self) {}

    /// A lock attempt failed and the keyboard stayed unlocked.
    fn on_failure(&mut self, _error: &str) {}

    fn on_reconfigured(&mut self, _settings: &Settings) {}
}

/// Delivers a user-facing title/message pair (toast, balloon, log line).
pub trait Notifier: Send {
    fn notify(&self, title: &str, message: &str);
}

/// Notifier that writes a structured log line.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!(title, message, "notification");
    }
}

pub const LOCKED_TITLE: &str = "Keyboard Locked";
pub const UNLOCKED_TITLE: &str = "Keyboard Unlocked";
pub const ERROR_TITLE: &str = "PawGate";

/// Turns transitions into notifications.  Lock and unlock notices honour
/// `notifications_enabled`; failures are always reported.
pub struct NotificationObserver {
    notifier: Box<dyn Notifier>,
    enabled: bool,
    hotkey: Option<HotkeyBinding>,
}

impl NotificationObserver {
    pub fn new(notifier: Box<dyn Notifier>, settings: &Settings) -> Self {
        Self {
            notifier,
            enabled: settings.notifications_enabled,
            hotkey: settings.hotkey,
        }
    }

    fn unlock_hint(&self) -> String {
        match self.hotkey {
            Some(binding) => format!("Press {binding} to unlock"),
            None => "Click anywhere on the overlay to unlock".to_string(),
        }
    }
}

impl LockObserver for NotificationObserver {
    fn on_locked(&mut self) {
        if self.enabled {
            self.notifier.notify(LOCKED_TITLE, &self.unlock_hint());
        }
    }

    fn on_unlocked(&mut self) {
        if self.enabled {
            self.notifier.notify(UNLOCKED_TITLE, "Keyboard input is enabled again");
        }
    }

    fn on_failure(&mut self, error: &str) {
        self.notifier.notify(ERROR_TITLE, &format!("Could not lock the keyboard: {error}"));
    }

    fn on_reconfigured(&mut self, settings: &Settings) {
        self.enabled = settings.notifications_enabled;
        self.hotkey = settings.hotkey;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<(String, String)>>>);

    impl Notifier for Captured {
        fn notify(&self, title: &str, message: &str) {
            self.0.lock().unwrap().push((title.to_string(), message.to_string()));
        }
    }

    impl Captured {
        fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn observer(settings: &Settings) -> (NotificationObserver, Captured) {
        let captured = Captured::default();
        (NotificationObserver::new(Box::new(captured.clone()), settings), captured)
    }

    #[test]
    fn lock_notification_names_the_hotkey() {
        let (mut o, captured) = observer(&Settings::default());
        o.on_locked();
        assert_eq!(
            captured.take(),
            vec![("Keyboard Locked".to_string(), "Press Ctrl+B to unlock".to_string())]
        );
    }

    #[test]
    fn disabled_notifications_are_silent_except_failures() {
        let settings = Settings { notifications_enabled: false, ..Settings::default() };
        let (mut o, captured) = observer(&settings);
        o.on_locked();
        o.on_unlocked();
        assert!(captured.take().is_empty());

        o.on_failure("hook refused");
        let sent = captured.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("hook refused"));
    }

    #[test]
    fn reconfigure_updates_hint_and_switch() {
        let (mut o, captured) = observer(&Settings::default());
        let settings = Settings {
            hotkey: Some("ctrl+shift+l".parse().unwrap()),
            ..Settings::default()
        };
        o.on_reconfigured(&settings);
        o.on_locked();
        assert_eq!(captured.take()[0].1, "Press Ctrl+Shift+L to unlock");

        o.on_reconfigured(&Settings { hotkey: None, ..Settings::default() });
        o.on_locked();
        assert_eq!(captured.take()[0].1, "Click anywhere on the overlay to unlock");
    }
}
