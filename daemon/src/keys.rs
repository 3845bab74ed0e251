/// Platform-neutral keyboard vocabulary shared by the hook, the suppressor and the
/// hotkey listener.
///
/// Key identities are Windows virtual-key codes.  They are plain `u32`s so the
/// decision logic can be exercised with synthetic events on every platform; the
/// Windows hook backend forwards `KBDLLHOOKSTRUCT::vkCode` unchanged.

// ── Virtual-key codes ─────────────────────────────────────────────────────────

pub mod vk {
    pub const BACK: u32 = 0x08;
    pub const TAB: u32 = 0x09;
    pub const RETURN: u32 = 0x0D;
    pub const SHIFT: u32 = 0x10;
    pub const CONTROL: u32 = 0x11;
    pub const MENU: u32 = 0x12;
    pub const PAUSE: u32 = 0x13;
    pub const ESCAPE: u32 = 0x1B;
    pub const SPACE: u32 = 0x20;
    pub const PRIOR: u32 = 0x21;
    pub const NEXT: u32 = 0x22;
    pub const END: u32 = 0x23;
    pub const HOME: u32 = 0x24;
    pub const LEFT: u32 = 0x25;
    pub const UP: u32 = 0x26;
    pub const RIGHT: u32 = 0x27;
    pub const DOWN: u32 = 0x28;
    pub const SNAPSHOT: u32 = 0x2C;
    pub const INSERT: u32 = 0x2D;
    pub const DELETE: u32 = 0x2E;
    pub const LWIN: u32 = 0x5B;
    pub const RWIN: u32 = 0x5C;
    pub const F1: u32 = 0x70;
    pub const F24: u32 = 0x87;
    pub const NUMLOCK: u32 = 0x90;
    pub const SCROLL: u32 = 0x91;
    pub const LSHIFT: u32 = 0xA0;
    pub const RSHIFT: u32 = 0xA1;
    pub const LCONTROL: u32 = 0xA2;
    pub const RCONTROL: u32 = 0xA3;
    pub const LMENU: u32 = 0xA4;
    pub const RMENU: u32 = 0xA5;
    pub const VOLUME_MUTE: u32 = 0xAD;
    pub const VOLUME_DOWN: u32 = 0xAE;
    pub const VOLUME_UP: u32 = 0xAF;
    pub const MEDIA_NEXT_TRACK: u32 = 0xB0;
    pub const MEDIA_PREV_TRACK: u32 = 0xB1;
    pub const MEDIA_STOP: u32 = 0xB2;
    pub const MEDIA_PLAY_PAUSE: u32 = 0xB3;
}

/// Browser, volume, media-transport and launch keys (`VK_BROWSER_BACK`..=`VK_LAUNCH_APP2`).
pub const MULTIMEDIA_KEYS: std::ops::RangeInclusive<u32> = 0xA6..=0xB7;

/// Multimedia keys that may be used as a hotkey terminal key, by config name.
const MEDIA_KEY_NAMES: &[(&str, u32)] = &[
    ("volumemute", vk::VOLUME_MUTE),
    ("volumedown", vk::VOLUME_DOWN),
    ("volumeup", vk::VOLUME_UP),
    ("nexttrack", vk::MEDIA_NEXT_TRACK),
    ("prevtrack", vk::MEDIA_PREV_TRACK),
    ("mediastop", vk::MEDIA_STOP),
    ("playpause", vk::MEDIA_PLAY_PAUSE),
];

/// Returns `true` for Ctrl, Alt, Shift and Win in any of their generic or
/// left/right-specific forms.
pub fn is_modifier(code: u32) -> bool {
    MODIFIER_CODES.contains(&code)
}

/// Converts a terminal-key name (e.g. `"l"`, `"F8"`, `"pgup"`, `"volumeup"`) to a
/// virtual-key code.
///
/// Matching is case-insensitive.  Returns `None` for modifier names and anything
/// unrecognised.
pub fn parse_key(name: &str) -> Option<u32> {
    let name = name.trim().to_ascii_lowercase();
    let code = match name.as_str() {
        "space" => vk::SPACE,
        "enter" | "return" => vk::RETURN,
        "escape" | "esc" => vk::ESCAPE,
        "tab" => vk::TAB,
        "backspace" => vk::BACK,
        "delete" | "del" => vk::DELETE,
        "insert" | "ins" => vk::INSERT,
        "home" => vk::HOME,
        "end" => vk::END,
        "pageup" | "pgup" => vk::PRIOR,
        "pagedown" | "pgdn" => vk::NEXT,
        "up" => vk::UP,
        "down" => vk::DOWN,
        "left" => vk::LEFT,
        "right" => vk::RIGHT,
        "numlock" => vk::NUMLOCK,
        "scrolllock" => vk::SCROLL,
        "pause" => vk::PAUSE,
        "printscreen" | "prtsc" => vk::SNAPSHOT,
        s if s.len() == 1 => {
            let c = s.chars().next()?;
            if !c.is_ascii_alphanumeric() {
                return None;
            }
            // 'A'=0x41…'Z'=0x5A; '0'=0x30…'9'=0x39, identical to the VK codes.
            c.to_ascii_uppercase() as u32
        }
        s if s.starts_with('f') && s.len() <= 3 => {
            let n: u32 = s[1..].parse().ok()?;
            if !(1..=24).contains(&n) {
                return None;
            }
            vk::F1 + n - 1
        }
        s => MEDIA_KEY_NAMES
            .iter()
            .find(|(media, _)| *media == s)
            .map(|(_, code)| *code)?,
    };
    Some(code)
}

/// Human-readable name for a terminal key, the inverse of [`parse_key`].
pub fn key_name(code: u32) -> String {
    match code {
        0x30..=0x39 | 0x41..=0x5A => char::from_u32(code).map(String::from).unwrap_or_default(),
        vk::F1..=vk::F24 => format!("F{}", code - vk::F1 + 1),
        vk::SPACE => "Space".into(),
        vk::RETURN => "Enter".into(),
        vk::ESCAPE => "Escape".into(),
        vk::TAB => "Tab".into(),
        vk::BACK => "Backspace".into(),
        vk::DELETE => "Delete".into(),
        vk::INSERT => "Insert".into(),
        vk::HOME => "Home".into(),
        vk::END => "End".into(),
        vk::PRIOR => "PageUp".into(),
        vk::NEXT => "PageDown".into(),
        vk::UP => "Up".into(),
        vk::DOWN => "Down".into(),
        vk::LEFT => "Left".into(),
        vk::RIGHT => "Right".into(),
        vk::NUMLOCK => "NumLock".into(),
        vk::SCROLL => "ScrollLock".into(),
        vk::PAUSE => "Pause".into(),
        vk::SNAPSHOT => "PrintScreen".into(),
        vk::VOLUME_MUTE => "VolumeMute".into(),
        vk::VOLUME_DOWN => "VolumeDown".into(),
        vk::VOLUME_UP => "VolumeUp".into(),
        vk::MEDIA_NEXT_TRACK => "NextTrack".into(),
        vk::MEDIA_PREV_TRACK => "PrevTrack".into(),
        vk::MEDIA_STOP => "MediaStop".into(),
        vk::MEDIA_PLAY_PAUSE => "PlayPause".into(),
        other => format!("VK{other:#04X}"),
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Down,
    Up,
}

/// One raw keyboard event as delivered by the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Virtual-key code.
    pub vk: u32,
    /// Hardware scan code (informational; decisions are made on `vk`).
    pub scan_code: u32,
    pub direction: KeyDirection,
}

impl KeyEvent {
    pub fn down(vk: u32) -> Self {
        Self { vk, scan_code: 0, direction: KeyDirection::Down }
    }

    pub fn up(vk: u32) -> Self {
        Self { vk, scan_code: 0, direction: KeyDirection::Up }
    }

    pub fn is_down(&self) -> bool {
        self.direction == KeyDirection::Down
    }
}

// ── Modifier tracking ─────────────────────────────────────────────────────────

/// Which modifier keys are held, with left/right variants folded together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModifierState {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub win: bool,
}

impl ModifierState {
    pub const NONE: Self = Self { ctrl: false, alt: false, shift: false, win: false };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

impl std::fmt::Display for ModifierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [(self.ctrl, "Ctrl"), (self.alt, "Alt"), (self.shift, "Shift"), (self.win, "Win")];
        let mut first = true;
        for (_, name) in names.iter().filter(|(held, _)| *held) {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// Physically-held key set, updated from every raw event whether or not the
/// event was later suppressed.
#[derive(Debug, Clone, Default)]
pub struct KeyTracker {
    down: [u64; 4],
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event` and returns `true` if it is a key-down for a key that was
    /// already held (auto-repeat).
    pub fn apply(&mut self, event: &KeyEvent) -> bool {
        let Some((word, bit)) = slot(event.vk) else {
            return false;
        };
        let was_down = self.down[word] & bit != 0;
        match event.direction {
            KeyDirection::Down => self.down[word] |= bit,
            KeyDirection::Up => self.down[word] &= !bit,
        }
        event.is_down() && was_down
    }

    pub fn is_down(&self, code: u32) -> bool {
        slot(code).is_some_and(|(word, bit)| self.down[word] & bit != 0)
    }

    pub fn modifiers(&self) -> ModifierState {
        let any = |codes: &[u32]| codes.iter().any(|c| self.is_down(*c));
        ModifierState {
            ctrl: any(&[vk::CONTROL, vk::LCONTROL, vk::RCONTROL]),
            alt: any(&[vk::MENU, vk::LMENU, vk::RMENU]),
            shift: any(&[vk::SHIFT, vk::LSHIFT, vk::RSHIFT]),
            win: any(&[vk::LWIN, vk::RWIN]),
        }
    }

    /// Forgets every held modifier.  Used when their releases are known to go to
    /// another desktop (secure attention sequence, session lock).
    pub fn release_modifiers(&mut self) {
        for code in MODIFIER_CODES {
            if let Some((word, bit)) = slot(code) {
                self.down[word] &= !bit;
            }
        }
    }

    pub fn clear(&mut self) {
        self.down = [0; 4];
    }
}

const MODIFIER_CODES: [u32; 11] = [
    vk::SHIFT,
    vk::CONTROL,
    vk::MENU,
    vk::LWIN,
    vk::RWIN,
    vk::LSHIFT,
    vk::RSHIFT,
    vk::LCONTROL,
    vk::RCONTROL,
    vk::LMENU,
    vk::RMENU,
];

fn slot(code: u32) -> Option<(usize, u64)> {
    (code < 256).then(|| ((code / 64) as usize, 1u64 << (code % 64)))
}
