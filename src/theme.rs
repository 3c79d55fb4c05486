//! Color theming for terminal output.
//!
//! Colors are disabled with `--no-color` or the `NO_COLOR` environment
//! variable; every helper then returns plain text.

use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally. Call early in `main`.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Semantic styles for run output.
pub trait Themed: std::fmt::Display + Sized {
    /// A found value or a successful outcome (bold green).
    fn success(&self) -> String {
        if colors_enabled() {
            use owo_colors::OwoColorize;
            format!("{}", self.green().bold())
        } else {
            self.to_string()
        }
    }

    /// A failed step (bold red).
    fn failure(&self) -> String {
        if colors_enabled() {
            use owo_colors::OwoColorize;
            format!("{}", self.red().bold())
        } else {
            self.to_string()
        }
    }

    /// Labels and hostnames (cyan).
    fn label(&self) -> String {
        if colors_enabled() {
            use owo_colors::OwoColorize;
            format!("{}", self.cyan())
        } else {
            self.to_string()
        }
    }

    /// Secondary text such as timestamps and source locations (dimmed).
    fn muted(&self) -> String {
        if colors_enabled() {
            use owo_colors::OwoColorize;
            format!("{}", self.dimmed())
        } else {
            self.to_string()
        }
    }
}

impl<T: std::fmt::Display> Themed for T {}

/// Printable form of a found value: the text itself when it is UTF-8,
/// otherwise hex.
pub fn display_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) => format!("{:?}", text),
        Err(_) => format!("0x{}", hex::encode(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(b"abc"), "\"abc\"");
        assert_eq!(display_value(&[0xff, 0x00]), "0xff00");
    }

    #[test]
    fn test_disabled_colors_are_plain() {
        disable_colors();
        assert!(!colors_enabled());
        assert_eq!("found".success(), "found");
        assert_eq!("bind".failure(), "bind");
        assert_eq!("rig-1".label(), "rig-1");
        assert_eq!("12:00".muted(), "12:00");
    }
}
