//! ANSI coloring for terminal output.
//!
//! Coloring is on by default. [`init_from_env`] turns it off when stderr is
//! not a terminal or `NO_COLOR` is set.

use std::{
    env, fmt,
    io::{self, IsTerminal as _},
    sync::atomic::{AtomicBool, Ordering},
};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Decides once whether colored output should be emitted.
pub fn init_from_env() {
    let enabled = io::stderr().is_terminal() && env::var_os("NO_COLOR").is_none();
    ENABLED.store(enabled, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    DarkGray,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
}

impl Color {
    fn fg(self) -> u8 {
        match self {
            Self::DarkGray => 90,
            Self::Red => 31,
            Self::Green => 32,
            Self::Yellow => 33,
            Self::Blue => 34,
            Self::Magenta => 35,
        }
    }

    /// Wraps `value` so that it renders bold in this color.
    pub fn paint<T>(self, value: T) -> Painted<T> {
        self.paint_if(ENABLED.load(Ordering::Relaxed), value)
    }

    fn paint_if<T>(self, enabled: bool, value: T) -> Painted<T> {
        Painted {
            color: enabled.then_some(self),
            value,
        }
    }
}

/// A value rendered with an optional foreground color.
pub struct Painted<T> {
    color: Option<Color>,
    value: T,
}

impl<T> fmt::Display for Painted<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(color) = self.color else {
            return self.value.fmt(f);
        };
        write!(f, "\x1B[{};1m", color.fg())?;
        self.value.fmt(f)?;
        f.write_str("\x1B[0m")
    }
}
