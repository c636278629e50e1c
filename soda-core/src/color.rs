use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// On/off state of the three channels of an RGB LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown color name: {0:?}")]
pub struct UnknownColor(pub String);

impl Color {
    pub const BLACK: Color = Color::rgb(false, false, false);
    pub const RED: Color = Color::rgb(true, false, false);
    pub const GREEN: Color = Color::rgb(false, true, false);
    pub const BLUE: Color = Color::rgb(false, false, true);
    pub const YELLOW: Color = Color::rgb(true, true, false);
    pub const CYAN: Color = Color::rgb(false, true, true);
    pub const MAGENTA: Color = Color::rgb(true, false, true);
    pub const WHITE: Color = Color::rgb(true, true, true);

    // Names must match the "Color" values the cloud application sends.
    const NAMED: [(&'static str, Color); 8] = [
        ("black", Color::BLACK),
        ("red", Color::RED),
        ("green", Color::GREEN),
        ("blue", Color::BLUE),
        ("yellow", Color::YELLOW),
        ("cyan", Color::CYAN),
        ("magenta", Color::MAGENTA),
        ("white", Color::WHITE),
    ];

    pub const fn rgb(red: bool, green: bool, blue: bool) -> Self {
        Self { red, green, blue }
    }

    /// Every channel combination has a name, so this never fails.
    pub fn name(self) -> &'static str {
        Self::NAMED
            .iter()
            .find(|(_, color)| *color == self)
            .map(|(name, _)| *name)
            .unwrap_or("black")
    }
}

impl FromStr for Color {
    type Err = UnknownColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMED
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, color)| *color)
            .ok_or_else(|| UnknownColor(s.to_owned()))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
