//! Presence records: who is looking at which panel, and where their pointer is.
//!
//! Never persisted. Coordinates are normalized to `0..=100` of the panel so
//! they mean the same thing on every viewport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RGBA color for a remote cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    /// Pick a palette entry from the random bits of a v4 client id.
    pub fn from_client_id(id: Uuid) -> Self {
        let slot = (id.as_u128() % CURSOR_PALETTE.len() as u128) as usize;
        CURSOR_PALETTE[slot]
    }

    /// `#rrggbb`, for panels that want CSS-style colors.
    pub fn to_hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        CURSOR_PALETTE[0]
    }
}

/// Fixed cursor palette. Red team reds first, then blue team blues, then accents.
pub const CURSOR_PALETTE: [CursorColor; 8] = [
    CursorColor::rgb(0.94, 0.27, 0.27),
    CursorColor::rgb(0.23, 0.51, 0.96),
    CursorColor::rgb(0.06, 0.73, 0.51),
    CursorColor::rgb(0.96, 0.62, 0.04),
    CursorColor::rgb(0.55, 0.36, 0.96),
    CursorColor::rgb(0.93, 0.28, 0.60),
    CursorColor::rgb(0.08, 0.72, 0.65),
    CursorColor::rgb(0.98, 0.45, 0.09),
];

/// One client's presence on one panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: Uuid,
    pub display_name: String,
    pub color: CursorColor,
    /// Horizontal position, 0..=100 of the panel width.
    pub x: f32,
    /// Vertical position, 0..=100 of the panel height.
    pub y: f32,
    pub panel_id: String,
    /// Unix millis when this client joined the panel.
    pub joined_at: u64,
    /// Unix millis of the last broadcast.
    pub last_seen_at: u64,
}

impl PresenceRecord {
    pub fn new(client_id: Uuid, display_name: impl Into<String>, panel_id: impl Into<String>) -> Self {
        let now = crate::now_millis();
        Self {
            client_id,
            display_name: display_name.into(),
            color: CursorColor::from_client_id(client_id),
            x: 0.0,
            y: 0.0,
            panel_id: panel_id.into(),
            joined_at: now,
            last_seen_at: now,
        }
    }

    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.x = x;
        self.y = y;
        self
    }
}

/// Map a pointer position inside a `width` x `height` container onto `0..=100`.
///
/// Out-of-bounds pointers clamp to the edge; degenerate containers map to 0.
pub fn normalize_pointer(px: f32, py: f32, width: f32, height: f32) -> (f32, f32) {
    let axis = |p: f32, extent: f32| {
        if !(extent > 0.0) || !p.is_finite() {
            return 0.0;
        }
        (p / extent * 100.0).clamp(0.0, 100.0)
    };
    (axis(px, width), axis(py, height))
}
