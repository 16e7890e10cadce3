use chrono::{DateTime, Utc};
use realtime::UserId;
use serde::{Deserialize, Serialize};

/// One committed canvas cell. Later writes to the same cell replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
    pub color: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl CanvasSize {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    pub fn full(&self) -> Region {
        Region {
            x_min: 0,
            y_min: 0,
            x_max: self.width,
            y_max: self.height,
        }
    }
}

impl Default for CanvasSize {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 1000,
        }
    }
}

/// Half-open rectangle `[x_min, x_max) x [y_min, y_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl Region {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.x_min..self.x_max).contains(&x) && (self.y_min..self.y_max).contains(&y)
    }
}

/// `#RRGGBB`, either case.
pub fn is_valid_color(color: &str) -> bool {
    let bytes = color.as_bytes();
    bytes.len() == 7 && bytes[0] == b'#' && bytes[1..].iter().all(u8::is_ascii_hexdigit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_validation() {
        assert!(is_valid_color("#FF00aa"));
        assert!(is_valid_color("#000000"));
        assert!(!is_valid_color("FF00AA"));
        assert!(!is_valid_color("#FF00A"));
        assert!(!is_valid_color("#FF00AAB"));
        assert!(!is_valid_color("#GG0000"));
        assert!(!is_valid_color(""));
    }

    #[test]
    fn test_region_is_half_open() {
        let region = Region {
            x_min: 10,
            y_min: 10,
            x_max: 20,
            y_max: 20,
        };
        assert!(region.contains(10, 19));
        assert!(!region.contains(20, 15));
        assert!(!region.contains(9, 15));
    }

    #[test]
    fn test_size_bounds() {
        let size = CanvasSize::default();
        assert!(size.contains(999, 999));
        assert!(!size.contains(1000, 0));
    }
}
