use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanvasError {
    #[error("Coordinate ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("Invalid color '{0}', expected #RRGGBB")]
    InvalidColor(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CanvasError {
    /// Whether the caller sent bad input, as opposed to a backend failure.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            CanvasError::OutOfBounds { .. }
                | CanvasError::InvalidColor(_)
                | CanvasError::InvalidRegion(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CanvasError>;
