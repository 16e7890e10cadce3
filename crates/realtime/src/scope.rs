//! Addressable connection groups.

use crate::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The group of connections a broadcast targets.
///
/// A connection belongs to exactly one scope for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    /// Every viewer of the shared canvas.
    Canvas,
    /// The participants of one duel session.
    Duel(SessionId),
}

impl Scope {
    /// Session id for duel scopes.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Scope::Canvas => None,
            Scope::Duel(id) => Some(*id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Canvas => write!(f, "canvas"),
            Scope::Duel(id) => write!(f, "duel:{}", id),
        }
    }
}
