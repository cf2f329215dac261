//! Request capabilities served by pooled accounts
//!
//! Each capability has its own cooldown clock on every account, so an account
//! cooling down on video can still serve chat.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of request an account is leased for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Image,
    Video,
}

impl Capability {
    /// All capabilities in a stable order.
    pub const ALL: [Capability; 3] = [Capability::Chat, Capability::Image, Capability::Video];

    /// Label for logs, metrics and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Image => "image",
            Capability::Video => "video",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability: {0}")]
pub struct ParseCapabilityError(pub String);

impl FromStr for Capability {
    type Err = ParseCapabilityError;

    /// Case-insensitive. Accepts the quota names used by the upstream service
    /// (`text`, `images`, `videos`) as aliases.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "text" => Ok(Capability::Chat),
            "image" | "images" => Ok(Capability::Image),
            "video" | "videos" => Ok(Capability::Video),
            _ => Err(ParseCapabilityError(s.to_string())),
        }
    }
}
