//! Two-part address naming one controller's logical connection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Channel used when a controller does not name one.
pub const DEFAULT_CHANNEL_UID: &str = "default";

/// `(identity, channel)`: the registry key. Equality is exact on both parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionIdentifier {
    pub identity_uid: String,
    #[serde(default = "default_channel_uid")]
    pub channel_uid: String,
}

fn default_channel_uid() -> String {
    DEFAULT_CHANNEL_UID.to_string()
}

impl SessionIdentifier {
    pub fn new(identity_uid: impl Into<String>, channel_uid: impl Into<String>) -> Self {
        Self {
            identity_uid: identity_uid.into(),
            channel_uid: channel_uid.into(),
        }
    }

    /// Identifier on the `default` channel.
    pub fn for_identity(identity_uid: impl Into<String>) -> Self {
        Self::new(identity_uid, DEFAULT_CHANNEL_UID)
    }
}

impl fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity_uid, self.channel_uid)
    }
}
