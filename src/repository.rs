//! Identity/channel storage used to authorize access tokens.
//!
//! Two implementations:
//!
//! - [`FileIdentityRepository`]: one directory per identity holding
//!   `identity.json`:
//!
//!   ```json
//!   { "channels": { "default": { "access_token": { "value": "…", "valid_until": 1767225600 } } } }
//!   ```
//!
//! - [`StaticIdentityRepository`]: channels listed inline in the config file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::constant_time_eq;
use crate::connector::SessionIdentifier;
use crate::error::{ConnectorError, Result};

/// File name of an identity's record inside its directory.
pub const IDENTITY_FILE_NAME: &str = "identity.json";

/// Maps a channel access token to the channel it grants.
///
/// Implementations may block; async callers go through `spawn_blocking`.
pub trait IdentityRepository: Send + Sync {
    fn find_channel_by_access_token(&self, token: &str) -> Result<Option<SessionIdentifier>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityEntity {
    #[serde(default)]
    pub channels: HashMap<String, ChannelEntity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelEntity {
    pub access_token: Option<AccessToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    /// Unix seconds after which the token is rejected; `None` = never expires.
    #[serde(default)]
    pub valid_until: Option<u64>,
}

impl AccessToken {
    pub fn matches(&self, presented: &str, now_secs: u64) -> bool {
        constant_time_eq(self.value.as_bytes(), presented.as_bytes())
            && self.valid_until.is_none_or(|until| until > now_secs)
    }
}

fn now_secs() -> u64 {
    crate::connector::statistics::unix_millis() / 1000
}

/// Directory-per-identity repository. Reads from disk on every lookup, so
/// edits take effect without a restart.
pub struct FileIdentityRepository {
    root: PathBuf,
}

impl FileIdentityRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read one identity. A missing file is `None`; an unparsable one is
    /// logged and treated as missing.
    pub fn read_identity(&self, identity_uid: &str) -> Result<Option<IdentityEntity>> {
        let path = self.root.join(identity_uid).join(IDENTITY_FILE_NAME);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConnectorError::Repository(format!(
                    "reading {}: {e}",
                    path.display()
                )))
            }
        };
        match serde_json::from_str(&content) {
            Ok(entity) => Ok(Some(entity)),
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable identity file: {e}");
                Ok(None)
            }
        }
    }

    pub fn write_identity(&self, identity_uid: &str, entity: &IdentityEntity) -> Result<()> {
        let dir = self.root.join(identity_uid);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ConnectorError::Repository(format!("creating {}: {e}", dir.display())))?;
        let json = serde_json::to_string_pretty(entity)
            .map_err(|e| ConnectorError::Repository(e.to_string()))?;
        let path = dir.join(IDENTITY_FILE_NAME);
        std::fs::write(&path, json)
            .map_err(|e| ConnectorError::Repository(format!("writing {}: {e}", path.display())))
    }

    fn identity_uids(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ConnectorError::Repository(format!(
                    "listing {}: {e}",
                    self.root.display()
                )))
            }
        };
        let mut uids: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        uids.sort();
        Ok(uids)
    }
}

impl IdentityRepository for FileIdentityRepository {
    fn find_channel_by_access_token(&self, token: &str) -> Result<Option<SessionIdentifier>> {
        let now = now_secs();
        for identity_uid in self.identity_uids()? {
            let Some(identity) = self.read_identity(&identity_uid)? else {
                continue;
            };
            let mut channels: Vec<(&String, &ChannelEntity)> = identity.channels.iter().collect();
            channels.sort_by(|a, b| a.0.cmp(b.0));
            for (channel_uid, channel) in channels {
                if channel
                    .access_token
                    .as_ref()
                    .is_some_and(|t| t.matches(token, now))
                {
                    return Ok(Some(SessionIdentifier::new(identity_uid, channel_uid.clone())));
                }
            }
        }
        Ok(None)
    }
}

/// One inline channel grant from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticChannel {
    pub identity_uid: String,
    #[serde(default = "default_channel")]
    pub channel_uid: String,
    pub access_token: String,
    #[serde(default)]
    pub valid_until: Option<u64>,
}

fn default_channel() -> String {
    crate::connector::identifier::DEFAULT_CHANNEL_UID.to_string()
}

pub struct StaticIdentityRepository {
    channels: Vec<(SessionIdentifier, AccessToken)>,
}

impl StaticIdentityRepository {
    pub fn new(channels: &[StaticChannel]) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|c| {
                    (
                        SessionIdentifier::new(c.identity_uid.clone(), c.channel_uid.clone()),
                        AccessToken {
                            value: c.access_token.clone(),
                            valid_until: c.valid_until,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl IdentityRepository for StaticIdentityRepository {
    fn find_channel_by_access_token(&self, token: &str) -> Result<Option<SessionIdentifier>> {
        let now = now_secs();
        Ok(self
            .channels
            .iter()
            .find(|(_, t)| t.matches(token, now))
            .map(|(id, _)| id.clone()))
    }
}
