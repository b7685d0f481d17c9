//! Per-agent credential store, `auth-profiles.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Result, WardenError};
use crate::fsutil::write_atomic_private;
use crate::platform::Platform;

pub const STORE_VERSION: u32 = 1;
pub const DEFAULT_PROFILE_NAME: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthProfile {
    ApiKey {
        provider: String,
        key: String,
    },
    Token {
        provider: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
    },
    #[serde(rename = "oauth")]
    OAuth {
        provider: String,
        access: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
    },
}

impl AuthProfile {
    pub fn provider(&self) -> &str {
        match self {
            AuthProfile::ApiKey { provider, .. }
            | AuthProfile::Token { provider, .. }
            | AuthProfile::OAuth { provider, .. } => provider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthProfileStore {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub profiles: BTreeMap<String, AuthProfile>,
    /// Per provider, profile ids with the most recently written first.
    #[serde(default)]
    pub order: BTreeMap<String, Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

impl Default for AuthProfileStore {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            profiles: BTreeMap::new(),
            order: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// `provider:default`, the id used for keys entered through the UI.
pub fn api_key_profile_id(provider: &str) -> String {
    format!("{provider}:{DEFAULT_PROFILE_NAME}")
}

impl AuthProfileStore {
    /// A missing or unreadable file is an empty store.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&text) {
            Ok(store) => store,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "auth profile store unreadable; starting empty");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path, platform: &dyn Platform) -> Result<()> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        write_atomic_private(path, text.as_bytes(), platform)
    }

    pub fn get(&self, profile_id: &str) -> Option<&AuthProfile> {
        self.profiles.get(profile_id)
    }

    pub fn profiles_for(&self, provider: &str) -> Vec<(&str, &AuthProfile)> {
        self.order
            .get(provider)
            .into_iter()
            .flatten()
            .filter_map(|id| self.profiles.get(id).map(|p| (id.as_str(), p)))
            .collect()
    }

    pub fn insert(&mut self, profile_id: &str, profile: AuthProfile) {
        let provider = profile.provider().to_string();
        self.profiles.insert(profile_id.to_string(), profile);
        let order = self.order.entry(provider).or_default();
        order.retain(|id| id != profile_id);
        order.insert(0, profile_id.to_string());
    }
}

/// Read, insert or replace `profile_id`, move it to the front of its
/// provider's order, write back.
pub fn upsert(
    path: &Path,
    profile_id: &str,
    profile: AuthProfile,
    platform: &dyn Platform,
) -> Result<AuthProfileStore> {
    let profile_id = profile_id.trim();
    if profile_id.is_empty() {
        return Err(WardenError::Config("profile id must not be empty".to_string()));
    }
    if profile.provider().trim().is_empty() {
        return Err(WardenError::Config("provider must not be empty".to_string()));
    }
    let mut store = AuthProfileStore::load(path);
    let provider = profile.provider().to_string();
    store.insert(profile_id, profile);
    store.save(path, platform)?;
    info!(provider = %provider, profile = profile_id, "auth profile saved");
    Ok(store)
}

pub fn upsert_api_key(
    path: &Path,
    provider: &str,
    key: &str,
    platform: &dyn Platform,
) -> Result<AuthProfileStore> {
    let provider = provider.trim();
    let key = key.trim();
    if key.is_empty() {
        return Err(WardenError::Config("api key must not be empty".to_string()));
    }
    upsert(
        path,
        &api_key_profile_id(provider),
        AuthProfile::ApiKey {
            provider: provider.to_string(),
            key: key.to_string(),
        },
        platform,
    )
}
