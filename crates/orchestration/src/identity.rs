use chrono::{DateTime, Utc};
use fleet_common::persist::{read_json, write_json_atomic, Loaded};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Durable identity of this machine: stable id, display name, interpreter
/// override and the bearer token peers must present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub python_exec: Option<String>,
    #[serde(default)]
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: machine_hostname(),
            python_exec: None,
            token: generate_token(),
            created_at: Utc::now(),
        }
    }

    /// Load `identity.json`, creating it on first run. Missing name or token
    /// fields are filled in and written back.
    pub fn load_or_create(path: &Path) -> io::Result<Self> {
        let (mut identity, mut dirty) = match read_json::<LocalIdentity>(path)? {
            Loaded::Parsed(identity) => (identity, false),
            Loaded::Missing => {
                info!(path = %path.display(), "creating local identity");
                (Self::generate(), true)
            }
            Loaded::Corrupt(reason) => {
                warn!(path = %path.display(), %reason, "identity file corrupt, generating a new one");
                (Self::generate(), true)
            }
        };
        if identity.id.trim().is_empty() {
            identity.id = Uuid::new_v4().to_string();
            dirty = true;
        }
        if identity.name.trim().is_empty() {
            identity.name = machine_hostname();
            dirty = true;
        }
        if identity.token.trim().is_empty() {
            identity.token = generate_token();
            dirty = true;
        }
        if dirty {
            identity.save(path)?;
        }
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        write_json_atomic(path, self)
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn machine_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
