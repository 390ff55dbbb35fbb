use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleet_common::persist::{read_json, write_json_atomic, Loaded};
use fleet_common::{AckOutcome, AgentStatus, DeviceInfo};
use reqwest::Client;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::DeviceError;
use crate::identity::{machine_hostname, LocalIdentity};
use crate::local::{LocalDevice, LocalDeviceConfig};
use crate::remote::{PeerRecord, RemoteDevice};
use crate::types::{FleetSettings, LogLine, SupervisorSettings};

/// Registry of every device this agent can reach.
///
/// Holds exactly one [`LocalDevice`]; peers are kept as connection info
/// only and a [`RemoteDevice`] proxy is built for each use.
pub struct DeviceManager {
    data_dir: PathBuf,
    identity: RwLock<LocalIdentity>,
    local: LocalDevice,
    peers: RwLock<Vec<PeerRecord>>,
    client: Client,
    settings: FleetSettings,
    hostname: String,
    /// Orders writes of `identity.json` and `peers.json`.
    persist_gate: AsyncMutex<()>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Prepend `http://` when no scheme is given and drop trailing slashes.
pub fn normalize_url(raw: &str) -> Result<String, DeviceError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(DeviceError::InvalidUrl(raw.to_string()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else if trimmed.contains("://") {
        Err(DeviceError::InvalidUrl(raw.to_string()))
    } else {
        Ok(format!("http://{trimmed}"))
    }
}

impl DeviceManager {
    /// Load identity and peers from `data_dir` and bring up the local supervisor.
    pub fn open(
        data_dir: &Path,
        supervisor: SupervisorSettings,
        settings: FleetSettings,
        log_sink: Option<mpsc::Sender<LogLine>>,
    ) -> Result<Self, DeviceError> {
        fleet_common::persist::ensure_dir(data_dir)?;
        let identity = LocalIdentity::load_or_create(&data_dir.join("identity.json"))?;
        let peers = load_peers(&data_dir.join("peers.json"));
        let local = LocalDevice::new(
            LocalDeviceConfig {
                id: identity.id.clone(),
                name: identity.name.clone(),
                data_dir: data_dir.to_path_buf(),
                python_exec: identity.python_exec.clone(),
                settings: supervisor,
            },
            log_sink,
        );
        let client = Client::builder()
            .connect_timeout(settings.peer_timeout())
            .build()
            .map_err(|err| DeviceError::Io(std::io::Error::other(err)))?;
        info!(id = %identity.id, name = %identity.name, peers = peers.len(), "device manager ready");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            identity: RwLock::new(identity),
            local,
            peers: RwLock::new(peers),
            client,
            settings,
            hostname: machine_hostname(),
            persist_gate: AsyncMutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn local(&self) -> &LocalDevice {
        &self.local
    }

    pub fn local_id(&self) -> String {
        read(&self.identity).id.clone()
    }

    pub fn token(&self) -> String {
        read(&self.identity).token.clone()
    }

    pub fn identity(&self) -> LocalIdentity {
        read(&self.identity).clone()
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub fn agent_status(&self) -> AgentStatus {
        let identity = read(&self.identity);
        AgentStatus {
            status: "online".to_string(),
            hostname: self.hostname.clone(),
            name: identity.name.clone(),
            platform: std::env::consts::OS.to_string(),
            id: identity.id.clone(),
            python_exec: identity.python_exec.clone(),
        }
    }

    pub fn is_local(&self, key: &str) -> bool {
        let identity = read(&self.identity);
        key == identity.id || key == identity.name || key == self.hostname
    }

    /// Canonical device id for an id, display name or (local only) hostname.
    pub fn resolve_id(&self, key: &str) -> Option<String> {
        if self.is_local(key) {
            return Some(self.local_id());
        }
        read(&self.peers)
            .iter()
            .find(|peer| peer.id == key || peer.name == key)
            .map(|peer| peer.id.clone())
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        read(&self.peers).clone()
    }

    fn proxy(&self, peer: PeerRecord) -> RemoteDevice {
        RemoteDevice::new(peer, self.client.clone(), self.settings.peer_timeout())
    }

    pub fn remote(&self, key: &str) -> Option<RemoteDevice> {
        let peer = read(&self.peers)
            .iter()
            .find(|peer| peer.id == key || peer.name == key)
            .cloned()?;
        Some(self.proxy(peer))
    }

    pub fn remotes(&self) -> Vec<RemoteDevice> {
        self.peers()
            .into_iter()
            .map(|peer| self.proxy(peer))
            .collect()
    }

    /// Local device or a fresh proxy for the named peer.
    pub fn device(&self, key: &str) -> Option<Arc<dyn Device>> {
        if self.is_local(key) {
            return Some(Arc::new(self.local.clone()));
        }
        self.remote(key)
            .map(|remote| Arc::new(remote) as Arc<dyn Device>)
    }

    async fn save_peers(&self) -> Result<(), DeviceError> {
        let _gate = self.persist_gate.lock().await;
        let peers = self.peers();
        let path = self.data_dir.join("peers.json");
        write_off_runtime(move || write_json_atomic(&path, &peers)).await
    }

    async fn save_identity(&self) -> Result<(), DeviceError> {
        let _gate = self.persist_gate.lock().await;
        let identity = self.identity();
        let path = self.data_dir.join("identity.json");
        write_off_runtime(move || identity.save(&path)).await
    }

    /// Refresh each peer's interpreter snapshot in parallel. Each call has
    /// its own timeout and the whole round is bounded as well.
    pub async fn sync_remote_configs(&self) {
        let remotes = self.remotes();
        if remotes.is_empty() {
            return;
        }
        let per_call = self.settings.sync_timeout();
        let mut calls = JoinSet::new();
        for remote in remotes {
            calls.spawn(async move {
                let id = remote.peer().id.clone();
                let result = tokio::time::timeout(per_call, remote.fetch_status()).await;
                (id, result)
            });
        }

        let mut updates = Vec::new();
        let round = async {
            while let Some(joined) = calls.join_next().await {
                match joined {
                    Ok((id, Ok(Ok(status)))) => updates.push((id, status.python_exec)),
                    Ok((id, Ok(Err(err)))) => debug!(peer = %id, error = %err, "config sync failed"),
                    Ok((id, Err(_))) => debug!(peer = %id, "config sync timed out"),
                    Err(err) => warn!(error = %err, "config sync task failed"),
                }
            }
        };
        if tokio::time::timeout(self.settings.sync_overall_timeout(), round)
            .await
            .is_err()
        {
            debug!("config sync round hit its overall timeout");
        }
        calls.abort_all();

        let changed = {
            let mut peers = write(&self.peers);
            let mut changed = false;
            for (id, python_exec) in updates {
                if let Some(peer) = peers.iter_mut().find(|peer| peer.id == id) {
                    if peer.python_exec != python_exec {
                        peer.python_exec = python_exec;
                        changed = true;
                    }
                }
            }
            changed
        };
        if changed {
            if let Err(err) = self.save_peers().await {
                warn!(error = %err, "failed to persist peer snapshots");
            }
        }
    }

    /// Local device first, then every known peer.
    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        self.sync_remote_configs().await;
        let mut devices = vec![self.local.info()];
        devices.extend(self.remotes().iter().map(|remote| remote.info()));
        devices
    }

    /// Register a peer after confirming it answers with a different id.
    pub async fn add_peer(&self, url: &str, token: &str) -> Result<PeerRecord, DeviceError> {
        let url = normalize_url(url)?;
        let candidate = self.proxy(PeerRecord {
            id: String::new(),
            name: String::new(),
            url: url.clone(),
            token: token.to_string(),
            python_exec: None,
        });
        let status = candidate.fetch_status().await?;
        if status.id == self.local_id() {
            return Err(DeviceError::SelfPeer(status.id));
        }
        let name = if status.name.is_empty() {
            status.hostname.clone()
        } else {
            status.name.clone()
        };
        let record = PeerRecord {
            id: status.id,
            name,
            url,
            token: token.to_string(),
            python_exec: status.python_exec,
        };
        {
            let mut peers = write(&self.peers);
            peers.retain(|peer| peer.id != record.id);
            peers.push(record.clone());
        }
        self.save_peers().await?;
        info!(peer = %record.id, url = %record.url, "peer added");
        Ok(record)
    }

    pub async fn remove_peer(&self, key: &str) -> Result<bool, DeviceError> {
        let removed = {
            let mut peers = write(&self.peers);
            let before = peers.len();
            peers.retain(|peer| peer.id != key && peer.name != key);
            peers.len() != before
        };
        if removed {
            self.save_peers().await?;
            info!(peer = %key, "peer removed");
        }
        Ok(removed)
    }

    /// Local: update the identity. Peer: the peer must accept the rename first.
    pub async fn rename_device(&self, key: &str, name: &str) -> Result<(), DeviceError> {
        let name = name.trim();
        if self.is_local(key) {
            write(&self.identity).name = name.to_string();
            self.local.set_name(name);
            return self.save_identity().await;
        }
        let remote = self
            .remote(key)
            .ok_or_else(|| DeviceError::UnknownDevice(key.to_string()))?;
        let peer_id = remote.peer().id.clone();
        match remote.rename(name).await {
            AckOutcome::Ok => {}
            AckOutcome::Error { message } => return Err(DeviceError::PeerRejected(message)),
        }
        if let Some(peer) = write(&self.peers).iter_mut().find(|peer| peer.id == peer_id) {
            peer.name = name.to_string();
        }
        self.save_peers().await
    }

    /// Local: persist the override. Peer: push it, then record it.
    pub async fn update_python_exec(
        &self,
        key: &str,
        python_exec: Option<String>,
    ) -> Result<(), DeviceError> {
        let python_exec = python_exec.filter(|exec| !exec.trim().is_empty());
        if self.is_local(key) {
            write(&self.identity).python_exec = python_exec.clone();
            self.local.set_python_exec(python_exec);
            return self.save_identity().await;
        }
        let remote = self
            .remote(key)
            .ok_or_else(|| DeviceError::UnknownDevice(key.to_string()))?;
        let peer_id = remote.peer().id.clone();
        match remote.push_config(python_exec.as_deref()).await {
            AckOutcome::Ok => {}
            AckOutcome::Error { message } => return Err(DeviceError::PeerRejected(message)),
        }
        if let Some(peer) = write(&self.peers).iter_mut().find(|peer| peer.id == peer_id) {
            peer.python_exec = python_exec;
        }
        self.save_peers().await
    }
}

async fn write_off_runtime<F>(write: F) -> Result<(), DeviceError>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(write)
        .await
        .map_err(io::Error::other)??;
    Ok(())
}

fn load_peers(path: &Path) -> Vec<PeerRecord> {
    match read_json::<Vec<PeerRecord>>(path) {
        Ok(Loaded::Parsed(peers)) => peers,
        Ok(Loaded::Missing) => Vec::new(),
        Ok(Loaded::Corrupt(reason)) => {
            warn!(path = %path.display(), %reason, "peer list corrupt, starting empty");
            Vec::new()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "peer list unreadable, starting empty");
            Vec::new()
        }
    }
}
