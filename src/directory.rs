use crate::api::models::Peer;
use crate::api::ChatApi;
use crate::storage::Storage;
use crate::Result;

/// Fetch every user and drop self. Runs off the engine task.
pub async fn fetch_peers(api: &dyn ChatApi, token: &str, self_id: &str) -> Result<Vec<Peer>> {
    let users = api.users(token).await?;
    Ok(users.into_iter().filter(|p| p.id != self_id).collect())
}

pub struct PeerDirectory {
    peers: Vec<Peer>,
    selected: Option<String>,
    refreshed: bool,
    storage: Storage,
}

impl PeerDirectory {
    pub fn new(storage: Storage) -> Self {
        Self { peers: Vec::new(), selected: None, refreshed: false, storage }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn selected(&self) -> Option<&Peer> {
        let id = self.selected.as_deref()?;
        self.peers.iter().find(|p| p.id == id)
    }

    /// Whether the current set came from a live fetch rather than the cache.
    pub fn is_refreshed(&self) -> bool {
        self.refreshed
    }

    /// Seed the list from the local cache until the first live refresh lands.
    pub fn warm(&mut self, self_id: &str) {
        match self.storage.cached_peers() {
            Ok(cached) => {
                self.peers = cached.into_iter().filter(|p| p.id != self_id).collect();
                self.refreshed = false;
            }
            Err(e) => log::error!("Failed to read peer cache: {e}"),
        }
    }

    pub async fn refresh(&mut self, api: &dyn ChatApi, token: &str, self_id: &str) -> Result<&[Peer]> {
        let peers = fetch_peers(api, token, self_id).await?;
        self.replace(peers);
        Ok(&self.peers)
    }

    /// Install a freshly fetched set wholesale and reconcile the remembered selection.
    pub fn replace(&mut self, peers: Vec<Peer>) {
        if let Err(e) = self.storage.replace_peers(&peers) {
            log::error!("Failed to cache peers: {e}");
        }
        self.peers = peers;
        self.refreshed = true;

        let remembered = match self.storage.selected_peer() {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to read selected peer: {e}");
                None
            }
        };
        match remembered {
            Some(id) if self.contains(&id) => self.selected = Some(id),
            Some(id) => {
                log::debug!("Remembered peer {id} is gone, clearing selection");
                self.set_selection(None);
            }
            None => {
                if self.selected.as_deref().is_some_and(|id| !self.contains(id)) {
                    self.selected = None;
                }
            }
        }
    }

    /// Select a peer from the latest refreshed set. Unknown ids clear the selection.
    pub fn select(&mut self, peer_id: &str) -> Option<&Peer> {
        if self.refreshed && self.contains(peer_id) {
            self.set_selection(Some(peer_id));
            self.selected()
        } else {
            log::warn!("Cannot select unknown peer {peer_id}");
            self.set_selection(None);
            None
        }
    }

    /// Forget peers, selection and memory (logout or rejected credential).
    pub fn invalidate(&mut self) {
        self.peers.clear();
        self.selected = None;
        self.refreshed = false;
        if let Err(e) = self.storage.clear() {
            log::error!("Failed to clear peer cache: {e}");
        }
    }

    fn contains(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|p| p.id == peer_id)
    }

    fn set_selection(&mut self, peer_id: Option<&str>) {
        self.selected = peer_id.map(str::to_string);
        if let Err(e) = self.storage.set_selected_peer(peer_id) {
            log::error!("Failed to persist selected peer: {e}");
        }
    }
}
