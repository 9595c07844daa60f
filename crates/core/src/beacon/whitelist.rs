use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;

use crate::cloud::client::CloudClient;
use crate::detection::domain::vehicle_detector::VehicleClass;
use crate::shared::mac::normalize_mac;

/// A cloud-issued whitelist entry, as served by `GET /api/beacons`.
/// Never mutated locally.
#[derive(Clone, Debug, Deserialize)]
pub struct WhitelistEntry {
    pub id: i64,
    pub beacon_number: i64,
    pub mac_address: String,
    pub machine_type: String,
    pub environment_code: String,
    pub registration_date: String,
    #[serde(default)]
    pub equipment_owner: Option<String>,
}

/// Immutable snapshot of the beacon whitelist, keyed by canonical MAC.
#[derive(Debug, Default)]
pub struct Whitelist {
    entries: HashMap<String, WhitelistEntry>,
}

impl Whitelist {
    /// Builds a whitelist from raw entries. Entries whose MAC cannot be
    /// canonicalised are skipped with a warning; the refresh as a whole
    /// succeeds if any entry validated.
    pub fn from_entries(raw: Vec<WhitelistEntry>) -> Self {
        let mut entries = HashMap::with_capacity(raw.len());
        for mut entry in raw {
            match normalize_mac(&entry.mac_address) {
                Some(mac) => {
                    entry.mac_address = mac.clone();
                    entries.insert(mac, entry);
                }
                None => {
                    warn!(
                        "skipping whitelist entry {} with malformed mac {:?}",
                        entry.id, entry.mac_address
                    );
                }
            }
        }
        Self { entries }
    }

    pub fn get(&self, mac: &str) -> Option<&WhitelistEntry> {
        self.entries.get(mac)
    }

    pub fn contains(&self, mac: &str) -> bool {
        self.entries.contains_key(mac)
    }

    /// The construction class a whitelisted beacon is declared for, or
    /// `None` when the MAC is unknown or its machine type unrecognised.
    pub fn machine_class(&self, mac: &str) -> Option<VehicleClass> {
        self.entries
            .get(mac)
            .and_then(|e| VehicleClass::from_machine_type(&e.machine_type))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared, atomically swappable view of the current whitelist. The
/// refresher worker replaces the snapshot; readers clone an `Arc`.
#[derive(Clone, Default)]
pub struct WhitelistHandle {
    inner: Arc<RwLock<Arc<Whitelist>>>,
}

impl WhitelistHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Whitelist> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, whitelist: Whitelist) {
        let whitelist = Arc::new(whitelist);
        match self.inner.write() {
            Ok(mut guard) => *guard = whitelist,
            Err(poisoned) => *poisoned.into_inner() = whitelist,
        }
    }
}

/// Spawns the whitelist refresher: fetches `GET /api/beacons` once at
/// start and then every `interval`, swapping the shared snapshot on
/// success. A failed fetch keeps the previous snapshot.
pub fn spawn_refresher(
    handle: WhitelistHandle,
    client: Arc<CloudClient>,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            match client.fetch_beacons() {
                Ok(entries) => {
                    let total = entries.len();
                    let whitelist = Whitelist::from_entries(entries);
                    info!(
                        "beacon whitelist refreshed: {} valid of {total} entries",
                        whitelist.len()
                    );
                    handle.replace(whitelist);
                }
                Err(e) => warn!("whitelist refresh failed, keeping previous snapshot: {e}"),
            }
            crate::cloud::heartbeat::sleep_while_running(interval, &running);
        }
    })
}
