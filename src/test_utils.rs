// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory transport, recording notifier and a simulated network of devices for tests.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::account::Account;
use crate::config::Config;
use crate::crypto::Rng;
use crate::event::{MembershipChange, Notifier};
use crate::identity::{AnchorKey, Credentials, PeerId};
use crate::peer::DeviceGestalt;
use crate::ring::{RingName, RingPayload};
use crate::transport::{Transport, TransportError};

pub type TestAccount = Account<MemoryTransport, RecordingNotifier>;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Transport collecting published containers in an outbox.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    outbox: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Takes all containers published since the last call.
    pub fn drain(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    /// Names of containers published since the last drain.
    pub fn published_names(&self) -> Vec<String> {
        self.outbox
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    async fn publish(&self, name: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(name.to_string()));
        }
        self.outbox.lock().unwrap().push((name.to_string(), bytes));
        Ok(())
    }
}

/// Notifier remembering every notification.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    changes: Arc<Mutex<Vec<MembershipChange>>>,
    rings: Arc<Mutex<Vec<RingName>>>,
}

impl RecordingNotifier {
    pub fn changes(&self) -> Vec<MembershipChange> {
        self.changes.lock().unwrap().clone()
    }

    pub fn ring_updates(&self) -> Vec<RingName> {
        self.rings.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.changes.lock().unwrap().clear();
        self.rings.lock().unwrap().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn on_membership_changed(&self, change: &MembershipChange) {
        self.changes.lock().unwrap().push(change.clone());
    }

    fn on_ring_updated(&self, name: &RingName, _payload: &RingPayload) {
        self.rings.lock().unwrap().push(name.clone());
    }
}

/// Group of devices sharing one anchor, connected through a broadcast bus.
pub struct Network {
    rng: Rng,
    config: Config,
    pub anchor: AnchorKey,
    pub devices: Vec<TestAccount>,
}

impl Network {
    pub fn new(config: Config, seed: [u8; 32]) -> Self {
        Self {
            rng: Rng::from_seed(seed),
            config,
            anchor: AnchorKey::derive(b"correct horse battery staple", b"test-salt").unwrap(),
            devices: Vec::new(),
        }
    }

    /// Enrolls a new device holding the anchor key and returns its index.
    pub async fn add_device(&mut self, name: &str, serial_number: Option<&str>) -> usize {
        let credentials = Credentials::new(&self.rng).unwrap();
        let mut gestalt = DeviceGestalt::new(name, "test-device");
        if let Some(serial_number) = serial_number {
            gestalt = gestalt.with_serial_number(serial_number);
        }
        let rng = Rng::from_seed(self.rng.random_array().unwrap());
        let mut account = Account::new(
            self.config.clone(),
            credentials,
            gestalt,
            rng,
            MemoryTransport::default(),
            RecordingNotifier::default(),
        )
        .unwrap();
        account.set_anchor(self.anchor.clone()).await.unwrap();
        self.devices.push(account);
        self.devices.len() - 1
    }

    pub fn peer_id(&self, index: usize) -> PeerId {
        self.devices[index].peer_id().clone()
    }

    /// Delivers everything published until no device publishes anything anymore.
    ///
    /// Containers are delivered to every device except the one which published them.
    pub async fn settle(&mut self) {
        for _ in 0..32 {
            let mut queue = Vec::new();
            for (index, device) in self.devices.iter().enumerate() {
                for message in device.transport().drain() {
                    queue.push((index, message));
                }
            }
            if queue.is_empty() {
                return;
            }
            for (origin, (name, bytes)) in queue {
                for (index, device) in self.devices.iter_mut().enumerate() {
                    if index != origin {
                        device.deliver(&name, &bytes).await;
                    }
                }
            }
        }
        panic!("network did not settle");
    }

    /// Drops everything published so far without delivering it.
    pub fn discard(&self) {
        for device in &self.devices {
            device.transport().drain();
        }
    }
}
