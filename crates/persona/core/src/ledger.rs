//! Build-stable port and password ledgers.

use crate::error::{PersonaError, PersonaResult};
use crate::store::PersistentStore;
use persona_identity::Id;

/// First port handed out by a fresh allocator.
pub const DEFAULT_PORT_BASE: u16 = 5000;

const PASSWORD_BYTES: usize = 32;

/// Hands out ports that stay the same from one build to the next.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    store: PersistentStore,
    base: u16,
}

impl PortAllocator {
    pub fn new(store: PersistentStore) -> Self {
        Self::with_base(store, DEFAULT_PORT_BASE)
    }

    pub fn with_base(store: PersistentStore, base: u16) -> Self {
        Self { store, base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Port for `id`: the recorded one, else one above the highest recorded
    /// port (or the base for an empty ledger). Fails once 65535 is taken.
    pub fn allocate(&self, id: &Id) -> PersonaResult<u16> {
        self.store.get_or_insert(id, || {
            let highest = self
                .store
                .entries()?
                .values()
                .filter_map(|v| v.as_u64())
                .filter_map(|p| u16::try_from(p).ok())
                .max();
            match highest {
                Some(port) => port
                    .checked_add(1)
                    .map(|next| next.max(self.base))
                    .ok_or_else(|| PersonaError::Config("port range exhausted".to_string())),
                None => Ok(self.base),
            }
        })
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }
}

/// Generates each password once and replays it on later builds.
#[derive(Debug, Clone)]
pub struct PasswordLedger {
    store: PersistentStore,
}

impl PasswordLedger {
    pub fn new(store: PersistentStore) -> Self {
        Self { store }
    }

    pub fn password(&self, id: &Id) -> PersonaResult<String> {
        self.store.get_or_insert(id, || {
            let bytes: [u8; PASSWORD_BYTES] = rand::random();
            Ok(hex::encode(bytes))
        })
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }
}
