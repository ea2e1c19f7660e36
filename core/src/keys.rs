//! Key store contract and the built-in root-secret derivation.
//!
//! Key material is derived from `(key id, key identifier, epoch day)` and
//! handed to the codec as an opaque AEAD key. Platform secure-element
//! stores replace [`StaticKeyStore`] behind the same trait.

use chacha20poly1305::Key;
use sha2::{Digest, Sha256};

/// Which transport family a key slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyInterface {
    Serial,
    Udp,
    BtAdv,
    BtGatt,
}

impl KeyInterface {
    fn tag(self) -> u8 {
        match self {
            KeyInterface::Serial => 0x10,
            KeyInterface::Udp => 0x20,
            KeyInterface::BtAdv => 0x30,
            KeyInterface::BtGatt => 0x40,
        }
    }
}

/// Whether the key is scoped to this device or the shared network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    Device,
    Network,
}

impl KeyScope {
    fn tag(self) -> u8 {
        match self {
            KeyScope::Device => 0x01,
            KeyScope::Network => 0x02,
        }
    }
}

/// Fully-qualified key slot: interface family plus auth scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId {
    pub interface: KeyInterface,
    pub scope: KeyScope,
}

impl KeyId {
    pub fn new(interface: KeyInterface, scope: KeyScope) -> Self {
        Self { interface, scope }
    }
}

/// Source of AEAD key material.
pub trait KeyStore: Send + Sync {
    /// Derive the key for `(id, key_identifier, epoch_day)`.
    ///
    /// Returns `None` when the identifier is unknown; the codec refuses to
    /// encrypt or decrypt with it.
    fn derive(&self, id: KeyId, key_identifier: u32, epoch_day: u32) -> Option<Key>;

    /// The 24-bit identifier of this node's device key, reported in
    /// KEY_IDS responses.
    fn device_key_identifier(&self) -> u32;
}

/// Key store deriving everything from a single root secret.
pub struct StaticKeyStore {
    root: [u8; 32],
    device_key_identifier: u32,
}

impl StaticKeyStore {
    pub fn new(root: [u8; 32], device_key_identifier: u32) -> Self {
        Self {
            root,
            device_key_identifier: device_key_identifier & 0x00FF_FFFF,
        }
    }
}

impl KeyStore for StaticKeyStore {
    fn derive(&self, id: KeyId, key_identifier: u32, epoch_day: u32) -> Option<Key> {
        if key_identifier & 0x00FF_FFFF != self.device_key_identifier {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.root);
        hasher.update([id.interface.tag(), id.scope.tag()]);
        hasher.update(key_identifier.to_le_bytes());
        hasher.update(epoch_day.to_le_bytes());
        let digest = hasher.finalize();
        Some(Key::clone_from_slice(digest.as_slice()))
    }

    fn device_key_identifier(&self) -> u32 {
        self.device_key_identifier
    }
}
