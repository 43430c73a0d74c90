//! OS-credential-store abstraction. Provider keys and OAuth tokens live
//! here, never in files. The `keyring` backend talks to the platform
//! keychain; the in-memory backend exists for tests and headless CI.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Service name under which entries are registered in the OS keychain.
#[cfg(feature = "keyring-store")]
const KEYRING_SERVICE: &str = "pryx";

pub trait Keychain: Send + Sync {
    /// Returns `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Platform keychain via the `keyring` crate. The crate serialises access
/// internally; pryx holds one instance process-wide.
#[cfg(feature = "keyring-store")]
pub struct OsKeychain;

#[cfg(feature = "keyring-store")]
impl Keychain for OsKeychain {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key)?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret.into_bytes())),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key)?;
        entry.set_password(&String::from_utf8_lossy(value))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory keychain for tests and environments without an OS keyring.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keychain for MemoryKeychain {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}
