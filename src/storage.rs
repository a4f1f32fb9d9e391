//! Local key/value storage with per-item storage modes.
//!
//! Three modes cover the lock layer's needs:
//! - `Fixed`: persisted as plaintext (safe-to-store records such as the
//!   passcode auth parameters)
//! - `FixedEncrypted`: persisted, value encrypted under the passcode-derived
//!   master key
//! - `Ephemeral`: held in memory only, gone on restart
//!
//! Mode migrations rewrite every item inside a single transaction, so a
//! failure mid-migration never leaves a mixed plaintext/ciphertext store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::crypto::{decrypt_to_string, encrypt_string};
use crate::{LockError, Result};

/// Where and how an item is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Persisted, plaintext
    Fixed,
    /// Persisted, value encrypted under the storage keys
    FixedEncrypted,
    /// In memory only
    Ephemeral,
}

/// Storage seam the lock controller depends on.
pub trait KeyStore: Send + Sync {
    fn get_item(&self, key: &str, mode: StorageMode) -> Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str, mode: StorageMode) -> Result<()>;

    fn remove_item(&self, key: &str, mode: StorageMode) -> Result<()>;

    /// Migrate every stored item to `mode`.
    ///
    /// Without `force`, items already in the target representation are left
    /// untouched. With `force`, everything is rewritten under the current
    /// storage keys; the caller uses this when the keys themselves changed.
    fn set_items_mode(&self, mode: StorageMode, force: bool) -> Result<()>;

    /// Install (or clear) the master key used for `FixedEncrypted` values
    fn set_keys(&self, master_key: Option<[u8; 32]>);

    /// Rewrite every encrypted item as plaintext, after a successful unlock
    fn decrypt_storage(&self) -> Result<()>;
}

struct StoreInner {
    conn: Connection,
    ephemeral: HashMap<String, String>,
    master_key: Option<[u8; 32]>,
}

/// SQLite-backed [`KeyStore`] implementation.
///
/// Persisted items live in a single `items` table; ephemeral items live in
/// a plain map next to the connection. Tests use [`LocalKeyStore::open_in_memory`].
pub struct LocalKeyStore {
    inner: Mutex<StoreInner>,
}

fn db_err(e: rusqlite::Error) -> LockError {
    LockError::Storage(e.to_string())
}

impl LocalKeyStore {
    /// Open (or create) the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// Open a store that lives entirely in memory
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS items (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                encrypted INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(db_err)?;

        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                ephemeral: HashMap::new(),
                master_key: None,
            }),
        })
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| LockError::Storage("storage state lock poisoned".to_string()))
    }

    /// Read the full persisted store as plaintext pairs.
    /// Encrypted rows require the master key to be set.
    fn read_all_plaintext(inner: &StoreInner) -> Result<Vec<(String, String)>> {
        let mut stmt = inner
            .conn
            .prepare("SELECT key, value, encrypted FROM items")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut items = Vec::new();
        for row in rows {
            let (key, value, encrypted) = row.map_err(db_err)?;
            if encrypted {
                let master = inner.master_key.ok_or(LockError::MissingStorageKeys)?;
                items.push((key, decrypt_to_string(&master, &value)?));
            } else {
                items.push((key, value));
            }
        }
        Ok(items)
    }

    /// Read only the rows stored as plaintext
    fn read_plaintext_rows(inner: &StoreInner) -> Result<Vec<(String, String)>> {
        let mut stmt = inner
            .conn
            .prepare("SELECT key, value FROM items WHERE encrypted = 0")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(db_err)?);
        }
        Ok(items)
    }
}

impl KeyStore for LocalKeyStore {
    fn get_item(&self, key: &str, mode: StorageMode) -> Result<Option<String>> {
        let inner = self.lock_inner()?;

        if mode == StorageMode::Ephemeral {
            return Ok(inner.ephemeral.get(key).cloned());
        }

        let row: Option<(String, bool)> = inner
            .conn
            .query_row(
                "SELECT value, encrypted FROM items WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;

        match row {
            None => Ok(None),
            Some((value, false)) => Ok(Some(value)),
            Some((value, true)) => {
                let master = inner.master_key.ok_or(LockError::MissingStorageKeys)?;
                Ok(Some(decrypt_to_string(&master, &value)?))
            }
        }
    }

    fn set_item(&self, key: &str, value: &str, mode: StorageMode) -> Result<()> {
        let mut inner = self.lock_inner()?;

        if mode == StorageMode::Ephemeral {
            inner.ephemeral.insert(key.to_string(), value.to_string());
            return Ok(());
        }

        // An encrypted write without keys degrades to plaintext. This keeps
        // settings writable before any passcode exists; setting a passcode
        // later re-encrypts the store wholesale.
        let (stored, encrypted) = match (mode, inner.master_key) {
            (StorageMode::FixedEncrypted, Some(master)) => {
                (encrypt_string(&master, value)?, true)
            }
            (StorageMode::FixedEncrypted, None) => {
                debug!(key, "no storage keys set; writing value as plaintext");
                (value.to_string(), false)
            }
            _ => (value.to_string(), false),
        };

        inner
            .conn
            .execute(
                "INSERT INTO items (key, value, encrypted) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    encrypted = excluded.encrypted",
                rusqlite::params![key, stored, encrypted],
            )
            .map_err(db_err)?;

        Ok(())
    }

    fn remove_item(&self, key: &str, mode: StorageMode) -> Result<()> {
        let mut inner = self.lock_inner()?;

        if mode == StorageMode::Ephemeral {
            inner.ephemeral.remove(key);
            return Ok(());
        }

        inner
            .conn
            .execute("DELETE FROM items WHERE key = ?1", [key])
            .map_err(db_err)?;
        Ok(())
    }

    fn set_items_mode(&self, mode: StorageMode, force: bool) -> Result<()> {
        let mut inner = self.lock_inner()?;
        let master_key = inner.master_key;

        if mode == StorageMode::FixedEncrypted && !force {
            // Only plaintext rows (and ephemeral items) need rewriting;
            // rows already encrypted stay as they are. This path never needs
            // to decrypt, so it works even when the keys just changed.
            let master = master_key.ok_or(LockError::MissingStorageKeys)?;

            let mut items = Self::read_plaintext_rows(&inner)?;
            for (key, value) in inner.ephemeral.drain() {
                items.push((key, value));
            }

            let tx = inner.conn.transaction().map_err(db_err)?;
            for (key, value) in &items {
                let stored = encrypt_string(&master, value)?;
                tx.execute(
                    "INSERT INTO items (key, value, encrypted) VALUES (?1, ?2, 1)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        encrypted = excluded.encrypted",
                    rusqlite::params![key, stored],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            info!("storage items migrated to encrypted mode");
            return Ok(());
        }

        // Full rewrite: decrypt everything into a staging view, then commit
        // the whole store in the target representation at once.
        if mode == StorageMode::FixedEncrypted && master_key.is_none() {
            return Err(LockError::MissingStorageKeys);
        }

        let mut items = Self::read_all_plaintext(&inner)?;
        for (key, value) in inner.ephemeral.drain() {
            items.push((key, value));
        }

        let tx = inner.conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM items", []).map_err(db_err)?;

        if mode != StorageMode::Ephemeral {
            let encrypt = mode == StorageMode::FixedEncrypted;
            for (key, value) in &items {
                let stored = if encrypt {
                    let master = master_key.ok_or(LockError::MissingStorageKeys)?;
                    encrypt_string(&master, value)?
                } else {
                    value.clone()
                };
                tx.execute(
                    "INSERT INTO items (key, value, encrypted) VALUES (?1, ?2, ?3)",
                    rusqlite::params![key, stored, encrypt],
                )
                .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)?;

        if mode == StorageMode::Ephemeral {
            inner.ephemeral = items.into_iter().collect();
        }

        info!(?mode, force, "storage items migrated");
        Ok(())
    }

    fn set_keys(&self, master_key: Option<[u8; 32]>) {
        if let Ok(mut inner) = self.lock_inner() {
            inner.master_key = master_key;
        }
    }

    fn decrypt_storage(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        let items = Self::read_all_plaintext(&inner)?;

        let tx = inner.conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM items", []).map_err(db_err)?;
        for (key, value) in &items {
            tx.execute(
                "INSERT INTO items (key, value, encrypted) VALUES (?1, ?2, 0)",
                rusqlite::params![key, value],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;

        info!("storage decrypted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_row(store: &LocalKeyStore, key: &str) -> Option<(String, bool)> {
        let inner = store.inner.lock().unwrap();
        inner
            .conn
            .query_row(
                "SELECT value, encrypted FROM items WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok()
    }

    fn persisted_count(store: &LocalKeyStore) -> i64 {
        let inner = store.inner.lock().unwrap();
        inner
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn fixed_items_roundtrip() {
        let store = LocalKeyStore::open_in_memory().unwrap();

        store.set_item("theme", "dark", StorageMode::Fixed).unwrap();
        assert_eq!(
            store.get_item("theme", StorageMode::Fixed).unwrap(),
            Some("dark".to_string())
        );

        store.remove_item("theme", StorageMode::Fixed).unwrap();
        assert_eq!(store.get_item("theme", StorageMode::Fixed).unwrap(), None);
    }

    #[test]
    fn ephemeral_items_never_touch_the_database() {
        let store = LocalKeyStore::open_in_memory().unwrap();

        store
            .set_item("session", "token", StorageMode::Ephemeral)
            .unwrap();
        assert_eq!(persisted_count(&store), 0);
        assert_eq!(
            store.get_item("session", StorageMode::Ephemeral).unwrap(),
            Some("token".to_string())
        );

        store.remove_item("session", StorageMode::Ephemeral).unwrap();
        assert_eq!(
            store.get_item("session", StorageMode::Ephemeral).unwrap(),
            None
        );
    }

    #[test]
    fn encrypted_values_are_not_plaintext_at_rest() {
        let store = LocalKeyStore::open_in_memory().unwrap();
        store.set_keys(Some([3u8; 32]));

        store
            .set_item("note", "meet at noon", StorageMode::FixedEncrypted)
            .unwrap();

        let (raw, encrypted) = raw_row(&store, "note").unwrap();
        assert!(encrypted);
        assert_ne!(raw, "meet at noon");

        assert_eq!(
            store.get_item("note", StorageMode::FixedEncrypted).unwrap(),
            Some("meet at noon".to_string())
        );
    }

    #[test]
    fn encrypted_write_without_keys_degrades_to_plaintext() {
        let store = LocalKeyStore::open_in_memory().unwrap();

        store
            .set_item("interval", "60000", StorageMode::FixedEncrypted)
            .unwrap();

        let (raw, encrypted) = raw_row(&store, "interval").unwrap();
        assert!(!encrypted);
        assert_eq!(raw, "60000");
    }

    #[test]
    fn reading_encrypted_item_without_keys_fails() {
        let store = LocalKeyStore::open_in_memory().unwrap();
        store.set_keys(Some([3u8; 32]));
        store
            .set_item("note", "secret", StorageMode::FixedEncrypted)
            .unwrap();

        store.set_keys(None);
        assert!(matches!(
            store.get_item("note", StorageMode::FixedEncrypted),
            Err(LockError::MissingStorageKeys)
        ));
    }

    #[test]
    fn migration_to_encrypted_and_decrypt_storage() {
        let store = LocalKeyStore::open_in_memory().unwrap();
        store.set_item("a", "alpha", StorageMode::Fixed).unwrap();
        store.set_item("b", "beta", StorageMode::Fixed).unwrap();

        store.set_keys(Some([9u8; 32]));
        store
            .set_items_mode(StorageMode::FixedEncrypted, true)
            .unwrap();

        let (raw_a, enc_a) = raw_row(&store, "a").unwrap();
        assert!(enc_a);
        assert_ne!(raw_a, "alpha");
        // Reads still resolve plaintext through the keys
        assert_eq!(
            store.get_item("a", StorageMode::FixedEncrypted).unwrap(),
            Some("alpha".to_string())
        );

        store.decrypt_storage().unwrap();
        let (raw_b, enc_b) = raw_row(&store, "b").unwrap();
        assert!(!enc_b);
        assert_eq!(raw_b, "beta");
    }

    #[test]
    fn migration_to_encrypted_requires_keys() {
        let store = LocalKeyStore::open_in_memory().unwrap();
        store.set_item("a", "alpha", StorageMode::Fixed).unwrap();

        assert!(matches!(
            store.set_items_mode(StorageMode::FixedEncrypted, true),
            Err(LockError::MissingStorageKeys)
        ));
        // Store untouched on failure
        let (raw, encrypted) = raw_row(&store, "a").unwrap();
        assert!(!encrypted);
        assert_eq!(raw, "alpha");
    }

    #[test]
    fn migration_to_ephemeral_empties_the_database() {
        let store = LocalKeyStore::open_in_memory().unwrap();
        store.set_item("a", "alpha", StorageMode::Fixed).unwrap();

        store.set_items_mode(StorageMode::Ephemeral, false).unwrap();
        assert_eq!(persisted_count(&store), 0);
        assert_eq!(
            store.get_item("a", StorageMode::Ephemeral).unwrap(),
            Some("alpha".to_string())
        );
    }

    #[test]
    fn migration_to_fixed_transfers_ephemeral_items() {
        let store = LocalKeyStore::open_in_memory().unwrap();
        store
            .set_item("session", "token", StorageMode::Ephemeral)
            .unwrap();

        store.set_items_mode(StorageMode::Fixed, false).unwrap();
        assert_eq!(
            store.get_item("session", StorageMode::Fixed).unwrap(),
            Some("token".to_string())
        );
        assert_eq!(
            store.get_item("session", StorageMode::Ephemeral).unwrap(),
            None
        );
    }
}
