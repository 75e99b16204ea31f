//! Per-script key-value persistence.
//!
//! Each script owns one JSON document under `.state/<script>.json`. Caps are
//! enforced before anything touches disk: at most 1000 keys and 64 KiB
//! serialised. Writes are serialised per file; different scripts never
//! contend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};

/// Maximum keys in one script's document.
pub const MAX_KEYS: usize = 1000;
/// Maximum serialised document size.
pub const MAX_BYTES: usize = 64 * 1024;

/// Factory for per-script handles, sharing one lock per state file.
pub struct KvStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KvStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for one script's document.
    pub fn handle(&self, script: &str) -> KvHandle {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(script.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        KvHandle {
            path: self.dir.join(format!("{script}.json")),
            lock,
        }
    }
}

#[derive(Clone)]
pub struct KvHandle {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl KvHandle {
    fn load(&self) -> Result<serde_json::Map<String, Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let doc: Value = serde_json::from_str(&raw)
                    .map_err(|e| Error::Invalid(format!("kv state: {e}")))?;
                match doc {
                    Value::Object(map) => Ok(map),
                    _ => Err(Error::Invalid("kv state is not an object".into())),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
            Err(e) => Err(Error::Invalid(format!("kv read: {e}"))),
        }
    }

    fn store(&self, doc: &serde_json::Map<String, Value>) -> Result<()> {
        if doc.len() > MAX_KEYS {
            return Err(Error::Full(format!("kv document exceeds {MAX_KEYS} keys")));
        }
        let serialised =
            serde_json::to_vec(doc).map_err(|e| Error::Invalid(format!("kv encode: {e}")))?;
        if serialised.len() > MAX_BYTES {
            return Err(Error::Full(format!(
                "kv document exceeds {MAX_BYTES} bytes"
            )));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Invalid(format!("kv dir: {e}")))?;
        }
        std::fs::write(&self.path, serialised).map_err(|e| Error::Invalid(format!("kv write: {e}")))
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.get(key).cloned())
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock();
        let mut doc = self.load()?;
        doc.insert(key.to_string(), value);
        self.store(&doc)
    }

    pub fn del(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut doc = self.load()?;
        if doc.remove(key).is_some() {
            self.store(&doc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_del_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(dir.path().to_path_buf());
        let kv = store.handle("counter");

        assert_eq!(kv.get("n").unwrap(), None);
        kv.set("n", json!(41)).unwrap();
        kv.set("tags", json!(["a", "b"])).unwrap();
        assert_eq!(kv.get("n").unwrap(), Some(json!(41)));

        // a second handle to the same script sees the same document
        let again = store.handle("counter");
        assert_eq!(again.get("tags").unwrap(), Some(json!(["a", "b"])));

        kv.del("n").unwrap();
        assert_eq!(kv.get("n").unwrap(), None);
        kv.del("never-existed").unwrap(); // idempotent
    }

    #[test]
    fn scripts_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(dir.path().to_path_buf());
        store.handle("a").set("k", json!(1)).unwrap();
        assert_eq!(store.handle("b").get("k").unwrap(), None);
    }

    #[test]
    fn key_cap_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(dir.path().to_path_buf());
        let kv = store.handle("big");
        // Build the document directly to keep the test fast.
        let mut doc = serde_json::Map::new();
        for i in 0..MAX_KEYS {
            doc.insert(format!("k{i}"), json!(0));
        }
        kv.store(&doc).unwrap();
        let err = kv.set("one-more", json!(0)).unwrap_err();
        assert!(matches!(err, Error::Full(_)), "{err}");
    }

    #[test]
    fn size_cap_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(dir.path().to_path_buf());
        let kv = store.handle("fat");
        let err = kv
            .set("blob", json!("x".repeat(MAX_BYTES + 1)))
            .unwrap_err();
        assert!(matches!(err, Error::Full(_)), "{err}");
        // nothing was written
        assert_eq!(kv.get("blob").unwrap(), None);
    }
}
