use crate::net::support::{ErrorType, NetworkError};
use argon::crypto;
use argon::logging;
use hashbrown::{HashMap, HashSet};
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// A single proxy mapping: the key the client authenticates with, the
/// upstream address it is forwarded to, and the upstream's own password in
/// case the upstream requires VNC auth.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub forward_key: String,
    pub dest_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_passwd: Option<String>,
}

#[derive(Debug)]
pub enum RegistryError {
    /// Another mapping with the same key (after VNC 8-byte normalization)
    /// already exists.
    DuplicateKey,
    /// The forward key length is outside 1..=8 bytes.
    InvalidName,
    Io(io::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

impl From<io::Error> for RegistryError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        RegistryError::Io(io_error)
    }
}

impl From<RegistryError> for NetworkError {
    #[inline]
    fn from(_: RegistryError) -> Self {
        NetworkError::Fatal(ErrorType::Registry)
    }
}

/// The persisted table of proxy mappings, indexed by the VNC-normalized
/// forward key. Admin commands mutate it; session handlers only take
/// snapshots. Every mutating call rewrites the backing file.
pub struct MappingStore {
    path: PathBuf,
    mappings: Mutex<HashMap<[u8; crypto::KEY_SIZE], Mapping>>,
    log: logging::Logger,
}

impl MappingStore {
    /// Opens the store backed by the given file, loading any mappings it
    /// already holds. A missing file is treated as an empty store.
    pub fn open<P: AsRef<Path>>(path: P, log: &logging::Logger) -> RegistryResult<MappingStore> {
        let store = MappingStore {
            path: path.as_ref().to_path_buf(),
            mappings: Mutex::new(HashMap::new()),
            log: log.new(logging::o!()),
        };

        match fs::read(&store.path) {
            Ok(raw) => {
                let records: Vec<Mapping> = serde_json::from_slice(&raw)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                let mut mappings = store.lock();
                for mapping in records {
                    let key = crypto::pad_key(mapping.forward_key.as_bytes());
                    if mappings.insert(key, mapping).is_some() {
                        logging::warn!(store.log, "dropped colliding mapping on load";
                                       "store" => %store.path.display());
                    }
                }
                drop(mappings);
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }

        logging::debug!(store.log, "mapping store opened";
                        "store" => %store.path.display(),
                        "mappings" => store.lock().len());

        Ok(store)
    }

    /// Looks up a mapping by its exact forward key.
    pub fn lookup(&self, forward_key: &str) -> Option<Mapping> {
        let mappings = self.lock();

        mappings
            .get(&crypto::pad_key(forward_key.as_bytes()))
            .filter(|mapping| mapping.forward_key == forward_key)
            .cloned()
    }

    /// Inserts a new mapping. The key must be 1..=8 bytes long and must not
    /// collide with an existing mapping after VNC normalization; colliding
    /// keys are indistinguishable on the wire regardless of their raw length,
    /// so the collision check runs before the length check.
    pub fn insert(&self, mapping: Mapping) -> RegistryResult<()> {
        let key = crypto::pad_key(mapping.forward_key.as_bytes());
        let mut mappings = self.lock();

        if mappings.contains_key(&key) {
            return Err(RegistryError::DuplicateKey);
        }

        if mapping.forward_key.is_empty() || mapping.forward_key.len() > crypto::KEY_SIZE {
            return Err(RegistryError::InvalidName);
        }

        logging::info!(self.log, "mapping added";
                       "forward_key" => &mapping.forward_key,
                       "dest_addr" => &mapping.dest_addr,
                       "dest_auth" => mapping.dest_passwd.is_some());

        mappings.insert(key, mapping);
        self.flush(&mappings)
    }

    /// Removes the mapping with the given exact forward key. Returns the
    /// number of mappings removed.
    pub fn remove(&self, forward_key: &str) -> RegistryResult<usize> {
        let key = crypto::pad_key(forward_key.as_bytes());
        let mut mappings = self.lock();

        let matches_exactly = mappings
            .get(&key)
            .map_or(false, |mapping| mapping.forward_key == forward_key);

        let cnt = if matches_exactly {
            mappings.remove(&key);
            1
        } else {
            0
        };

        if cnt > 0 {
            logging::info!(self.log, "mapping removed"; "forward_key" => forward_key);
        }

        self.flush(&mappings)?;
        Ok(cnt)
    }

    /// Removes every mapping whose destination host matches, restricted to
    /// one port when given. Returns the number of mappings removed.
    pub fn remove_by_dest(&self, host: &str, port: Option<u16>) -> RegistryResult<usize> {
        let mut mappings = self.lock();
        let before = mappings.len();

        mappings.retain(|_, mapping| {
            let (dest_host, dest_port) = split_addr(&mapping.dest_addr);
            let doomed = dest_host == host && port.map_or(true, |port| dest_port == Some(port));
            !doomed
        });

        let cnt = before - mappings.len();
        if cnt > 0 {
            logging::info!(self.log, "mappings removed by destination";
                           "host" => host, "cnt" => cnt);
        }

        self.flush(&mappings)?;
        Ok(cnt)
    }

    /// Returns a point-in-time copy of all mappings. Callers iterate the
    /// copy, never the store, so no lock is held across network I/O.
    pub fn snapshot(&self) -> Vec<Mapping> {
        self.lock().values().cloned().collect()
    }

    /// Returns the set of currently valid forward keys. Used by the live
    /// session cleanup scan.
    pub fn key_set(&self) -> HashSet<String> {
        self.lock()
            .values()
            .map(|mapping| mapping.forward_key.clone())
            .collect()
    }

    fn flush(&self, mappings: &HashMap<[u8; crypto::KEY_SIZE], Mapping>) -> RegistryResult<()> {
        let mut records: Vec<&Mapping> = mappings.values().collect();
        records.sort_by(|a, b| a.forward_key.cmp(&b.forward_key));

        let raw = serde_json::to_vec_pretty(&records)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        fs::write(&self.path, raw)?;
        Ok(())
    }

    #[inline]
    fn lock(&self) -> MutexGuard<HashMap<[u8; crypto::KEY_SIZE], Mapping>> {
        self.mappings.lock().expect("Mapping store lock poisoned")
    }
}

/// Splits a `host:port` destination address. A missing or unparsable port
/// yields `None` so host-only matches still work.
fn split_addr(addr: &str) -> (&str, Option<u16>) {
    match addr.rfind(':') {
        Some(idx) => (&addr[..idx], addr[idx + 1..].parse().ok()),
        None => (addr, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon::logging;
    use std::env;
    use std::process;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static STORE_SEQ: AtomicUsize = AtomicUsize::new(0);

    struct StoreFile(PathBuf);

    impl StoreFile {
        fn new() -> StoreFile {
            let seq = STORE_SEQ.fetch_add(1, Ordering::SeqCst);
            StoreFile(env::temp_dir().join(format!(
                "conduit-registry-test-{}-{}.json",
                process::id(),
                seq
            )))
        }
    }

    impl Drop for StoreFile {
        fn drop(&mut self) {
            drop(fs::remove_file(&self.0));
        }
    }

    fn mapping(forward_key: &str, dest_addr: &str) -> Mapping {
        Mapping {
            forward_key: forward_key.to_string(),
            dest_addr: dest_addr.to_string(),
            dest_passwd: None,
        }
    }

    #[test]
    fn test_insert_lookup_remove() {
        let file = StoreFile::new();
        let store = MappingStore::open(&file.0, &logging::discard()).unwrap();

        store.insert(mapping("pass", "127.0.0.1:5901")).unwrap();

        assert_eq!(store.lookup("pass"), Some(mapping("pass", "127.0.0.1:5901")));
        assert_eq!(store.lookup("word"), None);

        assert_eq!(store.remove("pass").unwrap(), 1);
        assert_eq!(store.lookup("pass"), None);
        assert_eq!(store.remove("pass").unwrap(), 0);
    }

    #[test]
    fn test_insert_rejects_normalized_duplicate() {
        let file = StoreFile::new();
        let store = MappingStore::open(&file.0, &logging::discard()).unwrap();

        store.insert(mapping("abcdefgh", "127.0.0.1:5901")).unwrap();

        // Ten bytes, but the first eight collide with the existing key.
        match store.insert(mapping("abcdefghij", "127.0.0.1:5902")) {
            Err(RegistryError::DuplicateKey) => (),
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_insert_rejects_invalid_names() {
        let file = StoreFile::new();
        let store = MappingStore::open(&file.0, &logging::discard()).unwrap();

        match store.insert(mapping("", "127.0.0.1:5901")) {
            Err(RegistryError::InvalidName) => (),
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }

        match store.insert(mapping("overlongkey", "127.0.0.1:5901")) {
            Err(RegistryError::InvalidName) => (),
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_remove_by_dest() {
        let file = StoreFile::new();
        let store = MappingStore::open(&file.0, &logging::discard()).unwrap();

        store.insert(mapping("one", "10.0.0.1:5901")).unwrap();
        store.insert(mapping("two", "10.0.0.1:5902")).unwrap();
        store.insert(mapping("three", "10.0.0.2:5901")).unwrap();

        assert_eq!(store.remove_by_dest("10.0.0.1", Some(5902)).unwrap(), 1);
        assert_eq!(store.lookup("two"), None);
        assert!(store.lookup("one").is_some());

        // Port elided: every mapping on the host goes.
        assert_eq!(store.remove_by_dest("10.0.0.1", None).unwrap(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_mutations_survive_reopen() {
        let file = StoreFile::new();

        {
            let store = MappingStore::open(&file.0, &logging::discard()).unwrap();
            store
                .insert(Mapping {
                    forward_key: "pass".to_string(),
                    dest_addr: "127.0.0.1:5901".to_string(),
                    dest_passwd: Some("secret".to_string()),
                })
                .unwrap();
        }

        let store = MappingStore::open(&file.0, &logging::discard()).unwrap();
        let loaded = store.lookup("pass").unwrap();

        assert_eq!(loaded.dest_addr, "127.0.0.1:5901");
        assert_eq!(loaded.dest_passwd.as_deref(), Some("secret"));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let file = StoreFile::new();
        let store = MappingStore::open(&file.0, &logging::discard()).unwrap();

        store.insert(mapping("pass", "127.0.0.1:5901")).unwrap();
        let snapshot = store.snapshot();

        store.remove("pass").unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_key_set() {
        let file = StoreFile::new();
        let store = MappingStore::open(&file.0, &logging::discard()).unwrap();

        store.insert(mapping("one", "10.0.0.1:5901")).unwrap();
        store.insert(mapping("two", "10.0.0.1:5902")).unwrap();

        let keys = store.key_set();
        assert!(keys.contains("one"));
        assert!(keys.contains("two"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_split_addr() {
        assert_eq!(split_addr("10.0.0.1:5901"), ("10.0.0.1", Some(5901)));
        assert_eq!(split_addr("10.0.0.1"), ("10.0.0.1", None));
        assert_eq!(split_addr("host:notaport"), ("host", None));
    }
}
