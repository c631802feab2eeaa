//! Credential persistence.
//!
//! The [`Storage`] trait abstracts over where auth keys live so callers can
//! pick a binary file per account, an in-memory store (optionally seeded
//! from a session string), SQLite, or their own backend.
//!
//! Built-in backends:
//! * [`FileStorage`]: `<workdir>/<account>.session`, compact binary (default).
//! * [`MemoryStorage`]: nothing touches disk.
//! * [`SqliteStorage`]: SQLite (requires the `sqlite-storage` Cargo feature).

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_crypto::AuthKey;

use crate::endpoint::Endpoint;

// ─── Credentials ──────────────────────────────────────────────────────────────

/// Everything needed to resume an encrypted session without a handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Credentials {
    pub account:     String,
    pub endpoint:    Endpoint,
    pub auth_key:    AuthKey,
    pub salt:        i64,
    pub time_offset: i32,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage i/o: {0}")]
    Io(#[from] io::Error),

    #[error("stored session is corrupt: {0}")]
    Corrupt(&'static str),

    #[error("invalid session string: {0}")]
    BadSessionString(String),

    #[cfg(feature = "sqlite-storage")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Where and how credentials are persisted.
///
/// One record per (account, datacenter, media flag, test flag). Addresses
/// may change between runs; lookups ignore them.
pub trait Storage: Send + Sync {
    /// The stored credentials for `endpoint`, if any.
    fn load(&self, account: &str, endpoint: &Endpoint) -> Result<Option<Credentials>, StorageError>;

    /// Insert or replace the record for `credentials.endpoint`.
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError>;

    /// Forget everything stored for `account`.
    fn delete(&self, account: &str) -> Result<(), StorageError>;

    /// The datacenter the account last settled on.
    fn home_dc(&self, account: &str) -> Result<Option<i32>, StorageError>;

    /// Record the account's home datacenter (after a migration).
    fn set_home_dc(&self, account: &str, dc_id: i32) -> Result<(), StorageError>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── Binary record ────────────────────────────────────────────────────────────

const RECORD_VERSION: u8 = 1;

#[derive(Clone, Debug, Default, PartialEq)]
struct AccountRecord {
    home_dc: Option<i32>,
    entries: Vec<Credentials>,
}

impl AccountRecord {
    fn find(&self, endpoint: &Endpoint) -> Option<&Credentials> {
        self.entries.iter().find(|c| c.endpoint.same_dc(endpoint))
    }

    fn upsert(&mut self, credentials: &Credentials) {
        self.entries.retain(|c| !c.endpoint.same_dc(&credentials.endpoint));
        self.entries.push(credentials.clone());
    }

    fn encode(&self) -> Vec<u8> {
        let mut b = vec![RECORD_VERSION];
        b.extend_from_slice(&self.home_dc.unwrap_or(0).to_le_bytes());
        b.push(self.entries.len() as u8);
        for c in &self.entries {
            let ep = &c.endpoint;
            b.extend_from_slice(&ep.dc_id.to_le_bytes());
            b.push(u8::from(ep.media) | u8::from(ep.test_mode) << 1);
            match ep.addr {
                IpAddr::V4(a) => { b.push(4); b.extend_from_slice(&a.octets()); }
                IpAddr::V6(a) => { b.push(6); b.extend_from_slice(&a.octets()); }
            }
            b.extend_from_slice(&ep.port.to_le_bytes());
            b.extend_from_slice(&c.auth_key.to_bytes());
            b.extend_from_slice(&c.salt.to_le_bytes());
            b.extend_from_slice(&c.time_offset.to_le_bytes());
        }
        b
    }

    fn decode(account: &str, buf: &[u8]) -> Result<Self, StorageError> {
        let mut p = 0usize;
        macro_rules! r {
            ($n:expr) => {{
                if p + $n > buf.len() {
                    return Err(StorageError::Corrupt("truncated record"));
                }
                let s = &buf[p..p + $n];
                p += $n;
                s
            }};
        }
        macro_rules! arr {
            ($n:expr) => {{
                let mut a = [0u8; $n];
                a.copy_from_slice(r!($n));
                a
            }};
        }

        if r!(1)[0] != RECORD_VERSION {
            return Err(StorageError::Corrupt("unknown record version"));
        }
        let home = i32::from_le_bytes(arr!(4));
        let count = r!(1)[0] as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let dc_id = i32::from_le_bytes(arr!(4));
            let flags = r!(1)[0];
            let addr = match r!(1)[0] {
                4 => IpAddr::from(arr!(4)),
                6 => IpAddr::from(arr!(16)),
                _ => return Err(StorageError::Corrupt("bad address family")),
            };
            let port = u16::from_le_bytes(arr!(2));
            let auth_key = AuthKey::from_bytes(arr!(256));
            let salt = i64::from_le_bytes(arr!(8));
            let time_offset = i32::from_le_bytes(arr!(4));
            entries.push(Credentials {
                account: account.to_string(),
                endpoint: Endpoint { addr, port, dc_id, media: flags & 1 != 0, test_mode: flags & 2 != 0 },
                auth_key,
                salt,
                time_offset,
            });
        }
        Ok(Self { home_dc: (home != 0).then_some(home), entries })
    }
}

// ─── FileStorage ──────────────────────────────────────────────────────────────

/// One compact binary file per account inside a work directory.
pub struct FileStorage {
    workdir: PathBuf,
    // serializes read-modify-write of the same file
    lock:    Mutex<()>,
}

impl FileStorage {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into(), lock: Mutex::new(()) }
    }

    fn path(&self, account: &str) -> PathBuf {
        self.workdir.join(format!("{account}.session"))
    }

    fn read(&self, account: &str) -> Result<AccountRecord, StorageError> {
        match std::fs::read(self.path(account)) {
            Ok(buf) => AccountRecord::decode(account, &buf),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(AccountRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, account: &str, record: &AccountRecord) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.workdir)?;
        let path = self.path(account);
        let tmp = path.with_extension("session.tmp");
        std::fs::write(&tmp, record.encode())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn update(&self, account: &str, f: impl FnOnce(&mut AccountRecord)) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.read(account)?;
        f(&mut record);
        self.write(account, &record)
    }
}

impl Storage for FileStorage {
    fn load(&self, account: &str, endpoint: &Endpoint) -> Result<Option<Credentials>, StorageError> {
        Ok(self.read(account)?.find(endpoint).cloned())
    }

    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        self.update(&credentials.account, |r| r.upsert(credentials))
    }

    fn delete(&self, account: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path(account)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn home_dc(&self, account: &str) -> Result<Option<i32>, StorageError> {
        Ok(self.read(account)?.home_dc)
    }

    fn set_home_dc(&self, account: &str, dc_id: i32) -> Result<(), StorageError> {
        self.update(account, |r| r.home_dc = Some(dc_id))
    }

    fn name(&self) -> &str { "file" }
}

// ─── MemoryStorage ────────────────────────────────────────────────────────────

/// An ephemeral store. Can be seeded from, and exported to, a session string.
#[derive(Default)]
pub struct MemoryStorage {
    accounts: Mutex<HashMap<String, AccountRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `account` from a string produced by [`export_session_string`].
    ///
    /// [`export_session_string`]: MemoryStorage::export_session_string
    pub fn from_session_string(account: &str, session: &str) -> Result<Self, StorageError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(session.trim())
            .map_err(|e| StorageError::BadSessionString(e.to_string()))?;
        let record = AccountRecord::decode(account, &bytes)?;
        let storage = Self::new();
        storage.with(|m| m.insert(account.to_string(), record));
        Ok(storage)
    }

    /// Everything stored for `account` as a portable string.
    pub fn export_session_string(&self, account: &str) -> Option<String> {
        self.with(|m| m.get(account).map(|r| URL_SAFE_NO_PAD.encode(r.encode())))
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, AccountRecord>) -> R) -> R {
        f(&mut self.accounts.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Storage for MemoryStorage {
    fn load(&self, account: &str, endpoint: &Endpoint) -> Result<Option<Credentials>, StorageError> {
        Ok(self.with(|m| m.get(account).and_then(|r| r.find(endpoint).cloned())))
    }

    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        self.with(|m| m.entry(credentials.account.clone()).or_default().upsert(credentials));
        Ok(())
    }

    fn delete(&self, account: &str) -> Result<(), StorageError> {
        self.with(|m| m.remove(account));
        Ok(())
    }

    fn home_dc(&self, account: &str) -> Result<Option<i32>, StorageError> {
        Ok(self.with(|m| m.get(account).and_then(|r| r.home_dc)))
    }

    fn set_home_dc(&self, account: &str, dc_id: i32) -> Result<(), StorageError> {
        self.with(|m| m.entry(account.to_string()).or_default().home_dc = Some(dc_id));
        Ok(())
    }

    fn name(&self) -> &str { "memory" }
}

// ─── SqliteStorage ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-storage")]
pub use sqlite_storage::SqliteStorage;

#[cfg(feature = "sqlite-storage")]
mod sqlite_storage {
    use std::path::Path;

    use rusqlite::{Connection, OptionalExtension, params};

    use super::*;

    /// SQLite-backed credential store.
    ///
    /// Creates `accounts` and `credentials` tables if they do not exist.
    ///
    /// Enable with the `sqlite-storage` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// courier-client = { version = "*", features = ["sqlite-storage"] }
    /// ```
    pub struct SqliteStorage {
        conn: Mutex<Connection>,
    }

    impl SqliteStorage {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS accounts (
                    account TEXT PRIMARY KEY,
                    home_dc INTEGER
                );
                CREATE TABLE IF NOT EXISTS credentials (
                    account     TEXT    NOT NULL,
                    dc_id       INTEGER NOT NULL,
                    media       INTEGER NOT NULL,
                    test_mode   INTEGER NOT NULL,
                    addr        TEXT    NOT NULL,
                    port        INTEGER NOT NULL,
                    auth_key    BLOB    NOT NULL,
                    salt        INTEGER NOT NULL,
                    time_offset INTEGER NOT NULL,
                    PRIMARY KEY (account, dc_id, media, test_mode)
                );",
            )?;
            Ok(Self { conn: Mutex::new(conn) })
        }

        fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
            self.conn.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    impl Storage for SqliteStorage {
        fn load(&self, account: &str, endpoint: &Endpoint) -> Result<Option<Credentials>, StorageError> {
            let row = self
                .conn()
                .query_row(
                    "SELECT addr, port, auth_key, salt, time_offset FROM credentials
                     WHERE account = ?1 AND dc_id = ?2 AND media = ?3 AND test_mode = ?4",
                    params![account, endpoint.dc_id, endpoint.media, endpoint.test_mode],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u16>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i32>(4)?,
                        ))
                    },
                )
                .optional()?;

            let Some((addr, port, key, salt, time_offset)) = row else { return Ok(None) };
            let addr: IpAddr = addr.parse().map_err(|_| StorageError::Corrupt("bad address"))?;
            let auth_key = AuthKey::from_slice(&key).ok_or(StorageError::Corrupt("auth key is not 256 bytes"))?;
            Ok(Some(Credentials {
                account: account.to_string(),
                endpoint: Endpoint { addr, port, ..endpoint.clone() },
                auth_key,
                salt,
                time_offset,
            }))
        }

        fn save(&self, c: &Credentials) -> Result<(), StorageError> {
            let ep = &c.endpoint;
            self.conn().execute(
                "INSERT OR REPLACE INTO credentials
                    (account, dc_id, media, test_mode, addr, port, auth_key, salt, time_offset)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    c.account,
                    ep.dc_id,
                    ep.media,
                    ep.test_mode,
                    ep.addr.to_string(),
                    ep.port,
                    c.auth_key.to_bytes().to_vec(),
                    c.salt,
                    c.time_offset,
                ],
            )?;
            Ok(())
        }

        fn delete(&self, account: &str) -> Result<(), StorageError> {
            let conn = self.conn();
            conn.execute("DELETE FROM credentials WHERE account = ?1", params![account])?;
            conn.execute("DELETE FROM accounts WHERE account = ?1", params![account])?;
            Ok(())
        }

        fn home_dc(&self, account: &str) -> Result<Option<i32>, StorageError> {
            let dc = self
                .conn()
                .query_row("SELECT home_dc FROM accounts WHERE account = ?1", params![account], |row| {
                    row.get::<_, Option<i32>>(0)
                })
                .optional()?;
            Ok(dc.flatten())
        }

        fn set_home_dc(&self, account: &str, dc_id: i32) -> Result<(), StorageError> {
            self.conn().execute(
                "INSERT OR REPLACE INTO accounts (account, home_dc) VALUES (?1, ?2)",
                params![account, dc_id],
            )?;
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

// ─── StorageConfig ────────────────────────────────────────────────────────────

/// Which backend a client persists credentials in.
#[derive(Clone)]
pub enum StorageConfig {
    /// `<workdir>/<account>.session`.
    File { workdir: PathBuf },
    /// Nothing persisted; optionally seeded from a session string.
    Memory { session_string: Option<String> },
    /// An SQLite database file.
    #[cfg(feature = "sqlite-storage")]
    Sqlite { path: PathBuf },
    /// A caller-provided backend.
    Custom(Arc<dyn Storage>),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::File { workdir: PathBuf::from(".") }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { workdir } => f.debug_struct("File").field("workdir", workdir).finish(),
            // the string carries auth keys
            Self::Memory { session_string } => f
                .debug_struct("Memory")
                .field("session_string", &session_string.as_ref().map(|_| "<redacted>"))
                .finish(),
            #[cfg(feature = "sqlite-storage")]
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
            Self::Custom(s) => f.debug_tuple("Custom").field(&s.name()).finish(),
        }
    }
}

impl StorageConfig {
    /// Open the configured backend for `account`.
    pub fn open(&self, account: &str) -> Result<Arc<dyn Storage>, StorageError> {
        let storage: Arc<dyn Storage> = match self {
            Self::File { workdir } => Arc::new(FileStorage::new(workdir.clone())),
            Self::Memory { session_string: None } => Arc::new(MemoryStorage::new()),
            Self::Memory { session_string: Some(s) } => Arc::new(MemoryStorage::from_session_string(account, s)?),
            #[cfg(feature = "sqlite-storage")]
            Self::Sqlite { path } => Arc::new(SqliteStorage::open(path)?),
            Self::Custom(s) => Arc::clone(s),
        };
        tracing::debug!("[courier] storage backend: {}", storage.name());
        Ok(storage)
    }
}
