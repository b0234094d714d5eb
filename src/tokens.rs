//! Durable storage of device tokens.
//! Keeps a pretty-printed JSON file of `device id -> hex token` in sync with
//! an in-memory map shared by every session.

use crate::error::{MiioError, Result};
use crate::protocol::Token;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Cached contents are served without touching the disk for this long.
const CHECK_TIME: Duration = Duration::from_secs(1);
/// After this long the file is re-read even if its mtime did not move.
const MAX_STALE_TIME: Duration = Duration::from_secs(120);

struct Cache {
    data: BTreeMap<String, String>,
    last_sync: Option<(Instant, SystemTime)>,
}

impl Cache {
    fn is_fresh(&self) -> bool {
        self.last_sync
            .is_some_and(|(at, _)| at.elapsed() <= CHECK_TIME)
    }
}

struct TokenStoreInner {
    path: PathBuf,
    cache: Mutex<Cache>,
    // Held while the file is read or written, so a reload never sees a
    // half-written file; concurrent reloads share one read
    load_lock: tokio::sync::Mutex<()>,
    // Held while writing; a waiter re-saves only if `dirty` is still set
    save_lock: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
}

/// Shared token storage. Cloning yields another handle to the same store.
///
/// Construct it once and hand it to every session that may need a token.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

impl TokenStore {
    /// Create a store backed by the JSON file at `path`. Nothing is read yet.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            inner: Arc::new(TokenStoreInner {
                path: path.into(),
                cache: Mutex::new(Cache {
                    data: BTreeMap::new(),
                    last_sync: None,
                }),
                load_lock: tokio::sync::Mutex::new(()),
                save_lock: tokio::sync::Mutex::new(()),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Look up the token stored for `device_id`.
    ///
    /// Storage problems are logged and reported as "no token known".
    pub async fn get(&self, device_id: u32) -> Option<Token> {
        let key = device_id.to_string();
        let fresh = self.inner.cache.lock().is_fresh();
        if !fresh && let Err(e) = self.load().await {
            warn!("Token storage {} unreadable: {}", self.inner.path.display(), e);
            return None;
        }

        let stored = self.inner.cache.lock().data.get(&key).cloned()?;
        match stored.parse::<Token>() {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Ignoring stored token for device {}: {}", device_id, e);
                None
            }
        }
    }

    /// Remember `token` for `device_id` and persist the whole map.
    ///
    /// Returns once a save containing this update has reached the file.
    pub async fn update(&self, device_id: u32, token: &Token) -> Result<()> {
        self.load().await?;

        self.inner
            .cache
            .lock()
            .data
            .insert(device_id.to_string(), token.to_hex());
        self.inner.dirty.store(true, Ordering::SeqCst);

        let _saving = self.inner.save_lock.lock().await;
        if !self.inner.dirty.swap(false, Ordering::SeqCst) {
            debug!("Tokens already saved by a concurrent update");
            return Ok(());
        }

        let snapshot = self.inner.cache.lock().data.clone();
        let _writing = self.inner.load_lock.lock().await;
        if let Err(e) = self.save(&snapshot).await {
            // Leave the update pending for the next writer
            self.inner.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let _loading = self.inner.load_lock.lock().await;
        let (fresh, last_sync) = {
            let cache = self.inner.cache.lock();
            (cache.is_fresh(), cache.last_sync)
        };
        if fresh {
            // Another caller reloaded while we waited
            return Ok(());
        }

        debug!("Loading token storage from {}", self.inner.path.display());
        let meta = match tokio::fs::metadata(&self.inner.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Token storage does not exist");
                self.mark_synced();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !meta.is_file() {
            return Err(MiioError::Io(format!(
                "{} exists but is not a file",
                self.inner.path.display()
            )));
        }

        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let must_read = match last_sync {
            None => true,
            Some((at, wall)) => at.elapsed() > MAX_STALE_TIME || modified > wall,
        };

        if must_read {
            debug!("Loading tokens");
            let raw = tokio::fs::read(&self.inner.path).await?;
            let data: BTreeMap<String, String> = serde_json::from_slice(&raw)?;
            self.inner.cache.lock().data = data;
        }
        self.mark_synced();
        Ok(())
    }

    fn mark_synced(&self) {
        self.inner.cache.lock().last_sync = Some((Instant::now(), SystemTime::now()));
    }

    async fn save(&self, data: &BTreeMap<String, String>) -> Result<()> {
        debug!("About to save tokens");
        if let Some(dir) = self.inner.path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.inner.path, json).await?;
        Ok(())
    }
}
