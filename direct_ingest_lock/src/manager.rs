use chrono::{DateTime, TimeDelta, Utc};
use futures::TryStreamExt;
use iox_time::TimeProvider;
use object_store::{ObjectStore, PutMode, PutPayload, UpdateVersion, path::Path};
use observability_deps::tracing::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{Error, Result};

/// Directory under which lock objects are stored.
const LOCK_DIR: &str = "locks";
/// Markers claiming the takeover of one expired acquisition, for stores without
/// conditional updates.
const TAKEOVER_DIR: &str = "lock_takeovers";

/// Contents of a lock object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_name: String,
    /// Unique per acquisition, lets a holder check it still owns the lock.
    pub lock_id: String,
    pub payload: Option<String>,
    pub expiration_time: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration_time
    }
}

/// Acquires and releases locks stored in an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct LockManager {
    object_store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl LockManager {
    pub fn new(object_store: Arc<dyn ObjectStore>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            object_store,
            time_provider,
        }
    }

    fn path(lock_name: &str) -> Path {
        Path::from(format!("{LOCK_DIR}/{lock_name}"))
    }

    fn now(&self) -> DateTime<Utc> {
        self.time_provider.now().date_time()
    }

    fn takeover_path(lock_name: &str, expired_lock_id: &str) -> Path {
        Path::from(format!("{TAKEOVER_DIR}/{lock_name}/{expired_lock_id}"))
    }

    fn already_exists(lock_name: &str) -> Error {
        Error::LockAlreadyExists {
            lock_name: lock_name.to_string(),
        }
    }

    fn object_store_error(lock_name: &str, source: object_store::Error) -> Error {
        Error::ObjectStore {
            lock_name: lock_name.to_string(),
            source,
        }
    }

    /// Acquires `lock_name` for `ttl`.
    ///
    /// Fails with [`Error::LockAlreadyExists`] if an unexpired lock with that
    /// name is held. An expired lock is replaced.
    pub async fn acquire(
        &self,
        lock_name: &str,
        payload: Option<String>,
        ttl: Duration,
    ) -> Result<Lock> {
        let now = self.now();
        let lock = Lock {
            lock_name: lock_name.to_string(),
            lock_id: Uuid::new_v4().to_string(),
            payload,
            expiration_time: TimeDelta::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let body = PutPayload::from(serde_json::to_vec(&lock).map_err(|source| {
            Error::Corrupt {
                lock_name: lock_name.to_string(),
                source,
            }
        })?);
        let path = Self::path(lock_name);

        if self.try_create(&path, lock_name, body.clone()).await? {
            debug!(lock_name, lock_id = %lock.lock_id, "acquired lock");
            return Ok(lock);
        }

        let Some((existing, version)) = self.read(&path, lock_name).await? else {
            // released between our create attempt and the read
            return if self.try_create(&path, lock_name, body).await? {
                Ok(lock)
            } else {
                Err(Error::LockAlreadyExists {
                    lock_name: lock_name.to_string(),
                })
            };
        };

        if !existing.is_expired(now) {
            return Err(Error::LockAlreadyExists {
                lock_name: lock_name.to_string(),
            });
        }

        info!(
            lock_name,
            expired_lock_id = %existing.lock_id,
            expiration_time = %existing.expiration_time,
            "replacing expired lock"
        );
        match self
            .object_store
            .put_opts(&path, body.clone(), PutMode::Update(version).into())
            .await
        {
            Ok(_) => Ok(lock),
            Err(object_store::Error::Precondition { .. })
            | Err(object_store::Error::AlreadyExists { .. }) => Err(Error::LockAlreadyExists {
                lock_name: lock_name.to_string(),
            }),
            Err(object_store::Error::NotImplemented) => {
                self.take_over_expired(&path, &existing, lock, body).await
            }
            Err(e) => Err(Self::object_store_error(lock_name, e)),
        }
    }

    /// Replaces the expired acquisition `expired` on a store without conditional
    /// updates.
    ///
    /// Only the contender that creates the takeover marker for `expired` may
    /// delete the lock object. Holders never release a lock once it expired, so
    /// the object deleted here is the expired acquisition and never a fresh one.
    async fn take_over_expired(
        &self,
        path: &Path,
        expired: &Lock,
        lock: Lock,
        body: PutPayload,
    ) -> Result<Lock> {
        let lock_name = lock.lock_name.as_str();
        let marker = Self::takeover_path(lock_name, &expired.lock_id);
        let marker_body = PutPayload::from(lock.lock_id.clone().into_bytes());
        if !self.try_create(&marker, lock_name, marker_body).await? {
            debug!(lock_name, expired_lock_id = %expired.lock_id, "takeover already claimed");
            return Err(Self::already_exists(lock_name));
        }

        let created: Result<bool> = async {
            match self.read(path, lock_name).await? {
                Some((current, _)) if current.lock_id == expired.lock_id => {
                    self.delete(path, lock_name).await?;
                }
                // replaced by a previous takeover
                Some(_) => return Ok(false),
                None => {}
            }
            self.try_create(path, lock_name, body).await
        }
        .await;

        if let Err(e) = self.delete(&marker, lock_name).await {
            warn!(lock_name, %e, "failed to delete lock takeover marker");
        }
        if created? {
            Ok(lock)
        } else {
            Err(Self::already_exists(lock_name))
        }
    }

    /// Conditionally creates the lock object. Returns `false` if it already exists.
    async fn try_create(&self, path: &Path, lock_name: &str, body: PutPayload) -> Result<bool> {
        match self
            .object_store
            .put_opts(path, body, PutMode::Create.into())
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(Self::object_store_error(lock_name, e)),
        }
    }

    async fn read(&self, path: &Path, lock_name: &str) -> Result<Option<(Lock, UpdateVersion)>> {
        let result = match self.object_store.get(path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(Self::object_store_error(lock_name, e)),
        };
        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|e| Self::object_store_error(lock_name, e))?;
        let lock = serde_json::from_slice(&bytes).map_err(|source| Error::Corrupt {
            lock_name: lock_name.to_string(),
            source,
        })?;
        Ok(Some((lock, version)))
    }

    async fn delete(&self, path: &Path, lock_name: &str) -> Result<()> {
        match self.object_store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Self::object_store_error(lock_name, e)),
        }
    }

    /// Returns the stored lock, expired or not.
    pub async fn get_lock(&self, lock_name: &str) -> Result<Option<Lock>> {
        Ok(self
            .read(&Self::path(lock_name), lock_name)
            .await?
            .map(|(lock, _)| lock))
    }

    /// Releases `lock_name` regardless of who holds it. No-op if absent.
    pub async fn release(&self, lock_name: &str) -> Result<()> {
        debug!(lock_name, "releasing lock");
        self.delete(&Self::path(lock_name), lock_name).await
    }

    /// Releases the lock only if it is still the acquisition described by `lock`.
    /// Returns whether a lock was deleted.
    pub async fn release_if_owned(&self, lock: &Lock) -> Result<bool> {
        let path = Self::path(&lock.lock_name);
        match self.read(&path, &lock.lock_name).await? {
            Some((current, _)) if current.is_expired(self.now()) => {
                // an expired lock is only ever removed by the contender taking it over
                warn!(
                    lock_name = %lock.lock_name,
                    lock_id = %lock.lock_id,
                    current_lock_id = %current.lock_id,
                    "lock expired before release, leaving it for takeover"
                );
                Ok(false)
            }
            Some((current, _)) if current.lock_id == lock.lock_id => {
                self.delete(&path, &lock.lock_name).await?;
                debug!(lock_name = %lock.lock_name, lock_id = %lock.lock_id, "released lock");
                Ok(true)
            }
            Some((current, _)) => {
                warn!(
                    lock_name = %lock.lock_name,
                    lock_id = %lock.lock_id,
                    current_lock_id = %current.lock_id,
                    "lock was taken over after it expired, not releasing"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Whether an unexpired lock named `lock_name` exists.
    pub async fn is_locked(&self, lock_name: &str) -> Result<bool> {
        let now = self.now();
        Ok(self
            .get_lock(lock_name)
            .await?
            .is_some_and(|lock| !lock.is_expired(now)))
    }

    /// Names of all held (unexpired) locks starting with `prefix`, sorted.
    pub async fn lock_names_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = Path::from(LOCK_DIR);
        let metas: Vec<_> = self
            .object_store
            .list(Some(&dir))
            .try_collect()
            .await
            .map_err(|e| Self::object_store_error(prefix, e))?;

        let mut names = Vec::new();
        for meta in metas {
            let Some(name) = meta.location.filename() else {
                continue;
            };
            if name.starts_with(prefix) && self.is_locked(name).await? {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Acquires `lock_name` and returns a guard that releases it when dropped.
    pub async fn acquire_guard(
        &self,
        lock_name: &str,
        payload: Option<String>,
        ttl: Duration,
    ) -> Result<LockGuard> {
        let lock = self.acquire(lock_name, payload, ttl).await?;
        Ok(LockGuard {
            manager: self.clone(),
            lock: Some(lock),
        })
    }

    /// Runs `f` while holding `lock_name`. The lock is released on every exit
    /// path, including when `f` fails.
    pub async fn using_lock<F, Fut, T, E>(
        &self,
        lock_name: &str,
        payload: Option<String>,
        ttl: Duration,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<Error> + std::fmt::Display + Send,
    {
        let lock = self.acquire(lock_name, payload, ttl).await?;
        self.run_holding(lock, f).await
    }

    /// Runs `f` holding the already acquired `lock`, then releases it on every
    /// exit path.
    pub async fn run_holding<F, Fut, T, E>(&self, lock: Lock, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<Error> + std::fmt::Display + Send,
    {
        let result = f().await;
        match (result, self.release_if_owned(&lock).await) {
            (Ok(v), Ok(_)) => Ok(v),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(release_error)) => {
                warn!(
                    lock_name = %lock.lock_name,
                    %release_error,
                    error = %e,
                    "failed to release lock after error, lock will expire"
                );
                Err(e)
            }
        }
    }
}

/// Holds a lock until [`LockGuard::release`] is called or the guard is dropped.
///
/// Dropping the guard releases the lock from a background task, so prefer an
/// explicit `release` where the result matters.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    lock: Option<Lock>,
}

impl LockGuard {
    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            self.manager.release_if_owned(&lock).await?;
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                handle.spawn(async move {
                    if let Err(e) = manager.release_if_owned(&lock).await {
                        warn!(lock_name = %lock.lock_name, %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock_name = %lock.lock_name,
                    "lock guard dropped outside of a runtime, lock will expire"
                );
            }
        }
    }
}
