//! Passcode lock state machine.
//!
//! [`PasscodeManager`] owns the application's lock state: whether a local
//! passcode exists, whether the application is currently locked behind it,
//! and the visibility-driven auto-lock timer that re-locks an idle
//! application. Key storage, key derivation, and data sync are injected
//! through the [`KeyStore`], [`PasscodeVerifier`], and [`SyncTrigger`]
//! seams; this module only orchestrates them.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::autolock::{AutoLockInterval, LockDeadline};
use crate::crypto::{AuthParams, DerivedKeys, PasscodeVerifier};
use crate::storage::{KeyStore, StorageMode};
use crate::sync::SyncTrigger;
use crate::{LockError, Result};

/// Key the passcode auth parameters are persisted under (plaintext)
pub const OFFLINE_PARAMS_KEY: &str = "offline_params";

/// Key the auto-lock interval is persisted under (encrypted)
pub const AUTO_LOCK_INTERVAL_KEY: &str = "auto_lock_interval";

/// Key the ephemeral-session flag is persisted under (plaintext)
pub const EPHEMERAL_SESSION_KEY: &str = "ephemeral_session";

/// Whether the application is behind the passcode right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

type VisibilityObserver = Arc<dyn Fn(bool) + Send + Sync>;
type PasscodeChangeObserver = Arc<dyn Fn() + Send + Sync>;
type ReloadHandler = Arc<dyn Fn() + Send + Sync>;

struct LockInner {
    state: LockState,
    has_passcode: bool,
    ephemeral_session: bool,
    keys: Option<DerivedKeys>,
    deadline: LockDeadline,
    timer: Option<JoinHandle<()>>,
    reload_handler: Option<ReloadHandler>,
    visibility_observers: Vec<(u64, VisibilityObserver)>,
    passcode_observers: Vec<(u64, PasscodeChangeObserver)>,
    next_observer_id: u64,
}

/// The auto-lock controller.
///
/// Single authoritative lock state behind one mutex; the idle timer task
/// and the visibility handler both funnel through [`lock_now`], which is
/// idempotent, so the timer racing a foreground event is harmless.
pub struct PasscodeManager {
    inner: Arc<Mutex<LockInner>>,
    store: Arc<dyn KeyStore>,
    verifier: Arc<dyn PasscodeVerifier>,
    sync: Arc<dyn SyncTrigger>,
}

impl PasscodeManager {
    /// Build the manager over its collaborators.
    ///
    /// The initial state is Locked exactly when a passcode record exists;
    /// with no passcode there is nothing to be locked behind.
    pub fn new(
        store: Arc<dyn KeyStore>,
        verifier: Arc<dyn PasscodeVerifier>,
        sync: Arc<dyn SyncTrigger>,
    ) -> Result<Self> {
        let has_passcode = store
            .get_item(OFFLINE_PARAMS_KEY, StorageMode::Fixed)?
            .is_some();
        let ephemeral_session = matches!(
            store
                .get_item(EPHEMERAL_SESSION_KEY, StorageMode::Fixed)?
                .as_deref(),
            Some("true")
        );

        let state = if has_passcode {
            LockState::Locked
        } else {
            LockState::Unlocked
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(LockInner {
                state,
                has_passcode,
                ephemeral_session,
                keys: None,
                deadline: LockDeadline::default(),
                timer: None,
                reload_handler: None,
                visibility_observers: Vec::new(),
                passcode_observers: Vec::new(),
                next_observer_id: 0,
            })),
            store,
            verifier,
            sync,
        })
    }

    // A panicking observer must not wedge the lock state, so poisoning is
    // deliberately ignored here.
    fn state_guard(&self) -> MutexGuard<'_, LockInner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn is_locked(&self) -> bool {
        self.state_guard().state == LockState::Locked
    }

    pub fn has_passcode(&self) -> bool {
        self.state_guard().has_passcode
    }

    pub fn is_ephemeral_session(&self) -> bool {
        self.state_guard().ephemeral_session
    }

    /// Mark the session ephemeral: protected items then live in memory only
    pub fn set_ephemeral_session(&self, ephemeral: bool) -> Result<()> {
        self.store.set_item(
            EPHEMERAL_SESSION_KEY,
            if ephemeral { "true" } else { "false" },
            StorageMode::Fixed,
        )?;
        self.state_guard().ephemeral_session = ephemeral;
        Ok(())
    }

    /// Hook invoked when the application actually transitions to Locked.
    /// The shell uses this to tear down and reload its UI.
    pub fn set_reload_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.state_guard().reload_handler = Some(Arc::new(handler));
    }

    fn passcode_auth_params(&self) -> Result<Option<AuthParams>> {
        let Some(json) = self.store.get_item(OFFLINE_PARAMS_KEY, StorageMode::Fixed)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Check a candidate passcode without changing any state
    pub fn verify_passcode(&self, candidate: &str) -> Result<bool> {
        let Some(params) = self.passcode_auth_params()? else {
            return Ok(false);
        };
        let Some(stored) = params.hash.as_deref() else {
            return Ok(false);
        };
        let keys = self.verifier.derive_keys(candidate, &params)?;
        Ok(keys.matches(stored))
    }

    /// Attempt to unlock with a candidate passcode.
    ///
    /// `Ok(false)` means the candidate was wrong; nothing changed. On
    /// success the storage is decrypted, the derived keys are retained in
    /// memory, and a best-effort sync is kicked off. Storage failures
    /// surface as errors with the lock state untouched.
    pub fn unlock(&self, candidate: &str) -> Result<bool> {
        let Some(params) = self.passcode_auth_params()? else {
            // Nothing is protected; a missing record means no passcode is
            // configured, not a failure.
            self.state_guard().state = LockState::Unlocked;
            return Ok(true);
        };
        let stored = params.hash.clone().ok_or_else(|| LockError::MalformedRecord {
            key: OFFLINE_PARAMS_KEY.to_string(),
            reason: "missing verifier hash".to_string(),
        })?;

        let keys = self.verifier.derive_keys(candidate, &params)?;
        if !keys.matches(&stored) {
            debug!("passcode verification failed");
            return Ok(false);
        }

        self.store.set_keys(Some(*keys.master_key()));
        if let Err(e) = self.store.decrypt_storage() {
            // No partial unlock: withdraw the keys and stay locked.
            self.store.set_keys(None);
            return Err(e);
        }

        {
            let mut guard = self.state_guard();
            guard.keys = Some(keys);
            guard.state = LockState::Unlocked;
        }

        info!("application unlocked");
        self.sync.trigger_sync();
        Ok(true)
    }

    /// Set (or replace) the passcode.
    ///
    /// Mints a fresh identifier, derives new key material, and re-encrypts
    /// the protected store under the new key. The re-encryption itself is
    /// transactional inside the key store, so a failure cannot leave a
    /// mixed plaintext/ciphertext state.
    pub fn set_passcode(&self, candidate: &str) -> Result<()> {
        let identifier = Uuid::new_v4();
        let (keys, mut params) = self.verifier.generate_keys_and_params(identifier, candidate)?;
        params.hash = Some(keys.verifier_b64());
        let params_json = serde_json::to_string(&params)?;

        let previous_master = {
            let guard = self.state_guard();
            guard.keys.as_ref().map(|k| *k.master_key())
        };

        // Rows encrypted under the outgoing key must be brought back to
        // plaintext before the new key goes in; the forced migration below
        // then only ever encrypts, never decrypts.
        if previous_master.is_some() {
            self.store.set_keys(previous_master);
            self.store.decrypt_storage()?;
        }

        // Safe-to-store records that must stay plaintext across the
        // wholesale re-encrypt are rewritten afterwards.
        let ephemeral_flag = self
            .store
            .get_item(EPHEMERAL_SESSION_KEY, StorageMode::Fixed)?;

        let target = if self.is_ephemeral_session() {
            StorageMode::Ephemeral
        } else {
            StorageMode::FixedEncrypted
        };

        self.store.set_keys(Some(*keys.master_key()));
        if let Err(e) = self.store.set_items_mode(target, true) {
            self.store.set_keys(previous_master);
            return Err(e);
        }

        let finish = || -> Result<()> {
            if let Some(flag) = &ephemeral_flag {
                self.store
                    .set_item(EPHEMERAL_SESSION_KEY, flag, StorageMode::Fixed)?;
            }
            self.store
                .set_item(OFFLINE_PARAMS_KEY, &params_json, StorageMode::Fixed)
        };
        if let Err(e) = finish() {
            // The old record is still the one on disk, so the store must go
            // back to a state it can open: plaintext, previous keys.
            if let Err(rollback) = self.store.decrypt_storage() {
                warn!(error = %rollback, "storage rollback after failed passcode write also failed");
            }
            self.store.set_keys(previous_master);
            return Err(e);
        }

        {
            let mut guard = self.state_guard();
            guard.keys = Some(keys);
            guard.has_passcode = true;
            guard.state = LockState::Unlocked;
        }

        info!(%identifier, "passcode set");
        self.notify_passcode_change_observers();
        Ok(())
    }

    /// Replacing is the same operation as setting
    pub fn change_passcode(&self, candidate: &str) -> Result<()> {
        self.set_passcode(candidate)
    }

    /// Remove the passcode: decrypt and migrate storage back to the
    /// unprotected mode and delete the auth parameters.
    pub fn clear_passcode(&self) -> Result<()> {
        let target = if self.is_ephemeral_session() {
            StorageMode::Ephemeral
        } else {
            StorageMode::Fixed
        };

        self.store.set_items_mode(target, false)?;
        self.store.remove_item(OFFLINE_PARAMS_KEY, StorageMode::Fixed)?;
        self.store.set_keys(None);

        {
            let mut guard = self.state_guard();
            guard.keys = None;
            guard.has_passcode = false;
            guard.state = LockState::Unlocked;
        }

        info!("passcode cleared");
        self.notify_passcode_change_observers();
        Ok(())
    }

    /// Persist the auto-lock interval (encrypted setting)
    pub fn set_auto_lock_interval(&self, interval: AutoLockInterval) -> Result<()> {
        let encoded = serde_json::to_string(&interval.as_millis())?;
        self.store
            .set_item(AUTO_LOCK_INTERVAL_KEY, &encoded, StorageMode::FixedEncrypted)
    }

    /// Read the persisted auto-lock interval; absent or unrecognized
    /// values mean auto-lock is off
    pub fn get_auto_lock_interval(&self) -> Result<AutoLockInterval> {
        let Some(raw) = self
            .store
            .get_item(AUTO_LOCK_INTERVAL_KEY, StorageMode::FixedEncrypted)?
        else {
            return Ok(AutoLockInterval::None);
        };
        let millis: u64 = serde_json::from_str(&raw)?;
        Ok(AutoLockInterval::from_millis(millis).unwrap_or(AutoLockInterval::None))
    }

    /// The visibility transition handler.
    ///
    /// Backgrounding arms the idle timer (when an interval is configured);
    /// foregrounding cancels it, locking immediately if the wall deadline
    /// passed while timers could not fire (system sleep). Observers are
    /// notified with the new visibility on every call, whatever the lock
    /// outcome.
    pub fn handle_visibility_change(&self, visible: bool) -> Result<()> {
        let result = if visible {
            self.enter_foreground()
        } else {
            self.begin_auto_lock_timer()
        };
        self.notify_visibility_observers(visible);
        result
    }

    fn enter_foreground(&self) -> Result<()> {
        let (expired, locked) = {
            let guard = self.state_guard();
            (
                guard.deadline.expired(Instant::now()),
                guard.state == LockState::Locked,
            )
        };

        if expired && !locked {
            warn!("lock deadline passed while in background; locking now");
            self.lock_application();
        } else if !locked {
            self.sync.trigger_sync();
        }

        self.cancel_auto_lock_timer();
        Ok(())
    }

    fn begin_auto_lock_timer(&self) -> Result<()> {
        if self.is_locked() {
            // Already behind the passcode; nothing to arm.
            return Ok(());
        }

        let interval = self.get_auto_lock_interval()?;
        let Some(duration) = interval.duration() else {
            return Ok(());
        };

        let mut guard = self.state_guard();
        if let Some(timer) = guard.timer.take() {
            timer.abort();
        }
        guard.deadline.arm(Instant::now(), interval);
        debug!(interval_ms = interval.as_millis(), "auto-lock timer armed");

        let inner = Arc::clone(&self.inner);
        let store = Arc::clone(&self.store);
        guard.timer = Some(tokio::spawn(async move {
            sleep(duration).await;
            warn!("auto-lock interval elapsed; locking");
            lock_now(&inner, &store);
        }));

        Ok(())
    }

    fn cancel_auto_lock_timer(&self) {
        let mut guard = self.state_guard();
        if let Some(timer) = guard.timer.take() {
            timer.abort();
        }
        guard.deadline.clear();
    }

    /// Force the lock immediately: destroy in-memory keys, cancel the
    /// timer, and invoke the shell's reload hook. Idempotent; calling it
    /// while already locked only cancels the timer.
    pub fn lock_application(&self) {
        lock_now(&self.inner, &self.store);
    }

    /// Register a visibility observer; returns a handle for removal
    pub fn add_visibility_observer(&self, observer: impl Fn(bool) + Send + Sync + 'static) -> u64 {
        let mut guard = self.state_guard();
        let id = guard.next_observer_id;
        guard.next_observer_id += 1;
        guard.visibility_observers.push((id, Arc::new(observer)));
        id
    }

    pub fn remove_visibility_observer(&self, id: u64) {
        self.state_guard()
            .visibility_observers
            .retain(|(observer_id, _)| *observer_id != id);
    }

    /// Register an observer fired whenever the passcode is set or cleared
    pub fn add_passcode_change_observer(&self, observer: impl Fn() + Send + Sync + 'static) -> u64 {
        let mut guard = self.state_guard();
        let id = guard.next_observer_id;
        guard.next_observer_id += 1;
        guard.passcode_observers.push((id, Arc::new(observer)));
        id
    }

    pub fn remove_passcode_change_observer(&self, id: u64) {
        self.state_guard()
            .passcode_observers
            .retain(|(observer_id, _)| *observer_id != id);
    }

    fn notify_visibility_observers(&self, visible: bool) {
        // Snapshot first; observers run without the state lock held.
        let observers: Vec<VisibilityObserver> = self
            .state_guard()
            .visibility_observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(visible);
        }
    }

    fn notify_passcode_change_observers(&self) {
        let observers: Vec<PasscodeChangeObserver> = self
            .state_guard()
            .passcode_observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer();
        }
    }
}

/// Shared lock path for the timer task and `lock_application`.
fn lock_now(inner: &Mutex<LockInner>, store: &Arc<dyn KeyStore>) {
    let reload = {
        let mut guard = inner.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(timer) = guard.timer.take() {
            timer.abort();
        }
        guard.deadline.clear();

        if guard.state == LockState::Locked {
            return;
        }
        guard.state = LockState::Locked;
        guard.keys = None;
        guard.reload_handler.clone()
    };

    store.set_keys(None);
    info!("application locked");

    if let Some(handler) = reload {
        handler();
    }
}
