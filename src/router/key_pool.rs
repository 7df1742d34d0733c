//! API Key Pool Management
//!
//! Manages the credentials of one provider: quota buckets, health state and
//! rotation order.
//!
//! Each credential carries its own lock, so state transitions on one key never
//! serialize calls that use another. Usage counters are kept in whole
//! wall-clock buckets (minute and UTC day) to match provider-side quotas.

use crate::clock::{self, Clock};
use crate::config::{RotationConfig, RotationStrategy};
use crate::error::{GatewayError, ProviderError, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Health state of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Active,
    /// Per-minute limit hit, clears at the next minute boundary
    Blocked,
    /// Too many consecutive errors, or switched off by an operator
    Disabled,
    /// Daily quota used up, clears at UTC midnight
    Exhausted,
}

/// Result of one call made with a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    QuotaExceeded,
    AuthError(String),
    TransientError(String),
    /// The request itself was bad; the key is not at fault
    Rejected,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::QuotaExceeded => "quota_exceeded",
            Outcome::AuthError(_) => "auth_error",
            Outcome::TransientError(_) => "transient_error",
            Outcome::Rejected => "rejected",
        }
    }
}

impl From<&ProviderError> for Outcome {
    fn from(err: &ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { .. } => Outcome::RateLimited,
            ProviderError::QuotaExceeded(_) => Outcome::QuotaExceeded,
            ProviderError::Auth(msg) => Outcome::AuthError(msg.clone()),
            ProviderError::Transient(msg) => Outcome::TransientError(msg.clone()),
            ProviderError::InvalidRequest(_) => Outcome::Rejected,
        }
    }
}

/// Per-key quota numbers; `None` means the provider enforces it alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyLimits {
    pub per_minute: Option<u32>,
    pub per_day: Option<u32>,
}

/// Thresholds driving state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub strategy: RotationStrategy,
    pub max_errors_before_disable: u32,
    pub retry_disabled_after: TimeDelta,
}

impl RotationPolicy {
    pub fn from_config(config: &RotationConfig, strategy: RotationStrategy) -> Self {
        Self {
            strategy,
            max_errors_before_disable: config.max_errors_before_disable.max(1),
            retry_disabled_after: TimeDelta::hours(config.retry_blocked_key_after_hours as i64),
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::from_config(&RotationConfig::default(), RotationStrategy::default())
    }
}

type Transition = (KeyState, KeyState);

#[derive(Debug, Clone)]
struct CredentialState {
    state: KeyState,
    blocked_until: Option<DateTime<Utc>>,
    manually_disabled: bool,
    minute: DateTime<Utc>,
    minute_used: u32,
    day: NaiveDate,
    day_used: u32,
    in_flight: u32,
    /// Back from Disabled; at most one call until it reports
    probing: bool,
    consecutive_errors: u32,
    total_requests: u64,
    successes: u64,
    failures: u64,
    last_used: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl CredentialState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: KeyState::Active,
            blocked_until: None,
            manually_disabled: false,
            minute: clock::minute_start(now),
            minute_used: 0,
            day: clock::utc_day(now),
            day_used: 0,
            in_flight: 0,
            probing: false,
            consecutive_errors: 0,
            total_requests: 0,
            successes: 0,
            failures: 0,
            last_used: None,
            last_error: None,
        }
    }

    fn enter(&mut self, state: KeyState, until: Option<DateTime<Utc>>) -> Option<Transition> {
        let from = self.state;
        self.state = state;
        self.blocked_until = until;
        (from != state).then_some((from, state))
    }

    /// Roll quota buckets and clear expired timers
    fn roll(&mut self, now: DateTime<Utc>, policy: &RotationPolicy) -> Option<Transition> {
        let minute = clock::minute_start(now);
        if minute != self.minute {
            self.minute = minute;
            self.minute_used = 0;
        }
        let day = clock::utc_day(now);
        if day != self.day {
            self.day = day;
            self.day_used = 0;
        }

        if self.state == KeyState::Active || self.manually_disabled {
            return None;
        }
        match self.blocked_until {
            Some(until) if now >= until => {
                if self.state == KeyState::Disabled {
                    // One probe: a single further error disables the key again
                    self.consecutive_errors = policy.max_errors_before_disable.saturating_sub(1);
                    self.probing = true;
                }
                self.enter(KeyState::Active, None)
            }
            _ => None,
        }
    }

    /// Move an active key into Blocked/Exhausted when its buckets are full
    fn enforce_buckets(&mut self, now: DateTime<Utc>, limits: KeyLimits) -> Option<Transition> {
        if self.state != KeyState::Active {
            return None;
        }
        if limits.per_day.is_some_and(|quota| self.day_used >= quota) {
            return self.enter(KeyState::Exhausted, Some(clock::next_utc_midnight(now)));
        }
        if limits.per_minute.is_some_and(|limit| self.minute_used >= limit) {
            return self.enter(KeyState::Blocked, Some(clock::next_minute_boundary(now)));
        }
        None
    }

    /// In-flight calls count against the buckets until they are reported
    fn has_headroom(&self, limits: KeyLimits) -> bool {
        if self.probing && self.in_flight > 0 {
            return false;
        }
        let minute_ok = limits
            .per_minute
            .map_or(true, |limit| self.minute_used + self.in_flight < limit);
        let day_ok = limits
            .per_day
            .map_or(true, |quota| self.day_used + self.in_flight < quota);
        minute_ok && day_ok
    }

    fn settle(
        &mut self,
        outcome: &Outcome,
        now: DateTime<Utc>,
        limits: KeyLimits,
        policy: &RotationPolicy,
    ) -> Option<Transition> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.probing = false;
        let rolled = self.roll(now, policy);
        self.total_requests += 1;
        self.last_used = Some(now);

        if self.manually_disabled {
            return rolled;
        }

        let changed = match outcome {
            Outcome::Success => {
                self.successes += 1;
                self.consecutive_errors = 0;
                self.minute_used += 1;
                self.day_used += 1;
                self.enforce_buckets(now, limits)
            }
            Outcome::RateLimited => {
                self.failures += 1;
                self.last_error = Some("rate limited".to_string());
                if self.state == KeyState::Active {
                    self.enter(KeyState::Blocked, Some(clock::next_minute_boundary(now)))
                } else {
                    None
                }
            }
            Outcome::QuotaExceeded => {
                self.failures += 1;
                self.last_error = Some("quota exceeded".to_string());
                if matches!(self.state, KeyState::Active | KeyState::Blocked) {
                    self.enter(KeyState::Exhausted, Some(clock::next_utc_midnight(now)))
                } else {
                    None
                }
            }
            Outcome::AuthError(message) | Outcome::TransientError(message) => {
                self.failures += 1;
                self.consecutive_errors += 1;
                self.last_error = Some(message.clone());
                if self.consecutive_errors >= policy.max_errors_before_disable
                    && self.state != KeyState::Disabled
                {
                    self.enter(KeyState::Disabled, Some(now + policy.retry_disabled_after))
                } else {
                    None
                }
            }
            Outcome::Rejected => None,
        };
        changed.or(rolled)
    }
}

/// One API key plus its quota and health bookkeeping
#[derive(Debug)]
pub struct Credential {
    name: String,
    secret: SecretString,
    limits: KeyLimits,
    state: Mutex<CredentialState>,
}

impl Credential {
    pub fn new(name: String, secret: SecretString, limits: KeyLimits, now: DateTime<Utc>) -> Self {
        Self {
            name,
            secret,
            limits,
            state: Mutex::new(CredentialState::new(now)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> KeyLimits {
        self.limits
    }

    fn matches_secret(&self, secret: &str) -> bool {
        self.secret.expose_secret() == secret
    }

    /// Current state after applying any expired timers
    pub fn state(&self, now: DateTime<Utc>, policy: &RotationPolicy) -> KeyState {
        let mut state = self.state.lock();
        state.roll(now, policy);
        state.state
    }

    fn status(&self, now: DateTime<Utc>, policy: &RotationPolicy) -> CredentialStatus {
        let mut state = self.state.lock();
        state.roll(now, policy);
        CredentialStatus {
            name: self.name.clone(),
            key_hint: mask_secret(self.secret.expose_secret()),
            state: state.state,
            blocked_until: state.blocked_until,
            manually_disabled: state.manually_disabled,
            in_flight: state.in_flight,
            minute_used: state.minute_used,
            day_used: state.day_used,
            rate_limit_per_minute: self.limits.per_minute,
            daily_quota: self.limits.per_day,
            consecutive_errors: state.consecutive_errors,
            total_requests: state.total_requests,
            successes: state.successes,
            failures: state.failures,
            last_used: state.last_used,
            last_error: state.last_error.clone(),
        }
    }
}

/// Show only the tail of a secret
fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

/// Point-in-time view of one credential
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub name: String,
    pub key_hint: String,
    pub state: KeyState,
    pub blocked_until: Option<DateTime<Utc>>,
    pub manually_disabled: bool,
    pub in_flight: u32,
    pub minute_used: u32,
    pub day_used: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub daily_quota: Option<u32>,
    pub consecutive_errors: u32,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Point-in-time view of a provider's pool
#[derive(Debug, Clone, Serialize)]
pub struct KeyPoolStatus {
    pub provider: String,
    pub available: bool,
    pub total_keys: usize,
    pub active: usize,
    pub blocked: usize,
    pub disabled: usize,
    pub exhausted: usize,
    pub in_flight: u32,
    pub keys: Vec<CredentialStatus>,
}

/// A credential checked out for exactly one call.
///
/// Must be handed back through [`KeyPool::report`]; dropping it unreported
/// only releases the in-flight slot.
#[derive(Debug)]
pub struct KeyHandle {
    provider: String,
    index: usize,
    credential: Arc<Credential>,
    settled: bool,
}

impl KeyHandle {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn key_name(&self) -> &str {
        self.credential.name()
    }

    /// The secret to authenticate this one call with
    pub fn secret(&self) -> &SecretString {
        &self.credential.secret
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        if !self.settled {
            let mut state = self.credential.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}

/// Pool of credentials for one provider with rotation support
#[derive(Debug)]
pub struct KeyPool {
    provider: String,
    credentials: RwLock<Vec<Arc<Credential>>>,
    cursor: AtomicUsize,
    policy: RotationPolicy,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    /// Create a new key pool; keys are named `<provider>_key_<n>`
    pub fn new(
        provider: impl Into<String>,
        keys: Vec<(SecretString, KeyLimits)>,
        policy: RotationPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let provider = provider.into();
        let now = clock.now();
        let credentials = keys
            .into_iter()
            .enumerate()
            .map(|(i, (secret, limits))| {
                let name = format!("{}_key_{}", provider, i + 1);
                Arc::new(Credential::new(name, secret, limits, now))
            })
            .collect();

        Self {
            provider,
            credentials: RwLock::new(credentials),
            cursor: AtomicUsize::new(0),
            policy,
            clock,
        }
    }

    /// Get the provider name
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Get the number of keys in the pool
    pub fn len(&self) -> usize {
        self.credentials.read().len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.credentials.read().is_empty()
    }

    /// Check out the next usable key in rotation order
    pub fn acquire(&self) -> Result<KeyHandle> {
        self.acquire_excluding(&[])
    }

    /// Like [`acquire`](Self::acquire), skipping keys already tried for this request
    pub fn acquire_excluding(&self, tried: &[String]) -> Result<KeyHandle> {
        let now = self.clock.now();
        let credentials = self.credentials.read();
        let len = credentials.len();
        let start = self.cursor.load(Ordering::Acquire);

        for offset in 0..len {
            let index = (start + offset) % len;
            let credential = &credentials[index];
            if tried.iter().any(|name| name == credential.name()) {
                continue;
            }

            let mut state = credential.state.lock();
            let transition = state
                .roll(now, &self.policy)
                .or_else(|| state.enforce_buckets(now, credential.limits));
            if let Some(transition) = transition {
                self.log_transition(credential, transition, state.blocked_until);
            }

            if state.state == KeyState::Active && state.has_headroom(credential.limits) {
                state.in_flight += 1;
                tracing::debug!(
                    provider = %self.provider,
                    key = %credential.name(),
                    in_flight = state.in_flight,
                    "acquired key"
                );
                return Ok(KeyHandle {
                    provider: self.provider.clone(),
                    index,
                    credential: Arc::clone(credential),
                    settled: false,
                });
            }
        }

        tracing::warn!(provider = %self.provider, keys = len, "no usable key");
        Err(GatewayError::NoAvailableKey(self.provider.clone()))
    }

    /// Hand a key back with the outcome of its call
    pub fn report(&self, mut handle: KeyHandle, outcome: &Outcome) {
        handle.settled = true;
        let now = self.clock.now();
        let credential = &handle.credential;

        {
            let mut state = credential.state.lock();
            if let Some(transition) = state.settle(outcome, now, credential.limits, &self.policy)
            {
                self.log_transition(credential, transition, state.blocked_until);
            }
        }

        let len = self.len().max(1);
        let next = (handle.index + 1) % len;
        match (outcome, self.policy.strategy) {
            (Outcome::Success, RotationStrategy::RoundRobin) => {
                self.cursor.store(next, Ordering::Release);
            }
            (Outcome::Success, RotationStrategy::Sticky) => {
                self.cursor.store(handle.index, Ordering::Release);
            }
            (Outcome::Rejected, _) => {}
            _ => {
                let _ = self.cursor.compare_exchange(
                    handle.index,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    fn log_transition(
        &self,
        credential: &Credential,
        (from, to): Transition,
        until: Option<DateTime<Utc>>,
    ) {
        match to {
            KeyState::Active => tracing::info!(
                provider = %self.provider,
                key = %credential.name(),
                from = ?from,
                "key reactivated"
            ),
            KeyState::Disabled => tracing::warn!(
                provider = %self.provider,
                key = %credential.name(),
                until = ?until,
                "key disabled after repeated errors"
            ),
            _ => tracing::info!(
                provider = %self.provider,
                key = %credential.name(),
                state = ?to,
                until = ?until,
                "key paused"
            ),
        }
    }

    /// Clear expired timers; returns how many keys came back
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut reactivated = 0;
        for credential in self.credentials.read().iter() {
            let mut state = credential.state.lock();
            if let Some(transition) = state.roll(now, &self.policy) {
                reactivated += 1;
                self.log_transition(credential, transition, None);
            }
        }
        reactivated
    }

    /// Add a key at runtime; returns false when the secret is already pooled
    pub fn add_key(&self, secret: SecretString, limits: KeyLimits) -> bool {
        let mut credentials = self.credentials.write();
        if credentials
            .iter()
            .any(|c| c.matches_secret(secret.expose_secret()))
        {
            return false;
        }
        let name = format!("{}_key_{}", self.provider, credentials.len() + 1);
        tracing::info!(provider = %self.provider, key = %name, "key added");
        credentials.push(Arc::new(Credential::new(
            name,
            secret,
            limits,
            self.clock.now(),
        )));
        true
    }

    /// Operator switch; a manually disabled key has no expiry timer
    pub fn set_enabled(&self, key_name: &str, enabled: bool) -> bool {
        let credentials = self.credentials.read();
        let Some(credential) = credentials.iter().find(|c| c.name() == key_name) else {
            return false;
        };

        let mut state = credential.state.lock();
        state.probing = false;
        if enabled {
            state.manually_disabled = false;
            state.consecutive_errors = 0;
            state.enter(KeyState::Active, None);
        } else {
            state.manually_disabled = true;
            state.enter(KeyState::Disabled, None);
        }
        tracing::info!(provider = %self.provider, key = %key_name, enabled, "key toggled");
        true
    }

    /// Current state of a key by name
    pub fn key_state(&self, key_name: &str) -> Option<KeyState> {
        let now = self.clock.now();
        self.credentials
            .read()
            .iter()
            .find(|c| c.name() == key_name)
            .map(|c| c.state(now, &self.policy))
    }

    /// Whether any key is currently Active
    pub fn has_active_key(&self) -> bool {
        let now = self.clock.now();
        self.credentials
            .read()
            .iter()
            .any(|c| c.state(now, &self.policy) == KeyState::Active)
    }

    /// Get statistics about the pool
    pub fn status(&self) -> KeyPoolStatus {
        let now = self.clock.now();
        let keys: Vec<CredentialStatus> = self
            .credentials
            .read()
            .iter()
            .map(|c| c.status(now, &self.policy))
            .collect();

        let count = |state: KeyState| keys.iter().filter(|k| k.state == state).count();
        let active = count(KeyState::Active);

        KeyPoolStatus {
            provider: self.provider.clone(),
            available: active > 0,
            total_keys: keys.len(),
            active,
            blocked: count(KeyState::Blocked),
            disabled: count(KeyState::Disabled),
            exhausted: count(KeyState::Exhausted),
            in_flight: keys.iter().map(|k| k.in_flight).sum(),
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap()
    }

    fn pool_with(
        keys: &[&str],
        limits: KeyLimits,
        strategy: RotationStrategy,
    ) -> (KeyPool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let policy = RotationPolicy {
            strategy,
            max_errors_before_disable: 3,
            retry_disabled_after: TimeDelta::hours(24),
        };
        let keys = keys
            .iter()
            .map(|k| (SecretString::from(k.to_string()), limits))
            .collect();
        let pool = KeyPool::new("test", keys, policy, clock.clone());
        (pool, clock)
    }

    fn round_robin(keys: &[&str]) -> (KeyPool, Arc<ManualClock>) {
        pool_with(keys, KeyLimits::default(), RotationStrategy::RoundRobin)
    }

    fn sticky(keys: &[&str]) -> (KeyPool, Arc<ManualClock>) {
        pool_with(keys, KeyLimits::default(), RotationStrategy::Sticky)
    }

    fn secret_of(handle: &KeyHandle) -> String {
        handle.secret().expose_secret().to_string()
    }

    #[test]
    fn test_single_key_round_trip() {
        let (pool, _) = round_robin(&["only"]);

        let handle = pool.acquire().unwrap();
        assert_eq!(secret_of(&handle), "only");
        pool.report(handle, &Outcome::Success);

        let again = pool.acquire().unwrap();
        assert_eq!(secret_of(&again), "only");
    }

    #[test]
    fn test_round_robin_starts_after_last_success() {
        let (pool, _) = round_robin(&["a", "b", "c"]);

        let mut order = Vec::new();
        for _ in 0..4 {
            let handle = pool.acquire().unwrap();
            order.push(secret_of(&handle));
            pool.report(handle, &Outcome::Success);
        }
        assert_eq!(order, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_sticky_stays_until_key_fails() {
        let (pool, _) = sticky(&["a", "b"]);

        let first = pool.acquire().unwrap();
        assert_eq!(secret_of(&first), "a");
        pool.report(first, &Outcome::Success);

        let second = pool.acquire().unwrap();
        assert_eq!(secret_of(&second), "a");
        pool.report(second, &Outcome::RateLimited);

        let third = pool.acquire().unwrap();
        assert_eq!(secret_of(&third), "b");
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Blocked));
    }

    #[test]
    fn test_rate_limited_blocks_until_next_minute_only() {
        let (pool, clock) = round_robin(&["a"]);
        clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 59).unwrap());

        let handle = pool.acquire().unwrap();
        pool.report(handle, &Outcome::RateLimited);

        let status = pool.status();
        assert_eq!(status.keys[0].state, KeyState::Blocked);
        assert_eq!(
            status.keys[0].blocked_until,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap())
        );
        assert!(pool.acquire().unwrap_err().is_unavailable());

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(secret_of(&pool.acquire().unwrap()), "a");
    }

    #[test]
    fn test_quota_exceeded_holds_until_utc_midnight() {
        let (pool, clock) = round_robin(&["a"]);

        let handle = pool.acquire().unwrap();
        pool.report(handle, &Outcome::QuotaExceeded);
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Exhausted));

        clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap());
        assert!(pool.acquire().is_err());

        clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_auth_errors_disable_then_probe_after_retry_window() {
        let (pool, clock) = sticky(&["a", "b"]);

        for _ in 0..3 {
            let handle = pool.acquire_excluding(&["test_key_2".to_string()]).unwrap();
            assert_eq!(secret_of(&handle), "a");
            pool.report(handle, &Outcome::AuthError("invalid key".to_string()));
        }
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Disabled));

        // Skipped while disabled
        for _ in 0..3 {
            let handle = pool.acquire().unwrap();
            assert_eq!(secret_of(&handle), "b");
            pool.report(handle, &Outcome::Success);
        }

        clock.advance(TimeDelta::hours(23));
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Disabled));

        clock.advance(TimeDelta::hours(1));
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Active));

        // A failed probe disables the key again right away
        let probe = pool.acquire_excluding(&["test_key_2".to_string()]).unwrap();
        pool.report(probe, &Outcome::AuthError("still invalid".to_string()));
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Disabled));
    }

    #[test]
    fn test_reenabled_key_admits_one_call_until_it_reports() {
        let (pool, clock) = round_robin(&["a"]);
        for _ in 0..3 {
            let handle = pool.acquire().unwrap();
            pool.report(handle, &Outcome::TransientError("502".to_string()));
        }
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Disabled));

        clock.advance(TimeDelta::hours(24));
        let first = pool.acquire().unwrap();
        assert!(pool.acquire().unwrap_err().is_unavailable());

        pool.report(first, &Outcome::Success);
        let second = pool.acquire().unwrap();
        let third = pool.acquire().unwrap();
        assert_eq!(pool.status().keys[0].in_flight, 2);
        assert_eq!(pool.status().keys[0].consecutive_errors, 0);
        drop((second, third));
        assert_eq!(pool.status().keys[0].in_flight, 0);
    }

    #[test]
    fn test_success_resets_consecutive_errors() {
        let (pool, _) = round_robin(&["a"]);

        for _ in 0..2 {
            let handle = pool.acquire().unwrap();
            pool.report(handle, &Outcome::TransientError("timeout".to_string()));
        }
        let handle = pool.acquire().unwrap();
        pool.report(handle, &Outcome::Success);
        for _ in 0..2 {
            let handle = pool.acquire().unwrap();
            pool.report(handle, &Outcome::TransientError("timeout".to_string()));
        }

        let status = pool.status();
        assert_eq!(status.keys[0].state, KeyState::Active);
        assert_eq!(status.keys[0].consecutive_errors, 2);
    }

    #[test]
    fn test_minute_limit_uses_wall_clock_buckets() {
        let limits = KeyLimits {
            per_minute: Some(1),
            per_day: None,
        };
        let (pool, clock) = pool_with(&["a", "b"], limits, RotationStrategy::RoundRobin);

        let first = pool.acquire().unwrap();
        assert_eq!(secret_of(&first), "a");
        pool.report(first, &Outcome::Success);

        let second = pool.acquire().unwrap();
        assert_eq!(secret_of(&second), "b");
        pool.report(second, &Outcome::Success);

        assert!(pool.acquire().is_err());
        let status = pool.status();
        assert_eq!(status.blocked, 2);
        assert!(!status.available);

        // 12:00:10 -> 12:01:00 is a new bucket even though 60s have not passed
        clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_daily_quota_exhausts_key() {
        let limits = KeyLimits {
            per_minute: None,
            per_day: Some(2),
        };
        let (pool, clock) = pool_with(&["a"], limits, RotationStrategy::RoundRobin);

        for _ in 0..2 {
            let handle = pool.acquire().unwrap();
            pool.report(handle, &Outcome::Success);
            clock.advance(TimeDelta::minutes(5));
        }
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Exhausted));
        assert!(pool.acquire().is_err());

        clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 1).unwrap());
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_in_flight_calls_count_against_limit() {
        let limits = KeyLimits {
            per_minute: Some(2),
            per_day: None,
        };
        let (pool, _) = pool_with(&["a"], limits, RotationStrategy::RoundRobin);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());

        // An unreported handle gives its slot back on drop
        drop(second);
        let third = pool.acquire().unwrap();
        pool.report(first, &Outcome::Success);
        pool.report(third, &Outcome::Success);
        assert_eq!(pool.status().keys[0].in_flight, 0);
    }

    #[test]
    fn test_acquire_never_returns_unusable_key() {
        let (pool, _) = round_robin(&["a", "b", "c", "d"]);
        let outcomes = [
            Outcome::RateLimited,
            Outcome::QuotaExceeded,
            Outcome::Success,
            Outcome::AuthError("bad".to_string()),
        ];

        for outcome in outcomes.iter().cycle().take(40) {
            let Ok(handle) = pool.acquire() else { break };
            let name = handle.key_name().to_string();
            assert_eq!(pool.key_state(&name), Some(KeyState::Active));
            pool.report(handle, outcome);
        }
    }

    #[test]
    fn test_concurrent_acquire_respects_limit() {
        let limits = KeyLimits {
            per_minute: Some(3),
            per_day: None,
        };
        let (pool, _) = pool_with(&["a"], limits, RotationStrategy::RoundRobin);

        let handles: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8).map(|_| scope.spawn(|| pool.acquire().ok())).collect();
            workers.into_iter().filter_map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(handles.len(), 3);
        for handle in handles {
            pool.report(handle, &Outcome::Success);
        }
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn test_manual_disable_has_no_timer() {
        let (pool, clock) = round_robin(&["a", "b"]);

        assert!(pool.set_enabled("test_key_1", false));
        clock.advance(TimeDelta::days(30));
        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Disabled));
        assert_eq!(secret_of(&pool.acquire().unwrap()), "b");

        assert!(pool.set_enabled("test_key_1", true));
        assert_eq!(pool.key_state("test_key_1"), Some(KeyState::Active));
        assert!(!pool.set_enabled("missing", true));
    }

    #[test]
    fn test_add_key_rejects_duplicates() {
        let (pool, _) = round_robin(&["a"]);

        assert!(!pool.add_key(SecretString::from("a".to_string()), KeyLimits::default()));
        assert!(pool.add_key(SecretString::from("b".to_string()), KeyLimits::default()));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.status().keys[1].name, "test_key_2");
    }

    #[test]
    fn test_sweep_reactivates_expired_keys() {
        let (pool, clock) = round_robin(&["a", "b"]);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.report(a, &Outcome::RateLimited);
        pool.report(b, &Outcome::RateLimited);
        assert_eq!(pool.sweep(), 0);

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(pool.sweep(), 2);
        assert_eq!(pool.status().active, 2);
    }

    #[test]
    fn test_status_masks_secrets() {
        let (pool, _) = round_robin(&["sk-abcdefghijkl1234"]);
        let status = pool.status();
        assert_eq!(status.keys[0].key_hint, "****1234");
        assert_eq!(mask_secret("short"), "****");
    }
}
