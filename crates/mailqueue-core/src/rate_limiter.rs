//! Rate Limiter - Controls sending rate per account
//!
//! Each account gets one sliding log per configured window. A grant is only
//! recorded when every window admits it, and the check and the record are a
//! single atomic step, so concurrent workers can never overshoot a ceiling.
//!
//! By default the logs live in process memory. Workers in several processes
//! must share them through a [`RateLedger`] instead, see
//! [`RateLimiter::with_ledger`].

use chrono::Utc;
use mailqueue_common::Config;
use mailqueue_storage::RateLedger;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use mailqueue_storage::WindowLimit;

/// Deferral applied when the shared ledger cannot be reached
const LEDGER_RETRY: Duration = Duration::from_secs(1);

/// Outcome of [`RateLimiter::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    /// Not before `retry_after` has elapsed
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }
}

/// Remaining headroom in one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowQuota {
    pub span: Duration,
    pub ceiling: u32,
    pub remaining: u32,
}

/// Remaining quota for an account across its windows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemainingQuota {
    pub windows: Vec<WindowQuota>,
}

impl RemainingQuota {
    /// Sends admitted right now, `None` when nothing is limited
    pub fn min(&self) -> Option<u32> {
        self.windows.iter().map(|w| w.remaining).min()
    }
}

struct SlidingWindow {
    limit: WindowLimit,
    grants: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(limit: WindowLimit) -> Self {
        Self {
            limit,
            grants: VecDeque::new(),
        }
    }

    /// Forget grants that left the trailing window
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.grants.front() {
            if oldest + self.limit.span <= now {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until this window admits one more grant, `None` if it admits now
    fn wait(&self, now: Instant) -> Option<Duration> {
        let ceiling = self.limit.ceiling as usize;
        if ceiling == 0 {
            return Some(self.limit.span);
        }
        if self.grants.len() < ceiling {
            return None;
        }
        // The window admits once enough of the oldest grants expire that
        // fewer than `ceiling` remain.
        let blocking = self.grants[self.grants.len() - ceiling];
        Some((blocking + self.limit.span).saturating_duration_since(now))
    }
}

enum Grants {
    Local(Mutex<HashMap<String, Vec<SlidingWindow>>>),
    Shared(Arc<dyn RateLedger>),
}

/// Per-account sliding-window rate limiter
///
/// A zero ceiling denies every send.
pub struct RateLimiter {
    enabled: bool,
    default_limits: Vec<WindowLimit>,
    overrides: HashMap<String, Vec<WindowLimit>>,
    grants: Grants,
}

impl RateLimiter {
    /// Create a limiter applying `limits` to every account
    pub fn new(limits: Vec<WindowLimit>) -> Self {
        Self {
            enabled: true,
            default_limits: limits,
            overrides: HashMap::new(),
            grants: Grants::Local(Mutex::new(HashMap::new())),
        }
    }

    /// A limiter that always grants
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Vec::new())
        }
    }

    /// Use `limits` instead of the defaults for one account
    pub fn with_account_limits(mut self, account: impl Into<String>, limits: Vec<WindowLimit>) -> Self {
        self.overrides.insert(account.into(), limits);
        self
    }

    /// Keep grants in `ledger` so every limiter using it enforces one
    /// ceiling per account, across processes
    pub fn with_ledger(mut self, ledger: Arc<dyn RateLedger>) -> Self {
        self.grants = Grants::Shared(ledger);
        self
    }

    /// Whether grants are kept in a shared ledger
    pub fn is_shared(&self) -> bool {
        matches!(self.grants, Grants::Shared(_))
    }

    /// Build from the `rate_limit` section and per-account overrides
    pub fn from_config(config: &Config) -> Self {
        let rate = &config.rate_limit;
        if !rate.enabled {
            return Self::disabled();
        }

        let limits = |per_hour: u32, per_minute: Option<u32>| {
            let mut limits = vec![WindowLimit::per_hour(per_hour)];
            if let Some(per_minute) = per_minute {
                limits.push(WindowLimit::per_minute(per_minute));
            }
            limits
        };

        let mut limiter = Self::new(limits(rate.max_per_hour, rate.max_per_minute));
        for (name, account) in &config.accounts {
            if account.max_per_hour.is_some() || account.max_per_minute.is_some() {
                limiter = limiter.with_account_limits(
                    name.clone(),
                    limits(
                        account.max_per_hour.unwrap_or(rate.max_per_hour),
                        account.max_per_minute.or(rate.max_per_minute),
                    ),
                );
            }
        }
        limiter
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn limits_for(&self, account: &str) -> &[WindowLimit] {
        self.overrides
            .get(account)
            .unwrap_or(&self.default_limits)
    }

    /// Record a send for `account` if every window admits it
    ///
    /// With a shared ledger that cannot be reached the send is deferred,
    /// never granted.
    pub async fn try_acquire(&self, account: &str) -> Decision {
        if !self.enabled {
            return Decision::Granted;
        }

        let limits = self.limits_for(account);
        let retry_after = match &self.grants {
            Grants::Local(accounts) => {
                let mut accounts = accounts.lock().await;
                let windows = accounts.entry(account.to_string()).or_insert_with(|| {
                    limits.iter().copied().map(SlidingWindow::new).collect()
                });
                record_local(windows, Instant::now())
            }
            Grants::Shared(ledger) => match ledger.try_grant(account, limits, Utc::now()).await {
                Ok(retry_after) => retry_after,
                Err(e) => {
                    warn!("Rate ledger unavailable for account {}: {}", account, e);
                    Some(LEDGER_RETRY)
                }
            },
        };

        match retry_after {
            Some(retry_after) => {
                debug!(
                    "Rate limit hit for account {}, retry after {:?}",
                    account, retry_after
                );
                Decision::Denied { retry_after }
            }
            None => Decision::Granted,
        }
    }

    /// Remaining quota for `account` without recording anything
    pub async fn remaining(&self, account: &str) -> RemainingQuota {
        if !self.enabled {
            return RemainingQuota::default();
        }

        let limits = self.limits_for(account);
        let windows = match &self.grants {
            Grants::Local(accounts) => {
                let now = Instant::now();
                let mut accounts = accounts.lock().await;
                match accounts.get_mut(account) {
                    Some(windows) => windows
                        .iter_mut()
                        .map(|w| {
                            w.prune(now);
                            quota(w.limit, w.grants.len() as u32)
                        })
                        .collect(),
                    None => limits.iter().map(|l| quota(*l, 0)).collect(),
                }
            }
            Grants::Shared(ledger) => {
                let now = Utc::now();
                let mut windows = Vec::with_capacity(limits.len());
                for limit in limits {
                    // Report an unreachable ledger as exhausted
                    let used = ledger
                        .count(account, limit.span, now)
                        .await
                        .unwrap_or_else(|e| {
                            warn!("Rate ledger unavailable for account {}: {}", account, e);
                            limit.ceiling
                        });
                    windows.push(quota(*limit, used));
                }
                windows
            }
        };
        RemainingQuota { windows }
    }

    /// Wait until a send for `account` is granted
    pub async fn acquire(&self, account: &str) {
        loop {
            match self.try_acquire(account).await {
                Decision::Granted => return,
                Decision::Denied { retry_after } => {
                    debug!(
                        "Waiting {:?} for rate limit on account {}",
                        retry_after, account
                    );
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    /// Forget grants that no window can see any more
    ///
    /// Returns the number of idle accounts dropped, or of ledger entries
    /// pruned when grants are shared.
    pub async fn cleanup(&self) -> usize {
        match &self.grants {
            Grants::Local(accounts) => {
                let now = Instant::now();
                let mut accounts = accounts.lock().await;
                let before = accounts.len();
                accounts.retain(|_, windows| {
                    windows.iter_mut().for_each(|w| w.prune(now));
                    windows.iter().any(|w| !w.grants.is_empty())
                });
                before - accounts.len()
            }
            Grants::Shared(ledger) => {
                let longest = self
                    .default_limits
                    .iter()
                    .chain(self.overrides.values().flatten())
                    .map(|l| l.span)
                    .max()
                    .unwrap_or_default();
                let Ok(longest) = chrono::Duration::from_std(longest) else {
                    return 0;
                };
                match ledger.prune(Utc::now() - longest).await {
                    Ok(pruned) => usize::try_from(pruned).unwrap_or(usize::MAX),
                    Err(e) => {
                        warn!("Failed to prune rate ledger: {}", e);
                        0
                    }
                }
            }
        }
    }
}

/// Check every window and record the grant in all of them if each admits it
fn record_local(windows: &mut [SlidingWindow], now: Instant) -> Option<Duration> {
    let mut retry_after: Option<Duration> = None;
    for window in windows.iter_mut() {
        window.prune(now);
        if let Some(wait) = window.wait(now) {
            retry_after = Some(retry_after.map_or(wait, |w| w.max(wait)));
        }
    }

    if retry_after.is_none() {
        for window in windows.iter_mut() {
            window.grants.push_back(now);
        }
    }
    retry_after
}

fn quota(limit: WindowLimit, used: u32) -> WindowQuota {
    WindowQuota {
        span: limit.span,
        ceiling: limit.ceiling,
        remaining: limit.ceiling.saturating_sub(used),
    }
}
