//! Local access control: permission, rate limit and quota
//!
//! The [`AccessController`] runs three advisory, fail-fast checks before a
//! request is dispatched, always in this order:
//!
//! 1. **Permission**: a static allow-list lookup for the policy subject.
//! 2. **Rate limit**: a sliding window counter per (subject, capability).
//! 3. **Quota**: a longer-period counter per (subject, capability) that
//!    resets on period boundaries.
//!
//! The first failing check decides the error and the remaining checks are
//! skipped. A call is only counted against the rate window and the quota
//! when every check passes. The remote provider remains the authoritative
//! enforcer; these checks only save round trips that would be refused.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{CapwireError, Result};
use crate::types::CapabilityKind;

/// Process-wide access policy, loaded once with the configuration.
///
/// `allowed` entries take these forms:
///
/// - `*`: everything
/// - `operation:*`: every capability of one kind
/// - `operation:search`: one capability of one kind
/// - `search`: a capability with this name of any kind
/// - a trailing `*` on a name matches by prefix (`resource:file:///docs/*`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default = "default_subject")]
    pub subject: String,

    #[serde(default = "default_allowed")]
    pub allowed: Vec<String>,

    #[serde(default)]
    pub rate_limit: Option<RateLimit>,

    #[serde(default)]
    pub quota: Option<Quota>,
}

fn default_subject() -> String {
    "local".to_string()
}

fn default_allowed() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            subject: default_subject(),
            allowed: default_allowed(),
            rate_limit: None,
            quota: None,
        }
    }
}

impl AccessPolicy {
    /// # Errors
    ///
    /// Returns [`CapwireError::Config`] for zero-sized limits or windows.
    pub fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(CapwireError::Config("access.subject cannot be empty".to_string()).into());
        }
        if let Some(rate) = &self.rate_limit {
            if rate.max_calls == 0 || rate.window_ms == 0 {
                return Err(CapwireError::Config(
                    "access.rate_limit max_calls and window_ms must be greater than 0".to_string(),
                )
                .into());
            }
        }
        if let Some(quota) = &self.quota {
            if quota.max_calls == 0 || quota.period_secs == 0 {
                return Err(CapwireError::Config(
                    "access.quota max_calls and period_secs must be greater than 0".to_string(),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Whether the allow-list admits `kind:name`.
    pub fn permits(&self, kind: CapabilityKind, name: &str) -> bool {
        self.allowed.iter().any(|entry| entry_matches(entry, kind, name))
    }
}

fn entry_matches(entry: &str, kind: CapabilityKind, name: &str) -> bool {
    if entry == "*" {
        return true;
    }
    let (kind_part, name_part) = match entry.split_once(':') {
        Some((k, rest)) if CapabilityKind::parse(k).is_some() => (CapabilityKind::parse(k), rest),
        // Bare names may themselves contain ':' (URIs); only a known kind
        // prefix is treated as a qualifier.
        _ => (None, entry),
    };
    if kind_part.is_some_and(|k| k != kind) {
        return false;
    }
    match name_part.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == name_part,
    }
}

/// Sliding window limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_calls: u32,
    pub window_ms: u64,
}

/// Period counter limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max_calls: u64,
    pub period_secs: u64,
}

#[derive(Debug)]
struct QuotaCounter {
    period_start: Instant,
    used: u64,
}

#[derive(Debug, Default)]
struct AccessState {
    windows: HashMap<String, VecDeque<Instant>>,
    quotas: HashMap<String, QuotaCounter>,
}

/// Enforces an [`AccessPolicy`].
#[derive(Debug)]
pub struct AccessController {
    policy: AccessPolicy,
    state: Mutex<AccessState>,
}

impl AccessController {
    pub fn new(policy: AccessPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(AccessState::default()),
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Run all checks for one call now.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::PermissionDenied`],
    /// [`CapwireError::RateLimited`] or [`CapwireError::QuotaExceeded`].
    pub fn authorize(&self, kind: CapabilityKind, name: &str) -> Result<()> {
        self.authorize_at(kind, name, Instant::now())
    }

    /// Same as [`AccessController::authorize`] with an explicit clock.
    pub fn authorize_at(&self, kind: CapabilityKind, name: &str, now: Instant) -> Result<()> {
        let capability = format!("{}:{}", kind, name);

        if !self.policy.permits(kind, name) {
            tracing::debug!(subject = %self.policy.subject, %capability, "permission denied");
            return Err(CapwireError::PermissionDenied {
                subject: self.policy.subject.clone(),
                capability,
            }
            .into());
        }

        let key = format!("{}|{}", self.policy.subject, capability);
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(rate) = &self.policy.rate_limit {
            let window = Duration::from_millis(rate.window_ms);
            let calls = state.windows.entry(key.clone()).or_default();
            while calls
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= window)
            {
                calls.pop_front();
            }
            if calls.len() >= rate.max_calls as usize {
                return Err(CapwireError::RateLimited {
                    capability,
                    limit: rate.max_calls,
                    window_ms: rate.window_ms,
                }
                .into());
            }
        }

        if let Some(quota) = &self.policy.quota {
            let period = Duration::from_secs(quota.period_secs);
            let counter = state.quotas.entry(key.clone()).or_insert(QuotaCounter {
                period_start: now,
                used: 0,
            });
            let elapsed = now.saturating_duration_since(counter.period_start);
            if elapsed >= period {
                let periods = (elapsed.as_nanos() / period.as_nanos()) as u32;
                counter.period_start += period * periods;
                counter.used = 0;
            }
            if counter.used >= quota.max_calls {
                return Err(CapwireError::QuotaExceeded {
                    capability,
                    limit: quota.max_calls,
                }
                .into());
            }
            counter.used += 1;
        }

        if self.policy.rate_limit.is_some() {
            state.windows.entry(key).or_default().push_back(now);
        }
        Ok(())
    }

    /// Calls left in the current quota period for a capability, if a quota
    /// is configured.
    pub fn remaining_quota(&self, kind: CapabilityKind, name: &str) -> Option<u64> {
        let quota = self.policy.quota.as_ref()?;
        let key = format!("{}|{}:{}", self.policy.subject, kind, name);
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let used = state.quotas.get(&key).map(|c| c.used).unwrap_or(0);
        Some(quota.max_calls.saturating_sub(used))
    }
}
