//! Entry options and the per-cache defaults they are merged over

use crate::types::Policy;
use std::time::Duration;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_CHANGE_INTERVAL: Duration = Duration::from_millis(1000);

/// Fully resolved options for one entry.
///
/// A zero interval means the corresponding policy is not requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub content_type: String,
    /// Poll the file for timestamp changes every `change_interval`
    pub on_change: bool,
    pub change_interval: Duration,
    /// Re-read the file every `update_interval`
    pub update_interval: Duration,
    /// Drop the entry `expire_interval` after creation
    pub expire_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            on_change: false,
            change_interval: DEFAULT_CHANGE_INTERVAL,
            update_interval: Duration::ZERO,
            expire_interval: Duration::ZERO,
        }
    }
}

impl CacheOptions {
    /// Overwrite every field that `partial` sets
    pub fn merge(&mut self, partial: &PartialOptions) {
        if let Some(content_type) = &partial.content_type {
            self.content_type = content_type.clone();
        }
        if let Some(on_change) = partial.on_change {
            self.on_change = on_change;
        }
        if let Some(interval) = partial.change_interval {
            self.change_interval = interval;
        }
        if let Some(interval) = partial.update_interval {
            self.update_interval = interval;
        }
        if let Some(interval) = partial.expire_interval {
            self.expire_interval = interval;
        }
    }

    pub fn overlay(&self, partial: &PartialOptions) -> Self {
        let mut merged = self.clone();
        merged.merge(partial);
        merged
    }

    /// Policies to arm for an entry created with these options
    pub fn policies(&self) -> Vec<Policy> {
        let mut policies = Vec::with_capacity(3);
        if self.on_change && !self.change_interval.is_zero() {
            policies.push(Policy::OnChange {
                interval: self.change_interval,
            });
        }
        if !self.update_interval.is_zero() {
            policies.push(Policy::OnUpdate {
                interval: self.update_interval,
            });
        }
        if !self.expire_interval.is_zero() {
            policies.push(Policy::OnExpire {
                ttl: self.expire_interval,
            });
        }
        policies
    }
}

/// Options where every field is optional; unset fields fall through to the
/// cache defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialOptions {
    pub content_type: Option<String>,
    pub on_change: Option<bool>,
    pub change_interval: Option<Duration>,
    pub update_interval: Option<Duration>,
    pub expire_interval: Option<Duration>,
}

impl PartialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn on_change(mut self, enabled: bool) -> Self {
        self.on_change = Some(enabled);
        self
    }

    pub fn change_interval(mut self, interval: Duration) -> Self {
        self.change_interval = Some(interval);
        self
    }

    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    pub fn expire_interval(mut self, interval: Duration) -> Self {
        self.expire_interval = Some(interval);
        self
    }
}
