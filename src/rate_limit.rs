use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::models::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SendMessage,
    CreateThread,
}

/// Sliding window rate limiter keyed by (action, user), local to this process.
#[derive(Clone)]
pub struct RateLimiter {
    hits: Arc<DashMap<(Action, Id), VecDeque<Instant>>>,
    cfg: RateLimitConfig,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub message_limit: usize,
    pub message_window: Duration,
    pub thread_limit: usize,
    pub thread_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message_limit: 30,
            message_window: Duration::from_secs(60),
            thread_limit: 5,
            thread_window: Duration::from_secs(300),
        }
    }
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self { hits: Arc::new(DashMap::new()), cfg }
    }

    /// Records the attempt and returns whether it is within budget.
    pub fn allow(&self, action: Action, user_id: Id) -> bool {
        let (limit, window) = match action {
            Action::SendMessage => (self.cfg.message_limit, self.cfg.message_window),
            Action::CreateThread => (self.cfg.thread_limit, self.cfg.thread_window),
        };
        let now = Instant::now();
        let mut entry = self.hits.entry((action, user_id)).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}
