use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// 按账号的滑动窗口限流
///
/// 只在本进程内计数；多进程部署时每个进程各自限流。
pub struct RateLimiter {
    max_calls: u32,
    window: chrono::Duration,
    calls: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(1)),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut calls = self.calls.lock();
        let history = calls.entry(key.to_string()).or_default();
        while history
            .front()
            .is_some_and(|oldest| *oldest + self.window <= now)
        {
            history.pop_front();
        }
        if history.len() as u32 >= self.max_calls {
            return false;
        }
        history.push_back(now);
        true
    }

    /// 退回一次在 `at` 取得但未实际使用的额度
    pub fn release(&self, key: &str, at: DateTime<Utc>) {
        let mut calls = self.calls.lock();
        if let Some(history) = calls.get_mut(key) {
            if let Some(pos) = history.iter().rposition(|call| *call == at) {
                history.remove(pos);
            }
        }
    }

    pub fn remaining(&self, key: &str, now: DateTime<Utc>) -> u32 {
        let calls = self.calls.lock();
        let used = calls
            .get(key)
            .map(|history| {
                history
                    .iter()
                    .filter(|at| **at + self.window > now)
                    .count() as u32
            })
            .unwrap_or(0);
        self.max_calls.saturating_sub(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_per_account_within_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let now = Utc::now();
        assert!(limiter.try_acquire("acct-1", now));
        assert!(limiter.try_acquire("acct-1", now));
        assert!(!limiter.try_acquire("acct-1", now));
        assert!(limiter.try_acquire("acct-2", now));
        assert_eq!(limiter.remaining("acct-1", now), 0);

        let later = now + chrono::Duration::seconds(1);
        assert!(limiter.try_acquire("acct-1", later));
        assert_eq!(limiter.remaining("acct-1", later), 1);
    }

    #[test]
    fn released_slot_can_be_reused() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Utc::now();
        assert!(limiter.try_acquire("acct", now));
        assert!(!limiter.try_acquire("acct", now));

        limiter.release("acct", now);
        assert_eq!(limiter.remaining("acct", now), 1);
        assert!(limiter.try_acquire("acct", now));

        limiter.release("unknown", now);
    }
}
