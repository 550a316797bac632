use std::time::Duration;

use super::env::EnvConfig;
use crate::queue::BackoffPolicy;

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 单次调用内最多执行的节点数
    pub max_steps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_steps: 256 }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_steps: EnvConfig::get_parsed("CONVOFLOW_MAX_STEPS", defaults.max_steps).max(1),
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }
}

/// 执行调度器配置
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// 执行失败后重新排队的延迟
    pub retry_delay: Duration,
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            default_max_retries: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: EnvConfig::get_parsed("CONVOFLOW_SCHEDULER_BATCH_SIZE", defaults.batch_size)
                .max(1),
            poll_interval: EnvConfig::get_duration_ms(
                "CONVOFLOW_SCHEDULER_POLL_MS",
                defaults.poll_interval,
            ),
            retry_delay: EnvConfig::get_duration_ms(
                "CONVOFLOW_SCHEDULER_RETRY_DELAY_MS",
                defaults.retry_delay,
            ),
            default_max_retries: EnvConfig::get_parsed(
                "CONVOFLOW_EXECUTION_MAX_RETRIES",
                defaults.default_max_retries,
            ),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }
}

/// 出站消息队列与外部 API 队列配置
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub default_max_retries: u32,
    /// 会话消息的优先级，高于批量发送
    pub message_priority: i32,
    pub default_priority: i32,
    pub rate_limit_calls: u32,
    pub rate_limit_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            default_max_retries: 3,
            message_priority: 10,
            default_priority: 5,
            rate_limit_calls: 20,
            rate_limit_window: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: EnvConfig::get_parsed("CONVOFLOW_QUEUE_BATCH_SIZE", defaults.batch_size)
                .max(1),
            poll_interval: EnvConfig::get_duration_ms(
                "CONVOFLOW_QUEUE_POLL_MS",
                defaults.poll_interval,
            ),
            backoff: BackoffPolicy::new(
                EnvConfig::get_duration_ms("CONVOFLOW_BACKOFF_BASE_MS", defaults.backoff.base),
                EnvConfig::get_duration_ms("CONVOFLOW_BACKOFF_MAX_MS", defaults.backoff.max_delay),
            ),
            default_max_retries: EnvConfig::get_parsed(
                "CONVOFLOW_QUEUE_MAX_RETRIES",
                defaults.default_max_retries,
            ),
            message_priority: EnvConfig::get_parsed(
                "CONVOFLOW_MESSAGE_PRIORITY",
                defaults.message_priority,
            ),
            default_priority: EnvConfig::get_parsed(
                "CONVOFLOW_DEFAULT_PRIORITY",
                defaults.default_priority,
            ),
            rate_limit_calls: EnvConfig::get_parsed(
                "CONVOFLOW_RATE_LIMIT_CALLS",
                defaults.rate_limit_calls,
            ),
            rate_limit_window: EnvConfig::get_duration_ms(
                "CONVOFLOW_RATE_LIMIT_WINDOW_MS",
                defaults.rate_limit_window,
            ),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_rate_limit(mut self, calls: u32, window: Duration) -> Self {
        self.rate_limit_calls = calls;
        self.rate_limit_window = window;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_priority_beats_default() {
        let config = QueueConfig::default();
        assert!(config.message_priority > config.default_priority);
    }

    #[test]
    fn engine_config_reads_env() {
        std::env::set_var("CONVOFLOW_MAX_STEPS", "32");
        assert_eq!(EngineConfig::from_env().max_steps, 32);
        std::env::remove_var("CONVOFLOW_MAX_STEPS");
        assert_eq!(EngineConfig::from_env().max_steps, 256);
    }
}
