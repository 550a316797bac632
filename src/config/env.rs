use crate::error::{ConvoFlowError, Result};
use anyhow::anyhow;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    /// 从环境变量获取值
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key).map_err(|_| {
            ConvoFlowError::Other(anyhow!("environment variable '{}' is not set", key))
        })
    }

    /// 获取可选的环境变量
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    /// 解析环境变量，缺失或非法时使用默认值
    pub fn get_parsed<T>(key: &str, default: T) -> T
    where
        T: FromStr,
    {
        match Self::get_env_optional(key) {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(key = %key, value = %raw, "invalid value, using default");
                    default
                }
            },
            None => default,
        }
    }

    /// 以毫秒为单位的时长
    pub fn get_duration_ms(key: &str, default: Duration) -> Duration {
        Duration::from_millis(Self::get_parsed(key, default.as_millis() as u64))
    }
}
