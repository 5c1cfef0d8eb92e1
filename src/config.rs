use std::time::Duration;

use crate::retry::{Backoff, RetryPolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub max_chunk_attempts: usize,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::StandardSdk => ProfileDefaults {
                request_timeout: Duration::from_secs(10),
                retry_policy: RetryPolicy::standard(),
                chunk_size: 1024 * 1024,
                max_concurrent_chunks: 3,
                max_chunk_attempts: 3,
            },
            Self::LowLatency => ProfileDefaults {
                request_timeout: Duration::from_secs(2),
                retry_policy: RetryPolicy::standard()
                    .max_attempts(2)
                    .base_delay(Duration::from_millis(50))
                    .max_delay(Duration::from_millis(300)),
                chunk_size: 256 * 1024,
                max_concurrent_chunks: 2,
                max_chunk_attempts: 2,
            },
            Self::HighThroughput => ProfileDefaults {
                request_timeout: Duration::from_secs(30),
                retry_policy: RetryPolicy::standard()
                    .max_attempts(4)
                    .base_delay(Duration::from_millis(200))
                    .max_delay(Duration::from_secs(5))
                    .backoff(Backoff::Exponential { multiplier: 2.0 }),
                chunk_size: 8 * 1024 * 1024,
                max_concurrent_chunks: 8,
                max_chunk_attempts: 5,
            },
        }
    }
}
