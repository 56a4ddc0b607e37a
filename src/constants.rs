//! Default values for the configuration surface described in SPEC_FULL.md §6.

use std::time::Duration;

pub const DEFAULT_MAX_AGENTS: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(900);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 2;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);
/// `unbounded` in the configuration surface; represented as the largest
/// practical queue size rather than a sentinel so callers never branch on it.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = usize::MAX;

pub const DEFAULT_MIN_SAMPLES: u32 = 5;
pub const DEFAULT_HIGH_SUCCESS_THRESHOLD: f64 = 0.90;
pub const DEFAULT_BASE_CONFIDENCE_THRESHOLD: f64 = 0.75;
pub const DEFAULT_HIGH_RISK_CONFIDENCE_THRESHOLD: f64 = 0.85;

pub const DEFAULT_MAX_PR_SIZE: usize = 500;
pub const DEFAULT_MIN_COVERAGE: f64 = 0.80;

pub const DEFAULT_EVENT_BUFFER: usize = 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Content over this length is truncated before being sent to an agent.
pub const CODE_SNIPPET_TRUNCATION_LENGTH: usize = 4000;

/// Fingerprint digest is truncated to this many hex characters (C1).
pub const FINGERPRINT_LENGTH: usize = 16;
