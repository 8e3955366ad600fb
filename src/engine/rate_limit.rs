//! Rate limit detection and retry with backoff.
//!
//! A failed result is rate limited when its stderr (checked first) or output
//! mentions a usage or rate limit. The wait is taken from the first reset
//! signal found, in order: provider `Retry-After`, an absolute clock time
//! ("resets at 3:15 PM"), a relative delay ("try again in 5 minutes"), a raw
//! unix timestamp. The result is clamped into the configured band.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::ExecutionResult;
use crate::config::RateLimitConfig;
use crate::util::truncate_chars;

const RAW_TEXT_CHARS: usize = 500;

static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rate[ _-]?limit|usage limit|too many requests|\b429\b|overloaded|(?:try again|retry) (?:in|after) \d+",
    )
    .expect("rate limit pattern")
});

static CLOCK_RESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+at\s+(\d{1,2})(?::(\d{2}))?\s*([ap])\.?m\.?")
        .expect("clock reset pattern")
});

static RELATIVE_RESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:resets?|try again|retry)\s+(?:in|after)\s+(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h)\b",
    )
    .expect("relative reset pattern")
});

static UNIX_RESET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1\d{9})\b").expect("unix reset pattern"));

/// A detected rate limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    /// Clamped wait before the next attempt
    pub wait: Duration,
    /// Absolute reset time, when the message named one
    pub reset_at: Option<DateTime<Local>>,
    /// Matched diagnostic text, truncated
    pub raw: String,
}

/// Classify a failed result, relative to the current local time.
pub fn detect_rate_limit(result: &ExecutionResult, config: &RateLimitConfig) -> Option<RateLimitInfo> {
    detect_rate_limit_at(result, config, Local::now())
}

pub fn detect_rate_limit_at(
    result: &ExecutionResult,
    config: &RateLimitConfig,
    now: DateTime<Local>,
) -> Option<RateLimitInfo> {
    if result.exit_code == 0 || result.timed_out {
        return None;
    }

    let text = [result.stderr.as_str(), result.output.as_str()]
        .into_iter()
        .find(|text| RATE_LIMIT_PATTERN.is_match(text))?;

    let (wait, reset_at) = match result.retry_after {
        Some(wait) => (wait, None),
        None => reset_signal(text, now).unwrap_or((config.default_wait, None)),
    };

    Some(RateLimitInfo {
        wait: clamp_wait(wait, config),
        reset_at,
        raw: truncate_chars(text.trim(), RAW_TEXT_CHARS),
    })
}

fn clamp_wait(wait: Duration, config: &RateLimitConfig) -> Duration {
    wait.clamp(config.min_wait, config.max_wait.max(config.min_wait))
}

fn until(now: DateTime<Local>, at: DateTime<Local>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

fn reset_signal(
    text: &str,
    now: DateTime<Local>,
) -> Option<(Duration, Option<DateTime<Local>>)> {
    if let Some(at) = clock_reset(text, now) {
        return Some((until(now, at), Some(at)));
    }

    if let Some(caps) = RELATIVE_RESET.captures(text) {
        let amount: u64 = caps[1].parse().ok()?;
        let unit = caps[2].to_lowercase();
        let secs = match unit.chars().next() {
            Some('h') => amount.saturating_mul(3600),
            Some('m') => amount.saturating_mul(60),
            _ => amount,
        };
        return Some((Duration::from_secs(secs), None));
    }

    if let Some(caps) = UNIX_RESET.captures(text) {
        let ts: i64 = caps[1].parse().ok()?;
        let at = Local.timestamp_opt(ts, 0).single()?;
        return Some((until(now, at), Some(at)));
    }

    None
}

/// "resets at 3:15 PM": today at that time, or tomorrow if already past.
fn clock_reset(text: &str, now: DateTime<Local>) -> Option<DateTime<Local>> {
    let caps = CLOCK_RESET.captures(text)?;
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let pm = caps[3].eq_ignore_ascii_case("p");
    let hour24 = match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, true) => h + 12,
        (h, false) => h,
    };

    let time = NaiveTime::from_hms_opt(hour24, minute, 0)?;
    let mut at = now
        .date_naive()
        .and_time(time)
        .and_local_timezone(Local)
        .earliest()?;
    if at <= now {
        at += chrono::Duration::days(1);
    }
    Some(at)
}

/// Console line written before every backoff sleep.
pub fn wait_message(info: &RateLimitInfo, attempt: u32, max_retries: u32) -> String {
    format!(
        "Rate limit reached. Waiting {}s until reset (attempt {}/{})",
        info.wait.as_secs(),
        attempt,
        max_retries
    )
}

/// Final result of a call wrapped in [`run_with_retry`].
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: ExecutionResult,
    /// Backoff sleeps taken
    pub waits: u32,
}

/// Call `attempt` until it stops failing with a rate limit, the retry budget
/// runs out, or `cancel` fires. `on_wait` runs before every sleep.
pub async fn run_with_retry<F, Fut, W>(
    config: &RateLimitConfig,
    cancel: &CancellationToken,
    mut on_wait: W,
    mut attempt: F,
) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExecutionResult>,
    W: FnMut(&RateLimitInfo, u32),
{
    let mut waits = 0;
    loop {
        let result = attempt().await;
        if waits >= config.max_retries || cancel.is_cancelled() {
            return RetryOutcome { result, waits };
        }
        let Some(info) = detect_rate_limit(&result, config) else {
            return RetryOutcome { result, waits };
        };

        waits += 1;
        warn!(
            wait_secs = info.wait.as_secs(),
            attempt = waits,
            raw = %truncate_chars(&info.raw, 120),
            "Rate limited, backing off"
        );
        on_wait(&info, waits);

        tokio::select! {
            _ = tokio::time::sleep(info.wait) => {}
            _ = cancel.cancelled() => {
                info!("Backoff cancelled");
                return RetryOutcome { result, waits };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failed(stderr: &str) -> ExecutionResult {
        ExecutionResult {
            stderr: stderr.to_string(),
            exit_code: 1,
            ..Default::default()
        }
    }

    fn local(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 10, h, m, 0).single().unwrap()
    }

    fn tiny() -> RateLimitConfig {
        RateLimitConfig {
            min_wait: Duration::from_millis(5),
            max_wait: Duration::from_millis(20),
            default_wait: Duration::from_millis(10),
            max_retries: 3,
        }
    }

    #[test]
    fn success_and_timeout_are_never_rate_limited() {
        let config = RateLimitConfig::default();
        let mut ok = failed("429 rate_limit_error");
        ok.exit_code = 0;
        assert!(detect_rate_limit(&ok, &config).is_none());

        let mut timed_out = failed("429 rate_limit_error");
        timed_out.timed_out = true;
        assert!(detect_rate_limit(&timed_out, &config).is_none());

        assert!(detect_rate_limit(&failed("syntax error"), &config).is_none());
    }

    #[test]
    fn short_relative_wait_is_clamped_to_minimum() {
        let config = RateLimitConfig::default();
        let info = detect_rate_limit(&failed("Rate limited. try again in 5 seconds"), &config).unwrap();
        assert_eq!(info.wait, config.min_wait);
    }

    #[test]
    fn long_relative_wait_is_clamped_to_maximum() {
        let config = RateLimitConfig::default();
        let info = detect_rate_limit(&failed("try again in 120 minutes"), &config).unwrap();
        assert_eq!(info.wait, config.max_wait);
    }

    #[test]
    fn clock_reset_rolls_to_next_day() {
        let config = RateLimitConfig::default();
        let now = local(15, 0);

        let later = detect_rate_limit_at(&failed("usage limit reached, resets at 3:20 PM"), &config, now)
            .unwrap();
        assert_eq!(later.wait, Duration::from_secs(20 * 60));
        assert_eq!(later.reset_at, Some(local(15, 20)));

        let past = detect_rate_limit_at(&failed("usage limit reached|resets at 2pm"), &config, now)
            .unwrap();
        assert_eq!(past.wait, config.max_wait);
        assert!(past.reset_at.unwrap() > now);
    }

    #[test]
    fn retry_after_takes_priority_and_default_applies_otherwise() {
        let config = RateLimitConfig::default();
        let mut result = failed("HTTP 429: too many requests, try again in 10 minutes");
        result.retry_after = Some(Duration::from_secs(90));
        assert_eq!(detect_rate_limit(&result, &config).unwrap().wait, Duration::from_secs(90));

        let info = detect_rate_limit(&failed("overloaded"), &config).unwrap();
        assert_eq!(info.wait, config.default_wait);
    }

    #[test]
    fn unix_timestamp_and_stdout_fallback() {
        let config = RateLimitConfig::default();
        let now = local(12, 0);
        let reset = now.timestamp() + 600;
        let result = ExecutionResult {
            output: format!("Claude AI usage limit reached|{}", reset),
            exit_code: 1,
            ..Default::default()
        };
        let info = detect_rate_limit_at(&result, &config, now).unwrap();
        assert_eq!(info.wait, Duration::from_secs(600));
        assert!(info.raw.starts_with("Claude AI usage limit"));
    }

    #[test]
    fn raw_text_is_truncated() {
        let long = format!("rate limit {}", "x".repeat(2000));
        let info = detect_rate_limit(&failed(&long), &RateLimitConfig::default()).unwrap();
        assert!(info.raw.chars().count() <= RAW_TEXT_CHARS + 3);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let mut messages = Vec::new();
        let outcome = run_with_retry(
            &tiny(),
            &CancellationToken::new(),
            |info, k| messages.push(wait_message(info, k, 3)),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    failed("429 rate_limit_error")
                } else {
                    ExecutionResult::default()
                }
            },
        )
        .await;

        assert!(outcome.result.is_success());
        assert_eq!(outcome.waits, 1);
        assert_eq!(messages, vec!["Rate limit reached. Waiting 0s until reset (attempt 1/3)"]);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let outcome = run_with_retry(&tiny(), &CancellationToken::new(), |_, _| {}, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            failed("rate limit")
        })
        .await;

        assert_eq!(outcome.waits, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(!outcome.result.is_success());
    }

    #[tokio::test]
    async fn cancel_aborts_backoff_sleep() {
        let config = RateLimitConfig {
            min_wait: Duration::from_secs(3600),
            max_wait: Duration::from_secs(3600),
            ..RateLimitConfig::default()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let started = std::time::Instant::now();
        let outcome = run_with_retry(&config, &cancel, |_, _| trigger.cancel(), || async {
            failed("rate limit")
        })
        .await;

        assert_eq!(outcome.waits, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
