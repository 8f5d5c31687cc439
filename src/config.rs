use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::types::PayloadKind;

pub const API_BASE_URL: &str = "https://api-web.nhle.com";

/// Sent on every upstream request.
pub const HTTP_USER_AGENT: &str = "live-ingest/0.1";

/// Upper bound on how many tracked events the operator endpoint returns.
pub const EVENTS_ENDPOINT_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Sub-configs: each component takes only the slice it needs.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Static identity list (PROXY_LIST, comma-separated proxy URLs).
    pub proxy_list: Vec<String>,
    /// File re-read on every refresh, one proxy URL per line (PROXY_FILE).
    pub proxy_file: Option<String>,
    /// Soft-failure cooldown for one identity (PROXY_COOLDOWN_SECS).
    pub cooldown: Duration,
    /// Minimum spacing between pool-wide refreshes (PROXY_REFRESH_MIN_INTERVAL_SECS).
    pub refresh_min_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_list: Vec::new(),
            proxy_file: None,
            cooldown: Duration::from_secs(30),
            refresh_min_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-call timeout (FETCH_TIMEOUT_SECS).
    pub timeout: Duration,
    /// First backoff delay (BACKOFF_BASE_MS); doubles per retry.
    pub backoff_base: Duration,
    /// Backoff cap (BACKOFF_CEILING_MS).
    pub backoff_ceiling: Duration,
    pub max_rate_limit_retries: u32,
    pub max_transient_retries: u32,
    /// Identities tried per call before giving up on auth failures.
    pub max_auth_retries: u32,
    /// Consecutive auth failures within one call that trigger a pool refresh.
    pub auth_refresh_after: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(30),
            max_rate_limit_retries: 5,
            max_transient_retries: 2,
            max_auth_retries: 5,
            auth_refresh_after: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive transient failures that trip the pool-wide pause.
    pub trip_threshold: u32,
    pub pause_base: Duration,
    pub pause_ceiling: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 3,
            pause_base: Duration::from_secs(30),
            pause_ceiling: Duration::from_secs(600),
        }
    }
}

/// Sleep tiers and horizons for the adaptive scheduler.
#[derive(Debug, Clone)]
pub struct CadenceConfig {
    pub live: Duration,
    pub intermission: Duration,
    pub near_term: Duration,
    pub idle: Duration,
    /// SCHEDULED events starting within this horizon count as near-term.
    pub near_term_horizon: chrono::Duration,
    /// Delay before the single post-final correction fetch.
    pub final_recheck_after: chrono::Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            live: Duration::from_secs(10),
            intermission: Duration::from_secs(30),
            near_term: Duration::from_secs(60),
            idle: Duration::from_secs(300),
            near_term_horizon: chrono::Duration::hours(4),
            final_recheck_after: chrono::Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Parallel fetch workers per cycle (INGEST_WORKERS).
    pub workers: usize,
    /// Soft deadline for one cycle's dispatch + join (CYCLE_DEADLINE_SECS).
    pub cycle_deadline: Duration,
    /// Sub-fetches issued per event (PAYLOAD_KINDS).
    pub payload_kinds: Vec<PayloadKind>,
    /// Hours after UTC midnight that still belong to the previous sports day.
    pub day_rollover_hours: i64,
    /// Append every changed body to the history table (KEEP_PAYLOAD_HISTORY).
    pub keep_history: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            cycle_deadline: Duration::from_secs(45),
            payload_kinds: PayloadKind::ALL.to_vec(),
            day_rollover_hours: 8,
            keep_history: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub interval: Duration,
    pub batch_size: i64,
    /// Processed payloads of events untouched for this long are pruned.
    pub retention: chrono::Duration,
    /// Requeue every stored payload on startup (REPROCESS=1).
    pub reprocess: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 200,
            retention: chrono::Duration::days(14),
            reprocess: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub proxy: ProxyConfig,
    pub fetch: FetchConfig,
    pub breaker: BreakerConfig,
    pub cadence: CadenceConfig,
    pub driver: DriverConfig,
    pub processor: ProcessorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: API_BASE_URL.to_string(),
            log_level: "info".to_string(),
            db_path: "ingest.db".to_string(),
            api_port: 3000,
            proxy: ProxyConfig::default(),
            fetch: FetchConfig::default(),
            breaker: BreakerConfig::default(),
            cadence: CadenceConfig::default(),
            driver: DriverConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys keep their defaults;
    /// present-but-invalid keys are a configuration error.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_secs(parse_or(&get, key, default.as_secs())?))
        };
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_millis(parse_or(&get, key, default.as_millis() as u64)?))
        };
        let minutes = |key: &str, default: chrono::Duration| -> Result<chrono::Duration> {
            let raw = parse_or(&get, key, default.num_minutes())?;
            chrono::Duration::try_minutes(raw)
                .ok_or_else(|| AppError::Config(format!("{key} is out of range: {raw}")))
        };

        let payload_kinds = match get("PAYLOAD_KINDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    PayloadKind::parse(s)
                        .ok_or_else(|| AppError::Config(format!("PAYLOAD_KINDS: unknown kind `{s}`")))
                })
                .collect::<Result<Vec<_>>>()?,
            None => d.driver.payload_kinds.clone(),
        };

        let cfg = Self {
            api_base_url: get("API_BASE_URL").unwrap_or(d.api_base_url),
            log_level: get("LOG_LEVEL").unwrap_or(d.log_level),
            db_path: get("DB_PATH").unwrap_or(d.db_path),
            api_port: parse_or(&get, "API_PORT", d.api_port)?,
            proxy: ProxyConfig {
                proxy_list: get("PROXY_LIST")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                proxy_file: get("PROXY_FILE").filter(|s| !s.trim().is_empty()),
                cooldown: secs("PROXY_COOLDOWN_SECS", d.proxy.cooldown)?,
                refresh_min_interval: secs(
                    "PROXY_REFRESH_MIN_INTERVAL_SECS",
                    d.proxy.refresh_min_interval,
                )?,
            },
            fetch: FetchConfig {
                timeout: secs("FETCH_TIMEOUT_SECS", d.fetch.timeout)?,
                backoff_base: millis("BACKOFF_BASE_MS", d.fetch.backoff_base)?,
                backoff_ceiling: millis("BACKOFF_CEILING_MS", d.fetch.backoff_ceiling)?,
                max_rate_limit_retries: parse_or(
                    &get,
                    "MAX_RATE_LIMIT_RETRIES",
                    d.fetch.max_rate_limit_retries,
                )?,
                max_transient_retries: parse_or(
                    &get,
                    "MAX_TRANSIENT_RETRIES",
                    d.fetch.max_transient_retries,
                )?,
                max_auth_retries: parse_or(&get, "MAX_AUTH_RETRIES", d.fetch.max_auth_retries)?,
                auth_refresh_after: parse_or(&get, "AUTH_REFRESH_AFTER", d.fetch.auth_refresh_after)?,
            },
            breaker: BreakerConfig {
                trip_threshold: parse_or(&get, "BREAKER_TRIP_THRESHOLD", d.breaker.trip_threshold)?,
                pause_base: secs("BREAKER_PAUSE_BASE_SECS", d.breaker.pause_base)?,
                pause_ceiling: secs("BREAKER_PAUSE_CEILING_SECS", d.breaker.pause_ceiling)?,
            },
            cadence: CadenceConfig {
                live: secs("INTERVAL_LIVE_SECS", d.cadence.live)?,
                intermission: secs("INTERVAL_INTERMISSION_SECS", d.cadence.intermission)?,
                near_term: secs("INTERVAL_NEAR_TERM_SECS", d.cadence.near_term)?,
                idle: secs("INTERVAL_IDLE_SECS", d.cadence.idle)?,
                near_term_horizon: minutes("NEAR_TERM_HORIZON_MINS", d.cadence.near_term_horizon)?,
                final_recheck_after: minutes(
                    "FINAL_RECHECK_AFTER_MINS",
                    d.cadence.final_recheck_after,
                )?,
            },
            driver: DriverConfig {
                workers: parse_or(&get, "INGEST_WORKERS", d.driver.workers)?,
                cycle_deadline: secs("CYCLE_DEADLINE_SECS", d.driver.cycle_deadline)?,
                payload_kinds,
                day_rollover_hours: parse_or(&get, "DAY_ROLLOVER_HOURS", d.driver.day_rollover_hours)?,
                keep_history: parse_flag(&get, "KEEP_PAYLOAD_HISTORY")?.unwrap_or(d.driver.keep_history),
            },
            processor: ProcessorConfig {
                interval: secs("PROCESSOR_INTERVAL_SECS", d.processor.interval)?,
                batch_size: parse_or(&get, "PROCESSOR_BATCH_SIZE", d.processor.batch_size)?,
                retention: {
                    let raw = parse_or(&get, "RETENTION_DAYS", d.processor.retention.num_days())?;
                    chrono::Duration::try_days(raw)
                        .ok_or_else(|| AppError::Config(format!("RETENTION_DAYS is out of range: {raw}")))?
                },
                reprocess: parse_flag(&get, "REPROCESS")?.unwrap_or(d.processor.reprocess),
            },
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.cadence;
        if !(c.live <= c.intermission && c.intermission <= c.near_term && c.near_term <= c.idle) {
            return Err(AppError::Config(format!(
                "interval tiers must satisfy live <= intermission <= near_term <= idle (got {:?}, {:?}, {:?}, {:?})",
                c.live, c.intermission, c.near_term, c.idle
            )));
        }
        if c.live.is_zero() {
            return Err(AppError::Config("INTERVAL_LIVE_SECS must be > 0".to_string()));
        }
        if self.driver.workers == 0 {
            return Err(AppError::Config("INGEST_WORKERS must be >= 1".to_string()));
        }
        if self.driver.payload_kinds.is_empty() {
            return Err(AppError::Config("PAYLOAD_KINDS must name at least one kind".to_string()));
        }
        if self.breaker.trip_threshold == 0 {
            return Err(AppError::Config("BREAKER_TRIP_THRESHOLD must be >= 1".to_string()));
        }
        if self.breaker.pause_base > self.breaker.pause_ceiling {
            return Err(AppError::Config(
                "BREAKER_PAUSE_BASE_SECS must not exceed BREAKER_PAUSE_CEILING_SECS".to_string(),
            ));
        }
        if self.fetch.backoff_base > self.fetch.backoff_ceiling {
            return Err(AppError::Config(
                "BACKOFF_BASE_MS must not exceed BACKOFF_CEILING_MS".to_string(),
            ));
        }
        if self.fetch.auth_refresh_after == 0 {
            return Err(AppError::Config("AUTH_REFRESH_AFTER must be >= 1".to_string()));
        }
        if self.processor.batch_size <= 0 {
            return Err(AppError::Config("PROCESSOR_BATCH_SIZE must be > 0".to_string()));
        }

        // Bounds keep every timestamp and deadline computed from these
        // tunables representable.
        let day = Duration::from_secs(24 * 3600);
        let chrono_day = chrono::Duration::days(1);
        check_range("INTERVAL_IDLE_SECS", c.idle, Duration::ZERO, day)?;
        check_range("NEAR_TERM_HORIZON_MINS", c.near_term_horizon, chrono::Duration::zero(), chrono_day * 7)?;
        check_range("FINAL_RECHECK_AFTER_MINS", c.final_recheck_after, chrono::Duration::zero(), chrono_day)?;
        check_range("CYCLE_DEADLINE_SECS", self.driver.cycle_deadline, Duration::from_secs(1), Duration::from_secs(3600))?;
        check_range("DAY_ROLLOVER_HOURS", self.driver.day_rollover_hours, 0, 23)?;
        check_range("BREAKER_PAUSE_CEILING_SECS", self.breaker.pause_ceiling, Duration::ZERO, day)?;
        check_range("BACKOFF_CEILING_MS", self.fetch.backoff_ceiling, Duration::ZERO, Duration::from_secs(3600))?;
        check_range("FETCH_TIMEOUT_SECS", self.fetch.timeout, Duration::from_secs(1), Duration::from_secs(600))?;
        check_range("PROXY_COOLDOWN_SECS", self.proxy.cooldown, Duration::ZERO, day)?;
        check_range("PROXY_REFRESH_MIN_INTERVAL_SECS", self.proxy.refresh_min_interval, Duration::ZERO, day)?;
        check_range("PROCESSOR_INTERVAL_SECS", self.processor.interval, Duration::from_secs(1), day)?;
        check_range("RETENTION_DAYS", self.processor.retention, chrono_day, chrono_day * 3650)?;
        Ok(())
    }
}

fn check_range<T>(key: &str, value: T, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Debug,
{
    if value < min || value > max {
        return Err(AppError::Config(format!(
            "{key} must be between {min:?} and {max:?} (got {value:?})"
        )));
    }
    Ok(())
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value `{raw}`"))),
        None => Ok(default),
    }
}

fn parse_flag<F>(get: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1") | Some("true") | Some("yes") => Ok(Some(true)),
        Some("0") | Some("false") | Some("no") | Some("") => Ok(Some(false)),
        Some(other) => Err(AppError::Config(format!("{key} must be a boolean, got `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.driver.workers, 8);
        assert_eq!(cfg.breaker.trip_threshold, 3);
        assert_eq!(cfg.driver.payload_kinds, PayloadKind::ALL.to_vec());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = Config::from_lookup(lookup(&[
            ("INGEST_WORKERS", "3"),
            ("PROXY_LIST", "http://a:1, http://b:2,,"),
            ("PAYLOAD_KINDS", "pbp"),
            ("KEEP_PAYLOAD_HISTORY", "true"),
            ("NEAR_TERM_HORIZON_MINS", "90"),
        ]))
        .unwrap();
        assert_eq!(cfg.driver.workers, 3);
        assert_eq!(cfg.proxy.proxy_list, vec!["http://a:1", "http://b:2"]);
        assert_eq!(cfg.driver.payload_kinds, vec![PayloadKind::PlayByPlay]);
        assert!(cfg.driver.keep_history);
        assert_eq!(cfg.cadence.near_term_horizon, chrono::Duration::minutes(90));
    }

    #[test]
    fn invalid_number_is_fatal() {
        let err = Config::from_lookup(lookup(&[("INGEST_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn inverted_tiers_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("INTERVAL_LIVE_SECS", "120"),
            ("INTERVAL_INTERMISSION_SECS", "30"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn out_of_range_durations_are_rejected_at_startup() {
        let cases: [&[(&str, &str)]; 11] = [
            &[("NEAR_TERM_HORIZON_MINS", "1000000000000")],
            &[("NEAR_TERM_HORIZON_MINS", "-30")],
            &[("NEAR_TERM_HORIZON_MINS", "9223372036854775807")],
            &[("FINAL_RECHECK_AFTER_MINS", "-1")],
            &[("DAY_ROLLOVER_HOURS", "-2")],
            &[("DAY_ROLLOVER_HOURS", "9000000000000000")],
            &[("RETENTION_DAYS", "0")],
            &[("RETENTION_DAYS", "-14")],
            &[("RETENTION_DAYS", "999999999999999")],
            &[("CYCLE_DEADLINE_SECS", "18446744073709551615")],
            &[("PROCESSOR_INTERVAL_SECS", "0")],
        ];
        for pairs in cases {
            let err = Config::from_lookup(lookup(pairs)).unwrap_err();
            assert!(matches!(err, AppError::Config(_)), "{pairs:?} gave {err}");
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let cfg = Config::from_lookup(lookup(&[
            ("NEAR_TERM_HORIZON_MINS", "0"),
            ("DAY_ROLLOVER_HOURS", "23"),
            ("RETENTION_DAYS", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.driver.day_rollover_hours, 23);
        assert_eq!(cfg.processor.retention, chrono::Duration::days(1));
    }

    #[test]
    fn unknown_payload_kind_is_rejected() {
        assert!(Config::from_lookup(lookup(&[("PAYLOAD_KINDS", "pbp,shifts")])).is_err());
    }
}
