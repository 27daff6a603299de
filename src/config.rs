use std::str::FromStr;

use chrono::{Days, Duration, NaiveDate};

/// Immutable scheduling settings passed into the slot generator.
///
/// Lesson length and buffer are independent: a longer lesson keeps the same
/// buffer unless the buffer is configured separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPolicy {
    /// Default lesson length when a request doesn't specify one.
    pub lesson_minutes: u32,
    /// Gap between the end of one offered slot and the start of the next.
    pub buffer_minutes: u32,
    /// Length of the rolling window starting at "today".
    pub window_days: u32,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            lesson_minutes: 60,
            buffer_minutes: 15,
            window_days: 14,
        }
    }
}

impl SlotPolicy {
    pub fn buffer(&self) -> Duration {
        Duration::minutes(self.buffer_minutes as i64)
    }

    /// Inclusive `(first, last)` dates of the rolling window starting at `today`.
    /// The window is clipped at the last representable date.
    pub fn window_from(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let extra = Days::new(u64::from(self.window_days.max(1) - 1));
        (today, today.checked_add_days(extra).unwrap_or(NaiveDate::MAX))
    }
}

/// Process configuration, read from `DRIVEALIVE_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    pub user: Option<String>,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: SlotPolicy,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = SlotPolicy::default();
        Self {
            bind: lookup("DRIVEALIVE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: or_default(parsed(&lookup, "DRIVEALIVE_PORT"), 5433),
            data_dir: lookup("DRIVEALIVE_DATA_DIR").unwrap_or_else(|| "./data".into()),
            user: lookup("DRIVEALIVE_USER"),
            password: lookup("DRIVEALIVE_PASSWORD").unwrap_or_else(|| "drivealive".into()),
            max_connections: or_default(parsed(&lookup, "DRIVEALIVE_MAX_CONNECTIONS"), 256),
            compact_threshold: or_default(parsed(&lookup, "DRIVEALIVE_COMPACT_THRESHOLD"), 1000),
            metrics_port: parsed(&lookup, "DRIVEALIVE_METRICS_PORT"),
            tls_cert: lookup("DRIVEALIVE_TLS_CERT"),
            tls_key: lookup("DRIVEALIVE_TLS_KEY"),
            policy: SlotPolicy {
                lesson_minutes: positive(parsed(&lookup, "DRIVEALIVE_LESSON_MINUTES"), defaults.lesson_minutes),
                buffer_minutes: or_default(parsed(&lookup, "DRIVEALIVE_BUFFER_MINUTES"), defaults.buffer_minutes),
                window_days: positive(parsed(&lookup, "DRIVEALIVE_BOOKING_WINDOW_DAYS"), defaults.window_days),
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.parse().ok())
}

fn or_default<T>(value: Option<T>, default: T) -> T {
    value.unwrap_or(default)
}

fn positive(value: Option<u32>, default: u32) -> u32 {
    value.filter(|v| *v > 0).unwrap_or(default)
}
