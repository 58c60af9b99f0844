use std::{env, str::FromStr, time::Duration};

use typed_builder::TypedBuilder;

use super::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 8091;

/// Networking knobs shared by every node of a run.
#[derive(TypedBuilder, Clone, Debug)]
pub struct Config {
    /// Pending-connection queue length of the listening socket.
    #[builder(default = 100)]
    pub backlog: u32,
    /// How many times a failed bind or connect is retried.
    #[builder(default = 3)]
    pub retry_count: u32,
    /// Base delay between bind/connect attempts. Each wait is randomised
    /// around it.
    #[builder(default = Duration::from_secs(10))]
    pub retry_delay: Duration,
    /// Port used for node list entries that do not name one.
    #[builder(default = DEFAULT_PORT)]
    pub default_port: u16,
    /// Initial capacity of each connection's read buffer.
    #[builder(default = 256 * 1024)]
    pub chunk_size: usize,
    /// Frames larger than this are discarded.
    #[builder(default = 64 * 1024 * 1024)]
    pub max_frame_size: usize,
    /// Overrides the derived bootstrap deadline.
    #[builder(default, setter(strip_option))]
    pub max_bootstrap_time: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Reads the defaults, overridden by any `PGAS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse(&lookup, "PGAS_BACKLOG")? {
            config.backlog = v;
        }
        if let Some(v) = parse(&lookup, "PGAS_RETRY_COUNT")? {
            config.retry_count = v;
        }
        if let Some(v) = parse_secs(&lookup, "PGAS_RETRY_DELAY")? {
            config.retry_delay = v;
        }
        if let Some(v) = parse(&lookup, "PGAS_PORT")? {
            config.default_port = v;
        }
        if let Some(v) = parse(&lookup, "PGAS_CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        if let Some(v) = parse(&lookup, "PGAS_MAX_FRAME_SIZE")? {
            config.max_frame_size = v;
        }
        if let Some(v) = parse_secs(&lookup, "PGAS_MAX_BOOTSTRAP_TIME")? {
            config.max_bootstrap_time = Some(v);
        }
        Ok(config)
    }

    /// The bootstrap watchdog deadline: explicit if set, otherwise long
    /// enough for every connect retry and never under a minute.
    pub fn max_bootstrap_time(&self) -> Duration {
        self.max_bootstrap_time.unwrap_or_else(|| {
            let retries = self
                .retry_delay
                .checked_mul(self.retry_count.saturating_add(1))
                .unwrap_or(Duration::MAX);
            retries.max(Duration::from_secs(60))
        })
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}={raw:?} is not a valid value"))),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>> {
    let secs: Option<f64> = parse(lookup, key)?;
    secs.map(|s| {
        Duration::try_from_secs_f64(s)
            .map_err(|_| Error::Config(format!("{key}={s} is not a valid duration")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn bootstrap_time_is_at_least_a_minute() {
        let config = Config::default();
        assert_eq!(config.max_bootstrap_time(), Duration::from_secs(60));

        let config = Config::builder()
            .retry_count(9)
            .retry_delay(Duration::from_secs(10))
            .build();
        assert_eq!(config.max_bootstrap_time(), Duration::from_secs(100));

        let config = Config::builder()
            .max_bootstrap_time(Duration::from_secs(5))
            .build();
        assert_eq!(config.max_bootstrap_time(), Duration::from_secs(5));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("PGAS_BACKLOG", "7"),
            ("PGAS_RETRY_DELAY", "0.5"),
            ("PGAS_PORT", " 9000 "),
        ]))
        .unwrap();
        assert_eq!(config.backlog, 7);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.default_port, 9000);
        assert_eq!(config.retry_count, 3);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("PGAS_RETRY_COUNT", "many")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = Config::from_lookup(lookup(&[("PGAS_RETRY_DELAY", "-1")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        for huge in ["1e30", "inf", "NaN"] {
            let err = Config::from_lookup(lookup(&[("PGAS_MAX_BOOTSTRAP_TIME", huge)])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{} accepted", huge);
        }
    }

    #[test]
    fn extreme_retry_settings_saturate() {
        let config = Config::from_lookup(lookup(&[
            ("PGAS_RETRY_COUNT", "4294967295"),
            ("PGAS_RETRY_DELAY", "1e15"),
        ]))
        .unwrap();
        assert_eq!(config.retry_count, u32::MAX);
        assert_eq!(config.max_bootstrap_time(), Duration::MAX);
    }
}
