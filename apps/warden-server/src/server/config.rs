use std::time::Duration;

use anyhow::bail;

use super::core::{
    AppConfig, DEV_SIGNING_SECRET, MAX_ACCESS_TOKEN_TTL_SECS, MAX_CLOCK_SKEW_SECS,
    MAX_REFRESH_TOKEN_TTL_SECS, MIN_ACCESS_TOKEN_TTL_SECS, MIN_REFRESH_TOKEN_TTL_SECS,
    MIN_SIGNING_SECRET_BYTES,
};

impl AppConfig {
    /// Reads configuration from `WARDEN_*` environment variables and
    /// validates it. The process refuses to start on any violation; a
    /// half-configured service is worse than no service.
    ///
    /// # Errors
    /// Returns the first violation found, named after its variable.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let Some(signing_secret) = lookup("WARDEN_SIGNING_SECRET") else {
            bail!("WARDEN_SIGNING_SECRET is required");
        };
        if signing_secret.len() < MIN_SIGNING_SECRET_BYTES {
            bail!("WARDEN_SIGNING_SECRET must be at least {MIN_SIGNING_SECRET_BYTES} bytes");
        }
        if signing_secret == DEV_SIGNING_SECRET {
            bail!("WARDEN_SIGNING_SECRET must not be the built-in development secret");
        }

        let access_token_ttl_secs = parse_or(
            &lookup,
            "WARDEN_ACCESS_TOKEN_TTL_SECS",
            defaults.access_token_ttl_secs,
        )?;
        if !(MIN_ACCESS_TOKEN_TTL_SECS..=MAX_ACCESS_TOKEN_TTL_SECS)
            .contains(&access_token_ttl_secs)
        {
            bail!(
                "WARDEN_ACCESS_TOKEN_TTL_SECS must be within \
                 {MIN_ACCESS_TOKEN_TTL_SECS}..={MAX_ACCESS_TOKEN_TTL_SECS}"
            );
        }

        let refresh_token_ttl_secs = parse_or(
            &lookup,
            "WARDEN_REFRESH_TOKEN_TTL_SECS",
            defaults.refresh_token_ttl_secs,
        )?;
        if !(MIN_REFRESH_TOKEN_TTL_SECS..=MAX_REFRESH_TOKEN_TTL_SECS)
            .contains(&refresh_token_ttl_secs)
        {
            bail!(
                "WARDEN_REFRESH_TOKEN_TTL_SECS must be within \
                 {MIN_REFRESH_TOKEN_TTL_SECS}..={MAX_REFRESH_TOKEN_TTL_SECS}"
            );
        }

        let clock_skew_secs = parse_or(&lookup, "WARDEN_CLOCK_SKEW_SECS", 0)?;
        if !(0..=MAX_CLOCK_SKEW_SECS).contains(&clock_skew_secs) {
            bail!("WARDEN_CLOCK_SKEW_SECS must be within 0..={MAX_CLOCK_SKEW_SECS}");
        }

        let allowed_origins = match lookup("WARDEN_ALLOWED_ORIGINS") {
            Some(raw) => {
                let origins: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToOwned::to_owned)
                    .collect();
                if origins.iter().any(|origin| origin == "*") {
                    bail!("WARDEN_ALLOWED_ORIGINS must list explicit origins, not `*`");
                }
                origins
            }
            None => Vec::new(),
        };

        let heartbeat_secs: u64 = parse_or(
            &lookup,
            "WARDEN_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        if heartbeat_secs == 0 {
            bail!("WARDEN_HEARTBEAT_INTERVAL_SECS must be positive");
        }
        let stale_threshold_secs = parse_or(
            &lookup,
            "WARDEN_STALE_THRESHOLD_SECS",
            defaults.stale_threshold_secs,
        )?;
        // The sweep must tolerate at least one missed heartbeat tick, or
        // a transiently slow client gets disconnected spuriously.
        let min_stale = i64::try_from(heartbeat_secs.saturating_mul(2)).unwrap_or(i64::MAX);
        if stale_threshold_secs < min_stale {
            bail!("WARDEN_STALE_THRESHOLD_SECS must be at least twice the heartbeat interval");
        }

        let retention_window_secs = parse_or(
            &lookup,
            "WARDEN_RETENTION_WINDOW_SECS",
            defaults.retention_window_secs,
        )?;
        if retention_window_secs <= 0 {
            bail!("WARDEN_RETENTION_WINDOW_SECS must be positive");
        }

        let rate_limit_window_secs: u64 = parse_or(
            &lookup,
            "WARDEN_RATE_LIMIT_WINDOW_SECS",
            defaults.rate_limit_window.as_secs(),
        )?;
        if rate_limit_window_secs == 0 {
            bail!("WARDEN_RATE_LIMIT_WINDOW_SECS must be positive");
        }

        let outbound_queue = parse_or(&lookup, "WARDEN_OUTBOUND_QUEUE", defaults.outbound_queue)?;
        if outbound_queue == 0 {
            bail!("WARDEN_OUTBOUND_QUEUE must be positive");
        }

        Ok(Self {
            signing_secret,
            access_token_ttl_secs,
            refresh_token_ttl_secs,
            clock_skew_secs,
            allowed_origins,
            max_body_bytes: parse_or(&lookup, "WARDEN_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "WARDEN_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            rate_limit_requests_per_minute: parse_or(
                &lookup,
                "WARDEN_RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_requests_per_minute,
            )?,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            connect_requests_per_window: parse_or(
                &lookup,
                "WARDEN_CONNECT_REQUESTS_PER_WINDOW",
                defaults.connect_requests_per_window,
            )?,
            send_requests_per_window: parse_or(
                &lookup,
                "WARDEN_SEND_REQUESTS_PER_WINDOW",
                defaults.send_requests_per_window,
            )?,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            stale_threshold_secs,
            stale_sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "WARDEN_STALE_SWEEP_INTERVAL_SECS",
                defaults.stale_sweep_interval.as_secs(),
            )?),
            retention_window_secs,
            retention_sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "WARDEN_RETENTION_SWEEP_INTERVAL_SECS",
                defaults.retention_sweep_interval.as_secs(),
            )?),
            slow_query_threshold: Duration::from_millis(parse_or(
                &lookup,
                "WARDEN_SLOW_QUERY_THRESHOLD_MILLIS",
                u64::try_from(defaults.slow_query_threshold.as_millis()).unwrap_or(250),
            )?),
            outbound_queue,
            database_url: lookup("WARDEN_DATABASE_URL").or_else(|| lookup("DATABASE_URL")),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> anyhow::Result<T> {
    match lookup(name) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => Ok(value),
            Err(_) => bail!("{name} is not a valid value: {raw:?}"),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::server::core::AppConfig;

    const SECRET: &str = "not-used-outside-tests-0123456789abcdef";

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn minimal_environment_takes_defaults() {
        let config =
            AppConfig::from_lookup(lookup(&[("WARDEN_SIGNING_SECRET", SECRET)])).unwrap();
        assert_eq!(config.access_token_ttl_secs, 15 * 60);
        assert_eq!(config.clock_skew_secs, 0);
        assert!(config.allowed_origins.is_empty());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn missing_secret_refuses_startup() {
        let error = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(error.to_string().contains("WARDEN_SIGNING_SECRET"));
    }

    #[test]
    fn short_secret_refuses_startup() {
        let error =
            AppConfig::from_lookup(lookup(&[("WARDEN_SIGNING_SECRET", "too-short")])).unwrap_err();
        assert!(error.to_string().contains("at least"));
    }

    #[test]
    fn development_secret_refuses_startup() {
        let error = AppConfig::from_lookup(lookup(&[(
            "WARDEN_SIGNING_SECRET",
            "insecure-dev-secret-0000000000000000",
        )]))
        .unwrap_err();
        assert!(error.to_string().contains("development secret"));
    }

    #[test]
    fn ttl_bounds_are_enforced() {
        let error = AppConfig::from_lookup(lookup(&[
            ("WARDEN_SIGNING_SECRET", SECRET),
            ("WARDEN_ACCESS_TOKEN_TTL_SECS", "5"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("WARDEN_ACCESS_TOKEN_TTL_SECS"));

        let error = AppConfig::from_lookup(lookup(&[
            ("WARDEN_SIGNING_SECRET", SECRET),
            ("WARDEN_REFRESH_TOKEN_TTL_SECS", "99999999999"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("WARDEN_REFRESH_TOKEN_TTL_SECS"));
    }

    #[test]
    fn wildcard_origin_is_rejected() {
        let error = AppConfig::from_lookup(lookup(&[
            ("WARDEN_SIGNING_SECRET", SECRET),
            ("WARDEN_ALLOWED_ORIGINS", "https://app.example.org, *"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("explicit origins"));
    }

    #[test]
    fn origins_are_split_and_trimmed() {
        let config = AppConfig::from_lookup(lookup(&[
            ("WARDEN_SIGNING_SECRET", SECRET),
            (
                "WARDEN_ALLOWED_ORIGINS",
                "https://app.example.org , https://admin.example.org",
            ),
        ]))
        .unwrap();
        assert_eq!(
            config.allowed_origins,
            vec![
                String::from("https://app.example.org"),
                String::from("https://admin.example.org"),
            ]
        );
    }

    #[test]
    fn stale_threshold_must_cover_two_heartbeats() {
        let error = AppConfig::from_lookup(lookup(&[
            ("WARDEN_SIGNING_SECRET", SECRET),
            ("WARDEN_HEARTBEAT_INTERVAL_SECS", "30"),
            ("WARDEN_STALE_THRESHOLD_SECS", "45"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("twice the heartbeat"));
    }

    #[test]
    fn unparseable_number_names_the_variable() {
        let error = AppConfig::from_lookup(lookup(&[
            ("WARDEN_SIGNING_SECRET", SECRET),
            ("WARDEN_OUTBOUND_QUEUE", "lots"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("WARDEN_OUTBOUND_QUEUE"));
    }

    #[test]
    fn clock_skew_is_bounded() {
        let error = AppConfig::from_lookup(lookup(&[
            ("WARDEN_SIGNING_SECRET", SECRET),
            ("WARDEN_CLOCK_SKEW_SECS", "301"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("WARDEN_CLOCK_SKEW_SECS"));
    }
}
