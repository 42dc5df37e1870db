// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server tuning and its environment-variable surface.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::errors::ConfigError;
use crate::framing::DEFAULT_MAX_LINE_SIZE;
use crate::sender::{RetryPolicy, DEFAULT_API_TIMEOUT};

const ENV_BIND: &str = "LINEHAUL_BIND";
const ENV_PORT: &str = "LINEHAUL_PORT";
const ENV_TOKEN: &str = "LINEHAUL_TOKEN";
const ENV_MAX_LINE_SIZE: &str = "LINEHAUL_MAX_LINE_SIZE";
const ENV_RECV_SIZE: &str = "LINEHAUL_RECV_SIZE";
const ENV_QUEUED_EVENTS: &str = "LINEHAUL_QUEUED_EVENTS";
const ENV_BATCH_SIZE: &str = "LINEHAUL_BATCH_SIZE";
const ENV_BATCH_TIMEOUT: &str = "LINEHAUL_BATCH_TIMEOUT_SECS";
const ENV_API_TIMEOUT: &str = "LINEHAUL_API_TIMEOUT_SECS";
const ENV_RETRY_MAX_ATTEMPTS: &str = "LINEHAUL_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_MAX_WAIT: &str = "LINEHAUL_RETRY_MAX_WAIT_SECS";
const ENV_RETRY_MULTIPLIER: &str = "LINEHAUL_RETRY_MULTIPLIER";
const ENV_MAX_IN_FLIGHT_SENDS: &str = "LINEHAUL_MAX_IN_FLIGHT_SENDS";

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 512;
pub const DEFAULT_RECV_SIZE: usize = 8192;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Shared secret every line must start with. `None` accepts all lines.
    pub token: Option<String>,
    pub max_line_size: usize,
    /// Bytes requested per socket read.
    pub recv_size: usize,
    /// Capacity of the queue between connections and the dispatcher.
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Hard limit on a single sink call.
    pub api_timeout: Duration,
    pub retry: RetryPolicy,
    /// Cap on concurrently running send tasks. `None` leaves fan-out unbounded.
    pub max_in_flight_sends: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            token: None,
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            recv_size: DEFAULT_RECV_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            api_timeout: DEFAULT_API_TIMEOUT,
            retry: RetryPolicy::default(),
            max_in_flight_sends: None,
        }
    }
}

impl ServerConfig {
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from key/value pairs. Unset or unparseable values keep their defaults.
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let defaults = Self::default();

        Self {
            bind: non_empty(&map, ENV_BIND).unwrap_or(defaults.bind),
            port: parse_or(&map, ENV_PORT, defaults.port),
            token: non_empty(&map, ENV_TOKEN),
            max_line_size: parse_or(&map, ENV_MAX_LINE_SIZE, defaults.max_line_size),
            recv_size: parse_or(&map, ENV_RECV_SIZE, defaults.recv_size),
            queue_capacity: parse_or(&map, ENV_QUEUED_EVENTS, defaults.queue_capacity),
            batch_size: parse_or(&map, ENV_BATCH_SIZE, defaults.batch_size),
            batch_timeout: secs_or(&map, ENV_BATCH_TIMEOUT, defaults.batch_timeout),
            api_timeout: secs_or(&map, ENV_API_TIMEOUT, defaults.api_timeout),
            retry: RetryPolicy {
                max_attempts: parse_or(&map, ENV_RETRY_MAX_ATTEMPTS, defaults.retry.max_attempts),
                multiplier: parse_or(&map, ENV_RETRY_MULTIPLIER, defaults.retry.multiplier),
                max_wait: secs_or(&map, ENV_RETRY_MAX_WAIT, defaults.retry.max_wait),
            },
            max_in_flight_sends: Some(parse_or(&map, ENV_MAX_IN_FLIGHT_SENDS, 0usize))
                .filter(|limit| *limit > 0),
        }
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("max_line_size", self.max_line_size),
            ("recv_size", self.recv_size),
            ("queue_capacity", self.queue_capacity),
            ("batch_size", self.batch_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("retry_max_attempts"));
        }
        if self.max_in_flight_sends == Some(0) {
            return Err(ConfigError::Zero("max_in_flight_sends"));
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::Zero("batch_timeout"));
        }
        if self.api_timeout.is_zero() {
            return Err(ConfigError::Zero("api_timeout"));
        }
        let multiplier = self.retry.multiplier;
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(ConfigError::InvalidNumber {
                name: "retry_multiplier",
                value: multiplier,
            });
        }
        Ok(())
    }
}

fn non_empty(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_or<T>(map: &HashMap<String, String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match non_empty(map, key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value {:?} for {}, using default {}", raw, key, default);
            default
        }),
    }
}

fn secs_or(map: &HashMap<String, String>, key: &str, default: Duration) -> Duration {
    let secs = parse_or(map, key, default.as_secs_f64());
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
        warn!("Invalid duration {} for {}, using default {:?}", secs, key, default);
        default
    })
}
