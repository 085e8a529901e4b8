// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Process configuration for both service binaries. Everything is
//! read from the environment once at startup into plain structs; a
//! missing required key is fatal and exits the process.

use serde::{Deserialize, Serialize};
use shutter_types::Error;
use std::{fmt, str::FromStr, time::Duration};
use url::Url;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_NAME: &str = "image_resizer";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
pub const DEFAULT_RATE_LIMIT_DURATION: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(Error::FatalConfig(format!(
                "unknown NODE_ENV value: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ObjectStoreConfig {
    pub region: String,
    pub bucket: String,
    /// Base URL that redirects are issued against. Object keys are
    /// appended as percent-encoded path segments.
    pub public_url: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QueueBrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl QueueBrokerConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window, per client IP.
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT_MAX,
            window: DEFAULT_RATE_LIMIT_DURATION,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub port: u16,
    pub environment: Environment,
    pub mongodb_uri: String,
    pub db_name: String,
    pub object_store: ObjectStoreConfig,
    pub queue_broker: QueueBrokerConfig,
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
    /// Request-path prefix that must never be resolved, to stop the
    /// service from recursing into its own rendition bucket when it
    /// fronts it.
    pub resized_image_path: Option<String>,
    pub worker_concurrency: usize,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// The parser is a pure function over a key lookup so tests can
    /// feed it maps instead of mutating process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::FatalConfig(format!("missing required key {}", key)))
        };

        let port = parse_or(&lookup, "APP_PORT", DEFAULT_PORT)?;
        let environment = match lookup("NODE_ENV") {
            Some(value) => value.parse()?,
            None => Environment::Development,
        };

        let public_url = required("S3_PUBLIC_URL")?;
        Url::parse(&public_url)
            .map_err(|e| Error::FatalConfig(format!("S3_PUBLIC_URL is not a URL: {}", e)))?;

        let object_store = ObjectStoreConfig {
            region: required("AWS_REGION")?,
            bucket: required("S3_BUCKET_NAME")?,
            public_url,
            access_key_id: lookup("AWS_ACCESS_KEY_ID"),
            secret_access_key: lookup("AWS_SECRET_ACCESS_KEY"),
        };

        let queue_broker = QueueBrokerConfig {
            host: lookup("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&lookup, "REDIS_PORT", DEFAULT_REDIS_PORT)?,
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
        };

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .map(|csv| {
                csv.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let rate_limit = RateLimitConfig {
            max_requests: parse_or(&lookup, "RATE_LIMIT_MAX", DEFAULT_RATE_LIMIT_MAX)?,
            window: Duration::from_secs(parse_or(
                &lookup,
                "RATE_LIMIT_DURATION",
                DEFAULT_RATE_LIMIT_DURATION.as_secs(),
            )?),
        };

        Ok(Self {
            port,
            environment,
            mongodb_uri: required("MONGODB_URI")?,
            db_name: lookup("DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
            object_store,
            queue_broker,
            allowed_origins,
            rate_limit,
            resized_image_path: lookup("RESIZED_IMAGE_PATH").filter(|p| !p.is_empty()),
            worker_concurrency: parse_or(
                &lookup,
                "WORKER_CONCURRENCY",
                DEFAULT_WORKER_CONCURRENCY,
            )?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::FatalConfig(format!("cannot parse {}={:?}: {}", key, raw, e))),
    }
}
