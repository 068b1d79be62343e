// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Relay Configuration
//!
//! Connection, consumer and producer settings. These are plain values bound from an
//! external configuration source through serde, then validated eagerly by the
//! builders before any connection is attempted.

use crate::errors::AmqpError;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Connection parameters of a single broker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Delay between two connection attempts. Also used as the network recovery interval.
    #[serde(rename = "retry_timeout_ms", with = "duration_ms")]
    pub retry_timeout: Duration,
    /// How many times a failed initial connection is retried before giving up.
    #[serde(default)]
    pub max_reconnect_count: u32,
}

fn default_virtual_host() -> String {
    "/".to_owned()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "localhost".to_owned(),
            virtual_host: default_virtual_host(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            retry_timeout: Duration::from_secs(5),
            max_reconnect_count: 0,
        }
    }
}

impl ConnectionConfig {
    /// Checks every field, returning the first violation found.
    pub fn validate(&self) -> Result<(), AmqpError> {
        required("host", &self.host)?;
        required("virtual host", &self.virtual_host)?;
        required("user", &self.user)?;
        required("password", &self.password)?;

        if self.port == 0 {
            return Err(AmqpError::InvalidConfiguration(
                "the port must be correct".to_owned(),
            ));
        }

        if self.retry_timeout.is_zero() {
            return Err(AmqpError::InvalidConfiguration(
                "retry timeout must be greater than 0".to_owned(),
            ));
        }

        Ok(())
    }

    /// Builds the AMQP URI used to open the connection.
    ///
    /// The URI is assembled field by field, so credentials and virtual hosts holding
    /// reserved characters such as `@`, `/` or `#` reach the broker unchanged. A
    /// leading `/` is stripped from any virtual host other than the default one.
    ///
    /// # Returns
    /// The `amqp` scheme URI of this instance, with an empty query string
    pub fn uri(&self) -> AMQPUri {
        let vhost = if self.virtual_host == "/" {
            self.virtual_host.clone()
        } else {
            self.virtual_host.trim_start_matches('/').to_owned()
        };

        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost,
            query: AMQPQueryString::default(),
        }
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Consumer-side settings of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Scopes the names of the queues and exchanges derived for each subscription.
    pub consumer_group: String,
    /// Ceiling shared by every subscription of the instance.
    pub max_degree_of_parallelism: u16,
}

impl ConsumerConfig {
    /// Creates consumer settings.
    ///
    /// # Parameters
    /// * `consumer_group` - Prefix of the queue and dead-letter names of every subscription
    /// * `max_degree_of_parallelism` - Deliveries processed at once across the instance
    pub fn new(consumer_group: &str, max_degree_of_parallelism: u16) -> ConsumerConfig {
        ConsumerConfig {
            consumer_group: consumer_group.to_owned(),
            max_degree_of_parallelism,
        }
    }

    /// # Returns
    /// `InvalidConfiguration` when the group is blank or the parallelism is 0
    pub fn validate(&self) -> Result<(), AmqpError> {
        required("consumer group", &self.consumer_group)?;

        if self.max_degree_of_parallelism < 1 {
            return Err(AmqpError::InvalidConfiguration(
                "max degree of parallelism must be greater than 0".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Producer-side settings of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Bounds the number of channels used concurrently for publishing.
    pub max_pool_length: usize,
    /// Additional publish attempts after a failed one.
    #[serde(default)]
    pub max_retry_count: u32,
    #[serde(rename = "attempt_delay_ms", with = "duration_ms", default = "default_attempt_delay")]
    pub attempt_delay: Duration,
}

fn default_attempt_delay() -> Duration {
    Duration::from_millis(100)
}

impl ProducerConfig {
    /// Producer settings with no publish retry and a 100ms attempt delay.
    pub fn new(max_pool_length: usize) -> ProducerConfig {
        ProducerConfig {
            max_pool_length,
            max_retry_count: 0,
            attempt_delay: default_attempt_delay(),
        }
    }

    /// Checks the pool length and the attempt delay.
    ///
    /// # Returns
    /// `Ok(())` when valid, otherwise `InvalidConfiguration` naming the first violation
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.max_pool_length < 1 {
            return Err(AmqpError::InvalidConfiguration(
                "the maximum number of producers must be at least 1".to_owned(),
            ));
        }

        if self.attempt_delay.is_zero() {
            return Err(AmqpError::InvalidConfiguration(
                "attempt delay must be greater than 0".to_owned(),
            ));
        }

        Ok(())
    }
}

fn required(field: &str, value: &str) -> Result<(), AmqpError> {
    if value.trim().is_empty() {
        return Err(AmqpError::InvalidConfiguration(format!(
            "the {} must be specified",
            field
        )));
    }

    Ok(())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_config_binds_from_json() {
        let cfg: ConnectionConfig = serde_json::from_str(
            r#"{
                "host": "rabbit",
                "port": 5673,
                "user": "app",
                "password": "secret",
                "retry_timeout_ms": 1500,
                "max_reconnect_count": 3
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.virtual_host, "/");
        assert_eq!(cfg.retry_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.max_reconnect_count, 3);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.to_string(), "rabbit:5673");
    }

    #[test]
    fn connection_config_rejects_invalid_fields() {
        let mut cfg = ConnectionConfig::default();
        cfg.host = " ".to_owned();
        assert!(matches!(
            cfg.validate(),
            Err(AmqpError::InvalidConfiguration(_))
        ));

        let mut cfg = ConnectionConfig::default();
        cfg.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ConnectionConfig::default();
        cfg.retry_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn uri_keeps_default_vhost() {
        let uri = ConnectionConfig::default().uri();
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);

        let mut cfg = ConnectionConfig::default();
        cfg.virtual_host = "/orders".to_owned();
        assert_eq!(cfg.uri().vhost, "orders");
    }

    #[test]
    fn uri_keeps_reserved_characters_in_credentials() {
        let mut cfg = ConnectionConfig::default();
        cfg.user = "ops:team".to_owned();
        cfg.password = "p@ss/w#rd".to_owned();
        cfg.virtual_host = "tenant?a".to_owned();
        assert!(cfg.validate().is_ok());

        let uri = cfg.uri();
        assert_eq!(uri.authority.userinfo.username, "ops:team");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w#rd");
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "tenant?a");
    }

    #[test]
    fn consumer_and_producer_configs_validate() {
        assert!(ConsumerConfig::new("billing", 1).validate().is_ok());
        assert!(ConsumerConfig::new("", 1).validate().is_err());
        assert!(ConsumerConfig::new("billing", 0).validate().is_err());

        assert!(ProducerConfig::new(1).validate().is_ok());
        assert!(ProducerConfig::new(0).validate().is_err());
    }
}
