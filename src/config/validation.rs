//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (addresses parse, backoff bounds ordered)
//! - Detect duplicate listener names and bind addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{BrokerConfig, ServiceConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("service name must not be empty")]
    EmptyName,

    #[error("listener '{listener}': invalid bind address '{address}'")]
    InvalidBindAddress { listener: String, address: String },

    #[error("listener name '{0}' is used more than once")]
    DuplicateListenerName(String),

    #[error("bind address '{0}' is used by more than one listener")]
    DuplicateBindAddress(String),

    #[error("broker: invalid address '{0}'")]
    InvalidBrokerAddress(String),

    #[error("broker: subscriber_queue must not be empty")]
    EmptySubscriberQueue,

    #[error("broker: prefetch_count must be greater than 0")]
    ZeroPrefetch,

    #[error("broker: reconnect_base_ms ({base}) must be > 0 and <= reconnect_max_ms ({max})")]
    InvalidBackoff { base: u64, max: u64 },
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }

    let mut listeners: Vec<(&str, &str)> = Vec::new();
    listeners.extend(config.http.iter().map(|l| (l.name.as_str(), l.bind_address.as_str())));
    listeners.extend(config.grpc.iter().map(|l| (l.name.as_str(), l.bind_address.as_str())));
    if config.debug.enabled {
        listeners.push(("debug", config.debug.bind_address.as_str()));
    }

    let mut names = HashSet::new();
    let mut addresses = HashSet::new();
    for (name, address) in listeners {
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidBindAddress {
                listener: name.to_string(),
                address: address.to_string(),
            });
        }
        if !names.insert(name) {
            errors.push(ValidationError::DuplicateListenerName(name.to_string()));
        }
        // Port 0 asks the OS for a fresh port each time, so it never collides.
        if !address.ends_with(":0") && !addresses.insert(address) {
            errors.push(ValidationError::DuplicateBindAddress(address.to_string()));
        }
    }

    if let Some(broker) = &config.broker {
        validate_broker(broker, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_broker(broker: &BrokerConfig, errors: &mut Vec<ValidationError>) {
    let scheme_ok = url::Url::parse(&broker.address)
        .map(|u| matches!(u.scheme(), "amqp" | "amqps" | "memory"))
        .unwrap_or(false);
    if !scheme_ok {
        errors.push(ValidationError::InvalidBrokerAddress(broker.address.clone()));
    }
    if broker.subscriber_queue.trim().is_empty() {
        errors.push(ValidationError::EmptySubscriberQueue);
    }
    if broker.prefetch_count == 0 {
        errors.push(ValidationError::ZeroPrefetch);
    }
    if broker.reconnect_base_ms == 0 || broker.reconnect_base_ms > broker.reconnect_max_ms {
        errors.push(ValidationError::InvalidBackoff {
            base: broker.reconnect_base_ms,
            max: broker.reconnect_max_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{GrpcListenerConfig, HttpListenerConfig};

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServiceConfig::default()).is_ok());
    }

    #[test]
    fn collects_all_errors() {
        let config = ServiceConfig {
            name: " ".into(),
            http: vec![
                HttpListenerConfig {
                    name: "api".into(),
                    bind_address: "127.0.0.1:8080".into(),
                    ..Default::default()
                },
                HttpListenerConfig {
                    name: "api".into(),
                    bind_address: "nowhere".into(),
                    ..Default::default()
                },
            ],
            grpc: vec![GrpcListenerConfig {
                name: "rpc".into(),
                bind_address: "127.0.0.1:8080".into(),
                ..Default::default()
            }],
            broker: Some(BrokerConfig {
                address: "kafka://x".into(),
                prefetch_count: 0,
                reconnect_base_ms: 500,
                reconnect_max_ms: 100,
                ..Default::default()
            }),
            ..Default::default()
        };

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyName));
        assert!(errors.contains(&ValidationError::DuplicateListenerName("api".into())));
        assert!(errors.contains(&ValidationError::DuplicateBindAddress("127.0.0.1:8080".into())));
        assert!(errors.contains(&ValidationError::InvalidBindAddress {
            listener: "api".into(),
            address: "nowhere".into(),
        }));
        assert!(errors.contains(&ValidationError::InvalidBrokerAddress("kafka://x".into())));
        assert!(errors.contains(&ValidationError::ZeroPrefetch));
        assert!(errors.contains(&ValidationError::InvalidBackoff { base: 500, max: 100 }));
    }

    #[test]
    fn ephemeral_ports_do_not_collide() {
        let config = ServiceConfig {
            http: vec![
                HttpListenerConfig {
                    name: "a".into(),
                    bind_address: "127.0.0.1:0".into(),
                    ..Default::default()
                },
                HttpListenerConfig {
                    name: "b".into(),
                    bind_address: "127.0.0.1:0".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }
}
