//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (active profile references a known profile)
//! - Validate value ranges and address formats
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServiceConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is not a valid socket address: {value}")]
    BadAddress { field: &'static str, value: String },

    #[error("engine.controller_url is not a valid URL: {0}")]
    BadControllerUrl(String),

    #[error("duplicate profile id: {0}")]
    DuplicateProfile(String),

    #[error("active_profile references unknown profile: {0}")]
    UnknownActiveProfile(String),

    #[error("service.id must not be empty")]
    EmptyServiceId,
}

pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.service.id.trim().is_empty() {
        errors.push(ValidationError::EmptyServiceId);
    }

    let non_zero = [
        ("service.observer_queue_capacity", config.service.observer_queue_capacity as u64),
        ("polling.traffic_interval_ms", config.polling.traffic_interval_ms),
        ("polling.bandwidth_interval_ms", config.polling.bandwidth_interval_ms),
        ("polling.log_interval_ms", config.polling.log_interval_ms),
        ("engine.log_buffer_lines", config.engine.log_buffer_lines as u64),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BadAddress {
            field: "admin.bind_address",
            value: config.admin.bind_address.clone(),
        });
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::BadAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if url::Url::parse(&config.engine.controller_url).is_err() {
        errors.push(ValidationError::BadControllerUrl(config.engine.controller_url.clone()));
    }

    let mut seen = HashSet::new();
    for profile in &config.profiles {
        if !seen.insert(profile.id.as_str()) {
            errors.push(ValidationError::DuplicateProfile(profile.id.clone()));
        }
    }

    if let Some(active) = &config.active_profile {
        if !seen.contains(active.as_str()) {
            errors.push(ValidationError::UnknownActiveProfile(active.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
