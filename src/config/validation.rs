use crate::config::models::{ClientConfig, ProxyConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid proxy configuration: {message}")]
    InvalidProxy { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Client configuration validator
pub struct ClientConfigValidator;

impl ClientConfigValidator {
    /// Validate the entire client configuration, reporting every problem at once
    pub fn validate(config: &ClientConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("timeouts.connect_ms", config.timeouts.connect_ms),
            ("timeouts.read_ms", config.timeouts.read_ms),
            ("timeouts.write_ms", config.timeouts.write_ms),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Timeouts must be greater than 0".to_string(),
                });
            }
        }

        if config.pool.keep_alive_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "pool.keep_alive_secs".to_string(),
                message: "Keep-alive must be greater than 0; use max_idle_connections = 0 to disable pooling".to_string(),
            });
        }

        if config.redirects.follow_redirects && config.redirects.max_follow_ups == 0 {
            errors.push(ValidationError::InvalidField {
                field: "redirects.max_follow_ups".to_string(),
                message: "Must be greater than 0 when follow_redirects is enabled".to_string(),
            });
        }

        if let Some(proxy) = &config.proxy {
            errors.extend(Self::validate_proxy(proxy));
        }

        if config.user_agent.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "user_agent".to_string(),
                message: "User agent must not be empty".to_string(),
            });
        } else if http::HeaderValue::from_str(&config.user_agent).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "user_agent".to_string(),
                message: "User agent is not a valid header value".to_string(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            }),
        }
    }

    fn validate_proxy(proxy: &ProxyConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let host = proxy.host.trim();
        if host.is_empty() {
            errors.push(ValidationError::InvalidProxy {
                message: "Proxy host must not be empty".to_string(),
            });
        } else if host.contains(['/', ' ', '@']) {
            errors.push(ValidationError::InvalidProxy {
                message: format!("Proxy host '{host}' must be a bare host name or IP address"),
            });
        }
        if proxy.port == 0 {
            errors.push(ValidationError::InvalidProxy {
                message: "Proxy port must be greater than 0".to_string(),
            });
        }
        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
