use std::time::Duration;

use hearth_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_MIN_CONNECTIONS` (optional, defaults to 1)
    /// - `DATABASE_MAX_LIFETIME_SECS` (optional, defaults to 1800)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })?;
        Self::from_parts(
            url,
            std::env::var("DATABASE_MAX_CONNECTIONS").ok(),
            std::env::var("DATABASE_MIN_CONNECTIONS").ok(),
            std::env::var("DATABASE_MAX_LIFETIME_SECS").ok(),
        )
    }

    fn from_parts(
        url: String,
        max_connections: Option<String>,
        min_connections: Option<String>,
        max_lifetime_secs: Option<String>,
    ) -> Result<Self, AppError> {
        let max_connections = parse_var("DATABASE_MAX_CONNECTIONS", max_connections, 5)?;
        if max_connections == 0 {
            return Err(AppError::ConfigError(
                "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
            ));
        }

        let min_connections = parse_var("DATABASE_MIN_CONNECTIONS", min_connections, 1)?;
        if min_connections > max_connections {
            return Err(AppError::ConfigError(format!(
                "DATABASE_MIN_CONNECTIONS ({min_connections}) exceeds DATABASE_MAX_CONNECTIONS ({max_connections})"
            )));
        }

        let lifetime = parse_var("DATABASE_MAX_LIFETIME_SECS", max_lifetime_secs, 1800)?;

        Ok(Self {
            url,
            max_connections,
            min_connections,
            max_lifetime: Duration::from_secs(u64::from(lifetime)),
        })
    }
}

fn parse_var(name: &str, raw: Option<String>, default: u32) -> Result<u32, AppError> {
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!(
                "Invalid {name} '{raw}': must be a non-negative integer"
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: Option<&str>, min: Option<&str>, life: Option<&str>) -> Result<DatabaseConfig, AppError> {
        DatabaseConfig::from_parts(
            "postgres://localhost/hearth".into(),
            max.map(str::to_string),
            min.map(str::to_string),
            life.map(str::to_string),
        )
    }

    #[test]
    fn test_defaults() {
        let cfg = config(None, None, None).unwrap();
        assert_eq!(cfg.max_connections, 5);
        assert_eq!(cfg.min_connections, 1);
        assert_eq!(cfg.max_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(Some("20"), Some("2"), Some("60")).unwrap();
        assert_eq!(cfg.max_connections, 20);
        assert_eq!(cfg.min_connections, 2);
        assert_eq!(cfg.max_lifetime, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(config(Some("0"), None, None), Err(AppError::ConfigError(_))));
        assert!(matches!(config(Some("many"), None, None), Err(AppError::ConfigError(_))));
        assert!(matches!(config(Some("2"), Some("3"), None), Err(AppError::ConfigError(_))));
    }
}
