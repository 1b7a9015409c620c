//! Aggregate service configuration

use juris_core::{
    CacheConfig, ConnectionConfig, HealthConfig, JurisResult, LimiterConfig, LockConfig,
    ThrottleConfig,
};

use crate::jobs::MaintenanceConfig;
use crate::telemetry::TelemetryConfig;

/// Everything the service needs to start, loaded in one place.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub limiter: LimiterConfig,
    pub health: HealthConfig,
    pub throttle: ThrottleConfig,
    pub maintenance: MaintenanceConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load every section from its `JURIS_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            connection: ConnectionConfig::from_env(),
            lock: LockConfig::from_env(),
            cache: CacheConfig::from_env(),
            limiter: LimiterConfig::from_env(),
            health: HealthConfig::from_env(),
            throttle: ThrottleConfig::from_env(),
            maintenance: MaintenanceConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        }
    }

    /// Validate every section; the first failure wins.
    pub fn validate(&self) -> JurisResult<()> {
        self.connection.validate()?;
        self.lock.validate()?;
        self.cache.validate()?;
        self.limiter.validate()?;
        self.health.validate()?;
        self.throttle.validate()?;
        self.maintenance.validate()?;
        Ok(())
    }
}
