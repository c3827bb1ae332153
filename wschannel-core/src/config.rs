//! Channel configuration
//!
//! Flow-control water marks and closing-handshake timeouts.

use crate::error::{ConfigError, Error, Result};
use crate::protocol::constants::{
    DEFAULT_CLOSING_HANDSHAKE_TIMEOUT, DEFAULT_SEND_QUOTA_HIGH_WATER_MARK,
    DEFAULT_SEND_QUOTA_LOW_WATER_MARK, DEFAULT_UNDERLYING_CONNECTION_CLOSE_TIMEOUT,
};
use std::time::Duration;

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Send quota below which a completed write triggers a refill
    pub send_quota_low_water_mark: usize,
    /// Send quota granted on connect and restored by each refill
    pub send_quota_high_water_mark: usize,
    /// How long the peer has to answer a Close frame we sent
    pub closing_handshake_timeout: Duration,
    /// How long the peer has to drop the connection after the closing
    /// handshake completed
    pub underlying_connection_close_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_quota_low_water_mark: DEFAULT_SEND_QUOTA_LOW_WATER_MARK,
            send_quota_high_water_mark: DEFAULT_SEND_QUOTA_HIGH_WATER_MARK,
            closing_handshake_timeout: DEFAULT_CLOSING_HANDSHAKE_TIMEOUT,
            underlying_connection_close_timeout: DEFAULT_UNDERLYING_CONNECTION_CLOSE_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.send_quota_high_water_mark == 0 {
            return Err(Error::Config(ConfigError::Validation(
                "send_quota_high_water_mark must be greater than 0".to_string(),
            )));
        }

        if self.send_quota_high_water_mark > i32::MAX as usize {
            return Err(Error::Config(ConfigError::InvalidValue {
                field: "send_quota_high_water_mark".to_string(),
                value: self.send_quota_high_water_mark.to_string(),
            }));
        }

        if self.send_quota_low_water_mark > self.send_quota_high_water_mark {
            return Err(Error::Config(ConfigError::Validation(
                "send_quota_low_water_mark must be less than or equal to send_quota_high_water_mark"
                    .to_string(),
            )));
        }

        if self.closing_handshake_timeout.is_zero() {
            return Err(Error::Config(ConfigError::Validation(
                "closing_handshake_timeout must be greater than 0".to_string(),
            )));
        }

        if self.underlying_connection_close_timeout.is_zero() {
            return Err(Error::Config(ConfigError::Validation(
                "underlying_connection_close_timeout must be greater than 0".to_string(),
            )));
        }

        Ok(())
    }

    /// Set both send quota water marks
    pub fn send_quota_water_marks(mut self, low: usize, high: usize) -> Self {
        self.send_quota_low_water_mark = low;
        self.send_quota_high_water_mark = high;
        self
    }

    /// Set the closing handshake timeout
    pub fn closing_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.closing_handshake_timeout = timeout;
        self
    }

    /// Set the underlying connection close timeout
    pub fn underlying_connection_close_timeout(mut self, timeout: Duration) -> Self {
        self.underlying_connection_close_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_default() {
        let config = ChannelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.send_quota_low_water_mark, 65536);
        assert_eq!(config.send_quota_high_water_mark, 131072);
        assert_eq!(config.closing_handshake_timeout, Duration::from_secs(60));
        assert_eq!(
            config.underlying_connection_close_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_channel_config_validation() {
        let config = ChannelConfig::default().send_quota_water_marks(10, 0);
        assert!(config.validate().is_err());

        let config = ChannelConfig::default().send_quota_water_marks(20, 10);
        assert!(config.validate().is_err());

        let config = ChannelConfig::default().send_quota_water_marks(0, usize::MAX);
        assert!(matches!(
            config.validate(),
            Err(Error::Config(ConfigError::InvalidValue { .. }))
        ));

        let config = ChannelConfig::default().closing_handshake_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_config_builder() {
        let config = ChannelConfig::default()
            .send_quota_water_marks(8, 16)
            .closing_handshake_timeout(Duration::from_secs(5))
            .underlying_connection_close_timeout(Duration::from_millis(500));

        assert!(config.validate().is_ok());
        assert_eq!(config.send_quota_high_water_mark, 16);
        assert_eq!(config.closing_handshake_timeout, Duration::from_secs(5));
    }
}
