//! Session configuration.

use sqldao_core::IsolationLevel;

/// Configuration for Session behavior.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Begin a transaction on the first operation that needs one.
    pub auto_begin: bool,
    /// Flush pending writes of the touched tables before every SELECT.
    pub flush_before_query: bool,
    /// Return rows to the unloaded state when the transaction ends, so the
    /// next field read fetches fresh values.
    pub expire_on_commit: bool,
    /// Isolation level passed to `BEGIN`.
    pub isolation: IsolationLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            flush_before_query: true,
            expire_on_commit: true,
            isolation: IsolationLevel::default(),
        }
    }
}

impl SessionConfig {
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    pub fn flush_before_query(mut self, value: bool) -> Self {
        self.flush_before_query = value;
        self
    }

    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_begin);
        assert!(config.flush_before_query);
        assert!(config.expire_on_commit);
        assert_eq!(config.isolation, IsolationLevel::default());
    }

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::default()
            .auto_begin(false)
            .isolation(IsolationLevel::Serializable);
        assert!(!config.auto_begin);
        assert_eq!(config.isolation, IsolationLevel::Serializable);
    }
}
