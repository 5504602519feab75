use linkmux_errors::TransportResult;

/// String key/value persistence used for ban history and heartbeat tuning.
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &str) -> TransportResult<Option<String>>;

    fn write(&self, key: &str, value: &str) -> TransportResult<()>;

    fn remove(&self, key: &str) -> TransportResult<()>;

    fn keys(&self, prefix: &str) -> TransportResult<Vec<String>>;
}
