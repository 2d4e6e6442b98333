/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of one live client connection.
pub type SessionId = uuid::Uuid;
