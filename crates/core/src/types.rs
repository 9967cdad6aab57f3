/// Numeric identifiers owned by the surrounding platform (users).
pub type DbId = i64;

/// Identifiers minted by this system (runs, stages, plans, conversations).
///
/// UUIDv7 so that ids sort by creation time.
pub type EntityId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Mint a new time-ordered entity id.
pub fn new_id() -> EntityId {
    uuid::Uuid::now_v7()
}
