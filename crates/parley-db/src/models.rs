/// Database row types: these map directly to SQLite rows.
/// Distinct from parley-types models to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub customer_id: String,
    pub is_closed: bool,
    pub latest_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub seq: i64,
    pub sender: String,
    pub text: String,
    pub status: String,
    pub created_at: String,
}
