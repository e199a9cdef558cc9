/// Fresh unique id for an invalidation event.
pub fn generate_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fresh unique id for a subscriber connection.
pub fn generate_connection_id() -> String {
    format!("conn-{}", uuid::Uuid::new_v4().simple())
}
