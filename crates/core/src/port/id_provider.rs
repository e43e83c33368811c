// ID Provider Port (for deterministic testing)

/// ID provider interface (allows deterministic app ids in tests)
pub trait IdProvider: Send + Sync {
    /// Generate an id for an app submitted without an explicit name
    fn generate_id(&self) -> String;
}

/// UUID v4 provider (production)
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
