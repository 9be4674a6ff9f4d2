//! Event repository trait definition.

use opsflow_types::error::RepositoryError;
use opsflow_types::event::Event;

/// Repository trait for inbound event records.
pub trait EventRepository: Send + Sync {
    fn create(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Full-row update keyed by `(organization_id, id)`; the router uses it
    /// to stamp `processed_at` and the triggered workflow ids.
    fn update(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

impl<T: EventRepository> EventRepository for std::sync::Arc<T> {
    async fn create(&self, event: &Event) -> Result<(), RepositoryError> {
        self.as_ref().create(event).await
    }

    async fn update(&self, event: &Event) -> Result<(), RepositoryError> {
        self.as_ref().update(event).await
    }
}
