use stevedore_shared::{Container, Node};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Durable mapping for the two entity kinds. Single-key reads and writes are
/// atomic, lists are snapshot scans, and writes are serialized by the
/// implementation.
pub trait Store: Send + Sync + 'static + Clone {
    fn save_container(
        &self,
        container: &Container,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_container(&self, id: &str) -> impl Future<Output = Result<Container, StoreError>> + Send;

    fn list_containers(&self) -> impl Future<Output = Result<Vec<Container>, StoreError>> + Send;

    fn delete_container(&self, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn save_node(&self, node: &Node) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_node(&self, id: &str) -> impl Future<Output = Result<Node, StoreError>> + Send;

    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Node>, StoreError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}
