//! Infrastructure layer: HTTP transport, credential and egress pools,
//! request execution with retries, SQLite persistence, configuration and logging

pub mod checkpoint_repository;
pub mod config;
pub mod credential_pool;
pub mod credential_store;
pub mod database_connection;
pub mod egress_pool;
pub mod http_client;
pub mod logging;
pub mod request_executor;
pub mod retry_policy;
pub mod upsert_repository;
pub mod user_agent;

// Re-export commonly used items
pub use checkpoint_repository::SqliteCheckpointStore;
pub use config::{AppConfig, ConfigError, ConfigManager, EgressConfig, HarvestConfig, LoggingConfig};
pub use credential_pool::{CredentialPool, CredentialVerifier};
pub use credential_store::{CredentialStore, CredentialStoreError, JsonCredentialStore};
pub use database_connection::DatabaseConnection;
pub use egress_pool::{EgressLease, EgressPool, EgressSupplier, HttpEgressSupplier};
pub use http_client::{
    HttpClient, HttpClientConfig, HttpMethod, RequestContext, RequestSpec, ResponseFormat, Transport,
    TransportError,
};
pub use logging::{init_logging, init_logging_with_config};
pub use request_executor::{ExecutorError, RequestExecutor};
pub use retry_policy::{AttemptError, Backoff, FailureKind, RetryPolicy};
pub use upsert_repository::SqliteUpsertStore;
pub use user_agent::UserAgentRotator;
