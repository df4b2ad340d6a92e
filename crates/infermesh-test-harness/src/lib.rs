//! # InferMesh Test Harness
//!
//! Building blocks for end-to-end tests: a scriptable raw-TCP mock
//! backend that counts connections and requests, an axum-based mock
//! inference service for probe-facing tests, a raw HTTP test client
//! with full control over connection reuse, and a proxy fixture that
//! stands up a complete proxy (plus console) on ephemeral ports.

pub mod http_client;
pub mod mock_backend;
pub mod proxy_fixture;

pub use http_client::TestClient;
pub use mock_backend::{BackendReply, MockInferenceService, RawBackend, RecordedRequest};
pub use proxy_fixture::ProxyFixture;
