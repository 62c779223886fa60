//! Session ownership: persisted credentials, the `/auth/*` gateway and the
//! single-flight, operator-gated token refresh.

pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod prompt;

pub use coordinator::{RefreshFuture, SessionCoordinator, SessionState};
pub use credentials::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, StoredSession, UserProfile,
};
pub use error::AuthError;
pub use gateway::{is_auth_endpoint, AuthGateway, RegisterRequest, TokenResponse};
pub use prompt::{AutoExtend, DecisionGate, SessionDecision, SessionPrompt};
