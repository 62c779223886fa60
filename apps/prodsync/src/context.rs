use crate::auth::{AuthError, AuthGateway, FileCredentialStore, SessionCoordinator, SessionPrompt};
use crate::config::ClientConfig;
use crate::field::SaveStrategy;
use crate::push::{PushChannel, TokenSource};
use crate::sync::SyncError;
use crate::transport::{ApiClient, ApiError, ProductionApi};
use crate::view::{ProductionBoard, ProductionView};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Explicitly constructed client services shared by every view.
pub struct ClientContext {
    config: ClientConfig,
    session: SessionCoordinator,
    api: ApiClient,
    productions: Arc<ProductionApi>,
    push: Option<PushChannel>,
}

impl ClientContext {
    /// Builds the transport and restores the persisted session. The push
    /// channel is opened separately with [`ClientContext::open_push`].
    pub fn open(config: ClientConfig, prompt: Arc<dyn SessionPrompt>) -> Result<Self, ContextError> {
        let gateway = AuthGateway::new(config.api_base.as_str(), config.request_timeout)?;
        let store = Arc::new(FileCredentialStore::new(config.credentials_path.clone()));
        let session = SessionCoordinator::open(gateway, store, prompt)?;
        let api = ApiClient::new(config.api_base.as_str(), session.clone(), config.request_timeout)?;
        let productions = Arc::new(ProductionApi::new(api.clone()));
        info!(
            target: "prodsync::transport",
            api = %config.api_base,
            logged_in = session.is_logged_in(),
            "client context ready"
        );
        Ok(Self {
            config,
            session,
            api,
            productions,
            push: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn productions(&self) -> &Arc<ProductionApi> {
        &self.productions
    }

    /// Autosave strategy using the configured idle delay.
    pub fn debounced(&self) -> SaveStrategy {
        SaveStrategy::Debounced(self.config.debounce)
    }

    /// Opens the shared push channel on first use.
    pub fn open_push(&mut self) -> PushChannel {
        if let Some(push) = &self.push {
            return push.clone();
        }
        let session = self.session.clone();
        let token: TokenSource = Arc::new(move || session.access_token());
        let push = PushChannel::open(self.config.push_url.clone(), self.config.reconnect, token);
        self.push = Some(push.clone());
        push
    }

    pub async fn open_view(&mut self, code: &str) -> Result<ProductionView, SyncError> {
        let push = self.open_push();
        ProductionView::open(code, Arc::clone(&self.productions), &push).await
    }

    pub fn open_board(&mut self) -> ProductionBoard {
        let push = self.open_push();
        ProductionBoard::open(&push, Vec::new())
    }

    pub async fn close(mut self) {
        if let Some(push) = self.push.take() {
            push.close().await;
        }
    }
}
