//! Screens and the collaborator each one mounts.
//!
//! Every screen builds its own collaborator from [`BackendConfig`] when it is
//! mounted. Nothing is shared between screens.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::capabilities::{
    Collaborator, CollaboratorError, GraphQlCollaborator, ReqwestTransport, RestCollaborator,
    ValidatedUrl,
};
use crate::config::{BackendConfig, ConfigError};
use crate::editor::Editor;

#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("{0} is not available on this target")]
    Unsupported(Screen),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Screen {
    DataStoreSync,
    GraphQl,
    Rest,
}

impl Screen {
    /// Sidebar order.
    pub const ALL: [Screen; 3] = [Screen::DataStoreSync, Screen::GraphQl, Screen::Rest];

    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let trimmed = path.trim_end_matches('/');
        Self::ALL
            .into_iter()
            .find(|screen| screen.path().trim_end_matches('/') == trimmed)
    }

    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Screen::DataStoreSync => "/",
            Screen::GraphQl => "/graphql",
            Screen::Rest => "/rest",
        }
    }

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Screen::DataStoreSync => "DataStore Sync Demo",
            Screen::GraphQl => "GraphQL Demo",
            Screen::Rest => "REST Demo",
        }
    }

    /// Builds a fresh collaborator for this screen.
    pub fn collaborator(self, config: &BackendConfig) -> Result<Arc<dyn Collaborator>, MountError> {
        match self {
            Screen::DataStoreSync => Self::datastore(config),
            Screen::GraphQl => {
                let graphql = config.graphql()?;
                let endpoint = ValidatedUrl::new(graphql.endpoint.as_str()).map_err(CollaboratorError::from)?;
                let collaborator = GraphQlCollaborator::new(
                    http_transport(config)?,
                    endpoint,
                    SecretString::new(graphql.api_key.expose_secret().clone()),
                )
                .with_timeout(config.http.timeout());
                Ok(Arc::new(collaborator))
            }
            Screen::Rest => {
                let rest = config.rest()?;
                let endpoint = ValidatedUrl::new(rest.endpoint.as_str()).map_err(CollaboratorError::from)?;
                let mut collaborator = RestCollaborator::new(http_transport(config)?, &endpoint, &rest.resource)?
                    .with_timeout(config.http.timeout());
                if let Some(token) = &rest.auth_token {
                    collaborator = collaborator.with_auth_token(SecretString::new(token.expose_secret().clone()));
                }
                Ok(Arc::new(collaborator))
            }
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn datastore(config: &BackendConfig) -> Result<Arc<dyn Collaborator>, MountError> {
        use crate::capabilities::DataStoreCollaborator;

        let store = match &config.datastore.path {
            Some(path) => DataStoreCollaborator::open(path),
            None => DataStoreCollaborator::open_in_memory(),
        }
        .map_err(CollaboratorError::from)?;
        Ok(Arc::new(store))
    }

    #[cfg(target_arch = "wasm32")]
    fn datastore(_config: &BackendConfig) -> Result<Arc<dyn Collaborator>, MountError> {
        Err(MountError::Unsupported(Screen::DataStoreSync))
    }

    /// Builds the screen's editor and runs its mount fetch.
    pub async fn mount(self, config: &BackendConfig) -> Result<Editor, MountError> {
        let editor = Editor::new(self.collaborator(config)?, config.editor);
        info!(screen = self.title(), "screen mounted");
        editor.load().await;
        Ok(editor)
    }
}

impl std::fmt::Display for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.title())
    }
}

fn http_transport(config: &BackendConfig) -> Result<Arc<ReqwestTransport>, CollaboratorError> {
    Ok(Arc::new(ReqwestTransport::with_timeout(config.http.timeout())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CollaboratorKind;

    #[test]
    fn test_routes() {
        assert_eq!(Screen::from_path("/"), Some(Screen::DataStoreSync));
        assert_eq!(Screen::from_path(""), Some(Screen::DataStoreSync));
        assert_eq!(Screen::from_path("/graphql"), Some(Screen::GraphQl));
        assert_eq!(Screen::from_path("/rest/"), Some(Screen::Rest));
        assert_eq!(Screen::from_path("/settings"), None);
        for screen in Screen::ALL {
            assert_eq!(Screen::from_path(screen.path()), Some(screen));
        }
    }

    #[test]
    fn test_titles() {
        assert_eq!(Screen::GraphQl.to_string(), "GraphQL Demo");
        assert_eq!(Screen::DataStoreSync.title(), "DataStore Sync Demo");
    }

    #[test]
    fn test_missing_section_is_reported() {
        let config = BackendConfig::default();
        assert!(matches!(
            Screen::GraphQl.collaborator(&config),
            Err(MountError::Config(ConfigError::Missing("graphql")))
        ));
        assert!(matches!(
            Screen::Rest.collaborator(&config),
            Err(MountError::Config(ConfigError::Missing("rest")))
        ));
    }

    #[test]
    fn test_builds_http_collaborators() {
        let config = BackendConfig::from_json_str(
            r#"{
                "graphql": {"endpoint": "https://x.example.com/graphql", "api_key": "k"},
                "rest": {"endpoint": "https://api.example.com/prod"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            Screen::GraphQl.collaborator(&config).unwrap().kind(),
            CollaboratorKind::GraphQl
        );
        assert_eq!(Screen::Rest.collaborator(&config).unwrap().kind(), CollaboratorKind::Rest);
    }

    #[tokio::test]
    async fn test_each_mount_gets_its_own_store() {
        let config = BackendConfig::default();
        let first = Screen::DataStoreSync.mount(&config).await.unwrap();
        first.create("Only here", "").await;
        assert_eq!(first.view().await.items.len(), 1);

        let second = Screen::DataStoreSync.mount(&config).await.unwrap();
        assert_eq!(second.collaborator_kind(), CollaboratorKind::DataStore);
        assert!(second.view().await.items.is_empty());
        assert!(second.view().await.notice.is_none());
    }
}
