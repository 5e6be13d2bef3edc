use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl};
use super::{Collaborator, CollaboratorError, CollaboratorKind};
use crate::model::{Item, ItemId, Version};
use crate::DEFAULT_HTTP_TIMEOUT;

#[derive(Serialize)]
struct TodoInput<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

/// Accepts both a bare array and an `{ "items": [...] }` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Bare(Vec<Item>),
    Envelope { items: Vec<Item> },
}

/// Todo resource behind a plain REST API (`/{resource}` and `/{resource}/{id}`).
///
/// The REST schema has no concurrency token. A version passed to `update` or
/// `delete` is still forwarded as `If-Match`, so a backend that does check it
/// can answer 412, which maps to a conflict.
pub struct RestCollaborator {
    transport: Arc<dyn HttpTransport>,
    collection: ValidatedUrl,
    auth_token: Option<SecretString>,
    timeout: Duration,
}

impl RestCollaborator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoint: &ValidatedUrl,
        resource: &str,
    ) -> Result<Self, CollaboratorError> {
        Ok(Self {
            transport,
            collection: endpoint.with_segments(&[resource])?,
            auth_token: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, method: HttpMethod, id: Option<&ItemId>) -> Result<HttpRequest, CollaboratorError> {
        let url = match id {
            Some(id) => self.collection.with_segments(&[id.as_str()])?,
            None => self.collection.clone(),
        };
        let mut request = HttpRequest::new(method, url)
            .with_timeout(self.timeout)?
            .with_header("Accept", "application/json")?;
        if let Some(token) = &self.auth_token {
            request = request.with_header("Authorization", format!("Bearer {}", token.expose_secret()))?;
        }
        Ok(request)
    }

    async fn send(
        &self,
        request: HttpRequest,
        id: Option<&ItemId>,
        version: Option<Version>,
    ) -> Result<HttpResponse, CollaboratorError> {
        let response = self.transport.execute(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            debug!(status = response.status(), "rest request rejected");
            Err(CollaboratorError::from_status(
                response.status(),
                response.error_message(),
                id,
                version,
            ))
        }
    }

    fn parse_item(response: &HttpResponse, id: Option<&ItemId>) -> Result<Item, CollaboratorError> {
        let mut item: Item = response.json()?;
        if item.id.is_none() {
            item.id = id.cloned();
        }
        if item.id.is_none() {
            return Err(CollaboratorError::Schema("todo without id".into()));
        }
        Ok(item)
    }
}

#[async_trait]
impl Collaborator for RestCollaborator {
    fn kind(&self) -> CollaboratorKind {
        CollaboratorKind::Rest
    }

    #[instrument(skip(self))]
    async fn fetch_all(&self) -> Result<Vec<Item>, CollaboratorError> {
        let request = self.request(HttpMethod::Get, None)?;
        let response = self.send(request, None, None).await?;
        let items = match response.json::<ListResponse>()? {
            ListResponse::Bare(items) | ListResponse::Envelope { items } => items,
        };
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn fetch_by_id(&self, id: &ItemId) -> Result<Option<Item>, CollaboratorError> {
        let request = self.request(HttpMethod::Get, Some(id))?;
        match self.send(request, Some(id), None).await {
            Ok(response) => Self::parse_item(&response, Some(id)).map(Some),
            Err(CollaboratorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, description))]
    async fn create(&self, name: &str, description: Option<&str>) -> Result<Item, CollaboratorError> {
        let request = self
            .request(HttpMethod::Post, None)?
            .with_json(&TodoInput { name, description })?;
        let response = self.send(request, None, None).await?;
        Self::parse_item(&response, None)
    }

    #[instrument(skip(self, name, description))]
    async fn update(
        &self,
        id: &ItemId,
        version: Option<Version>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Item, CollaboratorError> {
        let mut request = self
            .request(HttpMethod::Put, Some(id))?
            .with_json(&TodoInput { name, description })?;
        if let Some(version) = version {
            request = request.with_header("If-Match", format!("\"{}\"", version.0))?;
        }
        let response = self.send(request, Some(id), version).await?;
        Self::parse_item(&response, Some(id))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &ItemId, version: Option<Version>) -> Result<(), CollaboratorError> {
        let mut request = self.request(HttpMethod::Delete, Some(id))?;
        if let Some(version) = version {
            request = request.with_header("If-Match", format!("\"{}\"", version.0))?;
        }
        self.send(request, Some(id), version).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::http::testing::ScriptedTransport;
    use crate::capabilities::HttpError;

    fn collaborator(transport: &Arc<ScriptedTransport>) -> RestCollaborator {
        let endpoint = ValidatedUrl::new("https://api.example.com/dev").unwrap();
        RestCollaborator::new(transport.clone(), &endpoint, "todos").unwrap()
    }

    #[tokio::test]
    async fn test_fetch_all_accepts_both_shapes() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(200, r#"[{"id":"1","name":"A"}]"#)
            .respond(200, r#"{"items":[{"id":"1","name":"A"},{"id":"2","name":"B","description":"b"}]}"#);
        let rest = collaborator(&transport);

        assert_eq!(rest.fetch_all().await.unwrap().len(), 1);
        let items = rest.fetch_all().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].description.as_deref(), Some("b"));

        let requests = transport.requests();
        assert_eq!(requests[0].method(), HttpMethod::Get);
        assert_eq!(requests[0].url().as_str(), "https://api.example.com/dev/todos");
    }

    #[tokio::test]
    async fn test_fetch_by_id_maps_404_to_absent() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(404, r#"{"message":"not found"}"#);
        let rest = collaborator(&transport);

        let found = rest.fetch_by_id(&ItemId::new("42")).await.unwrap();
        assert!(found.is_none());
        assert_eq!(
            transport.requests()[0].url().as_str(),
            "https://api.example.com/dev/todos/42"
        );
    }

    #[tokio::test]
    async fn test_create_posts_json_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(201, r#"{"id":"7","name":"Buy milk"}"#);
        let rest = collaborator(&transport).with_auth_token(SecretString::new("tok".into()));

        let item = rest.create("Buy milk", None).await.unwrap();
        assert_eq!(item.id, Some(ItemId::new("7")));
        assert_eq!(item.version, None);

        let request = &transport.requests()[0];
        assert_eq!(request.method(), HttpMethod::Post);
        assert_eq!(request.headers().get("Authorization"), Some("Bearer tok"));
        assert_eq!(transport.body_json(0), serde_json::json!({"name": "Buy milk"}));
    }

    #[tokio::test]
    async fn test_update_fills_missing_id_and_maps_conflict() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(200, r#"{"name":"B","description":"d"}"#)
            .respond(412, "");
        let rest = collaborator(&transport);
        let id = ItemId::new("3");

        let item = rest.update(&id, None, "B", Some("d")).await.unwrap();
        assert_eq!(item.id, Some(id.clone()));
        assert!(transport.requests()[0].headers().get("If-Match").is_none());

        let result = rest.update(&id, Some(Version(2)), "C", None).await;
        assert_eq!(
            result,
            Err(CollaboratorError::Conflict {
                id,
                version: Some(Version(2))
            })
        );
        assert_eq!(transport.requests()[1].headers().get("If-Match"), Some("\"2\""));
    }

    #[tokio::test]
    async fn test_delete_errors() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(500, "boom").fail(HttpError::Timeout {
            timeout_ms: 30_000,
            request_id: "r1".into(),
        });
        let rest = collaborator(&transport);
        let id = ItemId::new("1");

        let err = rest.delete(&id, None).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected { status: Some(500), .. }));

        let err = rest.delete(&id, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_invalid_json_is_schema_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(200, "<html>");
        let rest = collaborator(&transport);
        let err = rest.fetch_all().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Serialization);
    }
}
