use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::http::{HttpMethod, HttpRequest, HttpTransport, ValidatedUrl};
use super::{Collaborator, CollaboratorError, CollaboratorKind};
use crate::model::{Item, ItemId, Version};
use crate::{DEFAULT_HTTP_TIMEOUT, GRAPHQL_PAGE_LIMIT, MAX_GRAPHQL_PAGES};

const TODO_FIELDS: &str = "id name description _version _deleted";

const LIST_TODOS: &str = "query ListTodos($limit: Int, $nextToken: String) {
  listTodos(limit: $limit, nextToken: $nextToken) {
    items { id name description _version _deleted }
    nextToken
  }
}";

/// Error types the conflict resolver reports for a stale `_version`.
const CONFLICT_ERROR_TYPES: [&str; 2] = ["ConflictUnhandled", "ConditionalCheckFailedException"];

/// Todo as the sync-enabled schema returns it.
#[derive(Debug, Deserialize)]
struct TodoRecord {
    id: ItemId,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "_version", default)]
    version: Option<u64>,
    #[serde(rename = "_deleted", default)]
    deleted: Option<bool>,
}

impl TodoRecord {
    fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }

    fn into_item(self) -> Item {
        Item {
            id: Some(self.id),
            name: self.name,
            description: self.description,
            version: self.version.map(Version),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodoPage {
    items: Vec<TodoRecord>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlError {
    message: String,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Value,
}

/// Todo API behind an AppSync-style GraphQL endpoint with conflict detection.
///
/// Deletes are soft on the server side: records come back with `_deleted`
/// set and are filtered out here.
pub struct GraphQlCollaborator {
    transport: Arc<dyn HttpTransport>,
    endpoint: ValidatedUrl,
    api_key: SecretString,
    timeout: Duration,
}

impl GraphQlCollaborator {
    pub fn new(transport: Arc<dyn HttpTransport>, endpoint: ValidatedUrl, api_key: SecretString) -> Self {
        Self {
            transport,
            endpoint,
            api_key,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one operation and extracts `data.{field}`.
    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        field: &str,
        target: Option<(&ItemId, Option<Version>)>,
    ) -> Result<T, CollaboratorError> {
        let request = HttpRequest::new(HttpMethod::Post, self.endpoint.clone())
            .with_timeout(self.timeout)?
            .with_header("x-api-key", self.api_key.expose_secret().as_str())?
            .with_header("Accept", "application/json")?
            .with_json(&GraphQlRequest { query, variables })?;

        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(CollaboratorError::from_status(
                response.status(),
                response.error_message(),
                target.map(|(id, _)| id),
                target.and_then(|(_, version)| version),
            ));
        }

        let body: GraphQlResponse = response.json()?;
        if let Some(error) = body.errors.first() {
            return Err(Self::map_error(error, target));
        }

        let value = body
            .data
            .and_then(|mut data| data.get_mut(field).map(Value::take))
            .ok_or_else(|| CollaboratorError::Schema(format!("missing data.{field}")))?;
        Ok(serde_json::from_value(value)?)
    }

    fn map_error(error: &GraphQlError, target: Option<(&ItemId, Option<Version>)>) -> CollaboratorError {
        let error_type = error.error_type.as_deref().unwrap_or_default();
        debug!(error_type, message = %error.message, "graphql error");

        match target {
            Some((id, version)) if CONFLICT_ERROR_TYPES.contains(&error_type) => CollaboratorError::Conflict {
                id: id.clone(),
                version,
            },
            _ if error_type.starts_with("Unauthorized") => CollaboratorError::Unauthorized(error.message.clone()),
            _ => CollaboratorError::Rejected {
                status: None,
                message: error.message.clone(),
            },
        }
    }

    fn mutation(name: &str, input_type: &str) -> String {
        let field = lower_first(name);
        format!("mutation {name}($input: {input_type}!) {{\n  {field}(input: $input) {{ {TODO_FIELDS} }}\n}}")
    }
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl Collaborator for GraphQlCollaborator {
    fn kind(&self) -> CollaboratorKind {
        CollaboratorKind::GraphQl
    }

    #[instrument(skip(self))]
    async fn fetch_all(&self) -> Result<Vec<Item>, CollaboratorError> {
        let mut items = Vec::new();
        let mut next_token: Option<String> = None;

        for page in 0..MAX_GRAPHQL_PAGES {
            let variables = json!({ "limit": GRAPHQL_PAGE_LIMIT, "nextToken": next_token });
            let result: TodoPage = self.execute(LIST_TODOS, variables, "listTodos", None).await?;
            items.extend(
                result
                    .items
                    .into_iter()
                    .filter(|record| !record.is_deleted())
                    .map(TodoRecord::into_item),
            );
            debug!(page, total = items.len(), "fetched todo page");

            next_token = result.next_token;
            if next_token.is_none() {
                return Ok(items);
            }
        }

        warn!(pages = MAX_GRAPHQL_PAGES, "listTodos page limit reached, result truncated");
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn fetch_by_id(&self, id: &ItemId) -> Result<Option<Item>, CollaboratorError> {
        let query = format!("query GetTodo($id: ID!) {{\n  getTodo(id: $id) {{ {TODO_FIELDS} }}\n}}");
        let record: Option<TodoRecord> = self
            .execute(&query, json!({ "id": id }), "getTodo", None)
            .await?;
        Ok(record.filter(|r| !r.is_deleted()).map(TodoRecord::into_item))
    }

    #[instrument(skip(self, description))]
    async fn create(&self, name: &str, description: Option<&str>) -> Result<Item, CollaboratorError> {
        let query = Self::mutation("CreateTodo", "CreateTodoInput");
        let input = json!({ "input": { "name": name, "description": description } });
        let record: TodoRecord = self.execute(&query, input, "createTodo", None).await?;
        Ok(record.into_item())
    }

    #[instrument(skip(self, name, description))]
    async fn update(
        &self,
        id: &ItemId,
        version: Option<Version>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Item, CollaboratorError> {
        let query = Self::mutation("UpdateTodo", "UpdateTodoInput");
        let input = json!({ "input": {
            "id": id,
            "_version": version,
            "name": name,
            "description": description,
        }});
        let record: TodoRecord = self
            .execute(&query, input, "updateTodo", Some((id, version)))
            .await?;
        Ok(record.into_item())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &ItemId, version: Option<Version>) -> Result<(), CollaboratorError> {
        let query = Self::mutation("DeleteTodo", "DeleteTodoInput");
        let input = json!({ "input": { "id": id, "_version": version } });
        let _: TodoRecord = self
            .execute(&query, input, "deleteTodo", Some((id, version)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::http::testing::ScriptedTransport;

    fn collaborator(transport: &Arc<ScriptedTransport>) -> GraphQlCollaborator {
        GraphQlCollaborator::new(
            transport.clone(),
            ValidatedUrl::new("https://abc.appsync-api.eu-west-1.amazonaws.com/graphql").unwrap(),
            SecretString::new("da2-key".into()),
        )
    }

    #[tokio::test]
    async fn test_list_follows_pages_and_drops_deleted() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(
                200,
                r#"{"data":{"listTodos":{"items":[
                    {"id":"1","name":"A","description":null,"_version":1,"_deleted":null},
                    {"id":"2","name":"B","_version":3,"_deleted":true}
                ],"nextToken":"page2"}}}"#,
            )
            .respond(
                200,
                r#"{"data":{"listTodos":{"items":[{"id":"3","name":"C","_version":2}],"nextToken":null}}}"#,
            );
        let graphql = collaborator(&transport);

        let items = graphql.fetch_all().await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.clone().unwrap()).collect();
        assert_eq!(ids, vec![ItemId::new("1"), ItemId::new("3")]);
        assert_eq!(items[1].version, Some(Version(2)));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].headers().get("x-api-key"), Some("da2-key"));
        assert_eq!(transport.body_json(0)["variables"]["nextToken"], Value::Null);
        assert_eq!(transport.body_json(1)["variables"]["nextToken"], "page2");
    }

    #[tokio::test]
    async fn test_get_deleted_is_absent() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(200, r#"{"data":{"getTodo":{"id":"1","name":"A","_version":4,"_deleted":true}}}"#)
            .respond(200, r#"{"data":{"getTodo":null}}"#);
        let graphql = collaborator(&transport);
        let id = ItemId::new("1");

        assert!(graphql.fetch_by_id(&id).await.unwrap().is_none());
        assert!(graphql.fetch_by_id(&id).await.unwrap().is_none());
        assert_eq!(transport.body_json(0)["variables"]["id"], "1");
    }

    #[tokio::test]
    async fn test_update_sends_version() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            200,
            r#"{"data":{"updateTodo":{"id":"1","name":"B","description":"d","_version":5}}}"#,
        );
        let graphql = collaborator(&transport);

        let item = graphql
            .update(&ItemId::new("1"), Some(Version(4)), "B", Some("d"))
            .await
            .unwrap();
        assert_eq!(item.version, Some(Version(5)));

        let body = transport.body_json(0);
        assert!(body["query"].as_str().unwrap().contains("updateTodo(input: $input)"));
        assert_eq!(body["variables"]["input"]["_version"], 4);
        assert_eq!(body["variables"]["input"]["name"], "B");
    }

    #[tokio::test]
    async fn test_conflict_error_type() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(
                200,
                r#"{"data":{"deleteTodo":null},"errors":[{"message":"Conflict resolver rejects mutation.","errorType":"ConflictUnhandled"}]}"#,
            )
            .respond(200, r#"{"errors":[{"message":"bad input","errorType":"ValidationError"}]}"#);
        let graphql = collaborator(&transport);
        let id = ItemId::new("1");

        let err = graphql.delete(&id, Some(Version(1))).await.unwrap_err();
        assert_eq!(
            err,
            CollaboratorError::Conflict {
                id: id.clone(),
                version: Some(Version(1))
            }
        );

        let err = graphql.delete(&id, Some(Version(1))).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected { status: None, .. }));
    }

    #[tokio::test]
    async fn test_create_and_http_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(200, r#"{"data":{"createTodo":{"id":"9","name":"Buy milk","_version":1}}}"#)
            .respond(401, r#"{"message":"invalid key"}"#);
        let graphql = collaborator(&transport);

        let item = graphql.create("Buy milk", None).await.unwrap();
        assert_eq!(item.id, Some(ItemId::new("9")));
        assert_eq!(item.version, Some(Version::INITIAL));
        assert_eq!(transport.body_json(0)["variables"]["input"]["description"], Value::Null);

        let err = graphql.create("x", None).await.unwrap_err();
        assert_eq!(err, CollaboratorError::Unauthorized("invalid key".into()));
    }

    #[tokio::test]
    async fn test_missing_data_is_schema_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(200, r#"{"data":{}}"#);
        let graphql = collaborator(&transport);
        let err = graphql.fetch_all().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Schema(_)));
    }

    #[test]
    fn test_mutation_text() {
        let text = GraphQlCollaborator::mutation("CreateTodo", "CreateTodoInput");
        assert!(text.starts_with("mutation CreateTodo($input: CreateTodoInput!)"));
        assert!(text.contains("createTodo(input: $input) { id name description _version _deleted }"));
    }
}
