//! HTTP remote authority
//!
//! JSON over HTTP. Entities travel as plain field maps (`id` plus record
//! fields), the same shape `Entity::to_fields` produces.
//!
//! - `GET    {base}/workspaces/{workspace}/datasets/{dataset}/{plural}`
//! - `PUT    {base}/workspaces/{workspace}/datasets/{dataset}/{plural}/{id}`
//! - `DELETE {base}/workspaces/{workspace}/datasets/{dataset}/{plural}/{id}`

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use tracing::debug;

use super::remote::{PushRequest, RemoteAuthority, RemoteError};
use crate::config::SyncContext;
use crate::models::{Collection, Entity, OpKind};

/// Header carrying the client's remote identity
const IDENTITY_HEADER: &str = "x-lorekeep-identity";

pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lorekeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, ctx: &SyncContext, collection: Collection) -> String {
        format!(
            "{}/workspaces/{}/datasets/{}/{}",
            self.base_url,
            ctx.workspace_id,
            ctx.dataset_id,
            collection.plural()
        )
    }

    fn with_identity(&self, ctx: &SyncContext, builder: RequestBuilder) -> RequestBuilder {
        builder.header(IDENTITY_HEADER, &ctx.remote_identity)
    }
}

impl RemoteAuthority for HttpRemote {
    async fn pull(&self, ctx: &SyncContext, collection: Collection) -> Result<Vec<Entity>, RemoteError> {
        let url = self.collection_url(ctx, collection);
        debug!(%url, "Pulling collection");

        let response = self
            .with_identity(ctx, self.client.get(&url))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, OpKind::Update, &body));
        }

        let rows: Vec<Map<String, Value>> = response
            .json()
            .await
            .map_err(|e| RemoteError::permanent(format!("invalid {} listing: {}", collection, e)))?;

        rows.into_iter()
            .map(|fields| {
                Entity::from_fields(collection, fields)
                    .map_err(|e| RemoteError::permanent(format!("remote sent {}", e)))
            })
            .collect()
    }

    async fn push_one(&self, ctx: &SyncContext, request: &PushRequest) -> Result<(), RemoteError> {
        let url = format!(
            "{}/{}",
            self.collection_url(ctx, request.collection),
            request.id
        );

        let builder = match (request.op, &request.payload) {
            (OpKind::Delete, _) => self.client.delete(&url),
            (_, Some(entity)) => self.client.put(&url).json(&entity.to_fields()),
            (op, None) => {
                return Err(RemoteError::permanent(format!("{} without payload", op)));
            }
        };

        let response = self
            .with_identity(ctx, builder)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, request.op, &body))
    }
}

/// Failures before a response arrived
fn classify_transport(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        RemoteError::transient(error.to_string())
    } else {
        RemoteError::permanent(error.to_string())
    }
}

/// Non-success responses
fn classify_status(status: StatusCode, op: OpKind, body: &str) -> RemoteError {
    let message = if body.is_empty() {
        format!("{} {}", op, status)
    } else {
        format!("{} {}: {}", op, status, body)
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::transient(message)
    } else {
        // 404 on delete: the entity already vanished remotely
        RemoteError::permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, OpKind::Update, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, OpKind::Add, "").is_transient());
    }

    #[test]
    fn test_client_errors_are_permanent() {
        let err = classify_status(StatusCode::NOT_FOUND, OpKind::Delete, "gone");
        assert!(!err.is_transient());
        assert!(err.message.contains("gone"));
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, OpKind::Add, "").is_transient());
    }

    #[test]
    fn test_collection_url() {
        let remote = HttpRemote::new("https://lore.example.com/api/", Duration::from_secs(5)).unwrap();
        let ctx = SyncContext {
            remote_identity: "desk".to_string(),
            workspace_id: "atlas".to_string(),
            dataset_id: "main".to_string(),
        };
        assert_eq!(
            remote.collection_url(&ctx, Collection::Person),
            "https://lore.example.com/api/workspaces/atlas/datasets/main/people"
        );
    }
}
