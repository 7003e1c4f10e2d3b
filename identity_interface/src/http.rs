//! HTTP client for the user-management service.

use async_trait::async_trait;
use cluster_shared_types::Result;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use state_store_interface::Filter;
use tracing::{debug, warn};

use crate::{Action, IdentityError, IdentityService, ResourceKind, UserInfo};

/// Header carrying the caller's token.
pub const TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct AuthorizeRequest<'a> {
    action: Action,
    resource_id: Option<&'a str>,
    resource_kind: ResourceKind,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    allowed: bool,
}

/// Visibility granted to a token for an action.
#[derive(Debug, Deserialize, Default)]
struct AuthScope {
    #[serde(default)]
    all: bool,
    user_id: Option<String>,
    tenant_id: Option<String>,
}

impl AuthScope {
    fn into_filter(self) -> Filter {
        if self.all {
            return Filter::All;
        }
        let mut filter = Filter::All;
        if let Some(tenant_id) = self.tenant_id {
            filter = filter.and(Filter::eq("tenant_id", tenant_id));
        }
        if let Some(user_id) = self.user_id {
            filter = filter.and(Filter::eq("user_id", user_id));
        }
        if filter == Filter::All {
            // a scope with no grants sees nothing
            filter = Filter::In("user_id".to_string(), Vec::new());
        }
        filter
    }
}

/// Identity service reached over HTTP.
pub struct HttpIdentityService {
    client: Client,
    base_url: String,
}

impl HttpIdentityService {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_token(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder.header(TOKEN_HEADER, token)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| IdentityError::Unreachable(e.to_string()))?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(IdentityError::InvalidToken.into())
            }
            s if !s.is_success() => {
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                warn!(status = %s, body = %text, "Identity service request failed");
                return Err(IdentityError::UnexpectedResponse(format!(
                    "status {}: {}",
                    s, text
                ))
                .into());
            }
            _ => {}
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| IdentityError::UnexpectedResponse(e.to_string()))?;
        match (envelope.success, envelope.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(IdentityError::UnexpectedResponse("missing data".to_string()).into()),
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn validate_token(&self, token: &str) -> Result<()> {
        let builder = self.with_token(self.client.get(self.url("/v1/token/validate")), token);
        let response = builder
            .send()
            .await
            .map_err(|e| IdentityError::Unreachable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            debug!(status = %response.status(), "Token rejected");
            Err(IdentityError::InvalidToken.into())
        }
    }

    async fn authorize(
        &self,
        action: Action,
        token: &str,
        resource_id: Option<&str>,
        kind: ResourceKind,
    ) -> Result<bool> {
        let body = AuthorizeRequest {
            action,
            resource_id,
            resource_kind: kind,
        };
        let builder = self.with_token(self.client.post(self.url("/v1/authorize")), token);
        let response: AuthorizeResponse = self.send(builder.json(&body)).await?;
        Ok(response.allowed)
    }

    async fn build_auth_filter(&self, action: Action, token: &str) -> Result<Filter> {
        let builder = self.with_token(
            self.client
                .get(self.url("/v1/authorize/scope"))
                .query(&[("action", action.as_str())]),
            token,
        );
        let scope: AuthScope = self.send(builder).await?;
        Ok(scope.into_filter())
    }

    async fn resolve_user(&self, user_id: &str, token: &str) -> Result<UserInfo> {
        let builder = self.with_token(
            self.client.get(self.url(&format!("/v1/user/{}", user_id))),
            token,
        );
        let response = builder
            .send()
            .await
            .map_err(|e| IdentityError::Unreachable(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(IdentityError::UserNotFound(user_id.to_string()).into());
        }
        self.handle_response(response).await
    }

    async fn token_owner(&self, token: &str) -> Result<UserInfo> {
        let builder = self.with_token(self.client.get(self.url("/v1/token/owner")), token);
        self.send(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let client = HttpIdentityService::new("http://usermgmt:10001/");
        assert_eq!(
            client.url("/v1/user/u1"),
            "http://usermgmt:10001/v1/user/u1"
        );
    }

    #[test]
    fn test_scope_to_filter() {
        let all = AuthScope {
            all: true,
            ..Default::default()
        };
        assert_eq!(all.into_filter(), Filter::All);

        let user = AuthScope {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert_eq!(user.into_filter(), Filter::eq("user_id", "u1"));

        let nothing = AuthScope::default().into_filter();
        assert!(!nothing.matches(&serde_json::json!({"user_id": "u1"})));
    }
}
