//! HTTP side of the protocol: the bootstrap `POST` and binding `PATCH`
//! calls against the page URL.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use url::Url;

use crate::error::BackendError;
use crate::protocol::{BindingMessage, Bootstrap, CallResponse, ClientFrame};

/// Server endpoints used outside the websocket.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch the page bootstrap.
    async fn bootstrap(&self) -> Result<Bootstrap, BackendError>;

    /// Perform a `call` binding and return the aspect patches it produced.
    async fn call(&self, message: &BindingMessage) -> Result<CallResponse, BackendError>;
}

/// [`Backend`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    page_url: Url,
}

impl HttpBackend {
    /// Talk to `page_url` with a default client.
    pub fn new(page_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), page_url)
    }

    /// Talk to `page_url` with an existing client.
    pub fn with_client(client: reqwest::Client, page_url: Url) -> Self {
        Self { client, page_url }
    }

    /// The page URL.
    pub fn page_url(&self) -> &Url {
        &self.page_url
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::Status(status.as_u16()));
    }
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn bootstrap(&self) -> Result<Bootstrap, BackendError> {
        let response = self
            .client
            .post(self.page_url.clone())
            .header(ACCEPT, "application/json")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let bootstrap: Bootstrap = decode(response).await?;
        tracing::debug!(url = %self.page_url, page = %bootstrap.page, "bootstrap fetched");
        Ok(bootstrap)
    }

    async fn call(&self, message: &BindingMessage) -> Result<CallResponse, BackendError> {
        let response = self
            .client
            .patch(self.page_url.clone())
            .header(ACCEPT, "application/json")
            .json(&ClientFrame::Binding(message.clone()))
            .send()
            .await?;
        let output: CallResponse = decode(response).await?;
        tracing::debug!(key = %message.key, identities = output.output.len(), "binding call answered");
        Ok(output)
    }
}
