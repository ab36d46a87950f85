use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

#[async_trait]
pub trait HangupClient: Send + Sync {
    async fn hangup(&self, call_id: &str) -> Result<()>;
}

/// Terminates a carrier call via an out-of-band REST call, grounded on the
/// Twilio `calls(sid).update(status="completed")` wire semantics but issued
/// as a plain authenticated HTTP request (no vendor SDK in the dependency
/// set) like the other C3 adapters.
#[derive(Clone)]
pub struct HttpHangupClient {
    client: Arc<Client>,
    base_url: String,
    account_id: String,
    auth_token: String,
}

impl HttpHangupClient {
    pub fn new(
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        HttpHangupClient {
            client: Arc::new(Client::new()),
            base_url: base_url.into(),
            account_id: account_id.into(),
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl HangupClient for HttpHangupClient {
    async fn hangup(&self, call_id: &str) -> Result<()> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.base_url, self.account_id, call_id
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_id, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .context("failed to send hangup request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("hangup request failed ({status}): {body}");
        }
        Ok(())
    }
}
