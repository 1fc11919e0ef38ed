use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{Fulfillment, Outcome};
use crate::key::KeyAuthorization;
use crate::types::{Challenge, ChallengeType, Error};
use crate::{DefaultClient, HttpClient};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// `http-01` fulfillment over WebDAV
///
/// Uploads the key authorization with an HTTP `PUT` to
/// `http://<domain>/.well-known/acme-challenge/<token>` using Basic
/// authentication; cleanup sends `DELETE`. Works against WebDAV modules as
/// well as custom upload scripts honoring the same verbs.
pub struct DavFulfillment {
    http: Box<dyn HttpClient>,
    username: String,
    password: String,
}

impl DavFulfillment {
    /// Upload with the given credentials over the built-in HTTP client
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self, Error> {
        // Challenge hosts are frequently plain HTTP, so no https_only here.
        Ok(Self::with_http(
            Box::new(DefaultClient::try_new_allowing_http()?),
            username,
            password,
        ))
    }

    /// Upload with the given credentials over a caller-supplied transport
    pub fn with_http(
        http: Box<dyn HttpClient>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http,
            username: username.into(),
            password: password.into(),
        }
    }

    fn challenge_url(domain: &str, challenge: &Challenge) -> String {
        format!(
            "http://{domain}/.well-known/acme-challenge/{token}",
            token = challenge.token,
        )
    }

    fn basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }

    /// Issue one DAV call, retrying server errors with a short backoff
    async fn send(&self, method: Method, url: &str, body: Option<&str>) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            let request = Request::builder()
                .method(method.clone())
                .uri(url)
                .header(AUTHORIZATION, self.basic_auth())
                .body(Full::from(Bytes::from(
                    body.map(str::as_bytes).unwrap_or_default().to_vec(),
                )))
                .map_err(|e| Error::Transport(Box::new(e)))?;

            let rsp = match timeout(CALL_TIMEOUT, self.http.request(request)).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout),
            };

            let status = rsp.parts.status;
            if status.is_server_error() && attempt < RETRIES {
                attempt += 1;
                warn!(%status, url, attempt, "challenge host errored, retrying");
                sleep(RETRY_DELAY).await;
                continue;
            }
            if status.as_u16() > 299 {
                return Err(Error::Fulfillment(
                    format!("challenge upload to {url} returned {status}").into(),
                ));
            }
            return Ok(());
        }
    }
}

#[async_trait]
impl Fulfillment for DavFulfillment {
    fn preference(&self) -> &[ChallengeType] {
        &[ChallengeType::Http01]
    }

    async fn fulfill_http_01(
        &self,
        domain: &str,
        challenge: &Challenge,
        key_auth: &KeyAuthorization,
    ) -> Outcome {
        let url = Self::challenge_url(domain, challenge);
        debug!(%url, "uploading challenge token");
        match self.send(Method::PUT, &url, Some(key_auth.as_str())).await {
            Ok(()) => Outcome::Handled,
            Err(error) => Outcome::Failed(error.to_string()),
        }
    }

    async fn clear_http_01(&self, domain: &str, challenge: &Challenge) -> Result<(), Error> {
        let url = Self::challenge_url(domain, challenge);
        debug!(%url, "deleting challenge token");
        match self.send(Method::DELETE, &url, None).await {
            Ok(()) => Ok(()),
            // Token already gone is as clean as it gets.
            Err(Error::Fulfillment(msg)) if msg.contains(StatusCode::NOT_FOUND.as_str()) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
