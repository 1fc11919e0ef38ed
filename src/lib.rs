//! Async ACME (RFC 8555) client with pluggable challenge fulfillment.
//!
//! A caller supplies a domain and a CSR; the crate drives directory
//! discovery, account binding, the order/authorization/challenge/finalize
//! sequence against any conforming CA (Let's Encrypt, ZeroSSL, Google Public
//! CA, ...) and returns the issued PEM chain. How challenges are answered is
//! decided by a [`Fulfillment`] implementation: built-in variants write
//! `http-01` tokens to a web root, upload them over WebDAV, or publish
//! `dns-01` TXT records through the PowerDNS API.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use acme_drive::{build_csr, AcmeClient, DomainKey, LetsEncrypt, WebrootFulfillment};
//!
//! # async fn issue() -> Result<(), acme_drive::Error> {
//! let mut client = AcmeClient::builder(LetsEncrypt::Staging.url())
//!     .fulfillment(Arc::new(WebrootFulfillment::new("/var/www/acme-challenge")))
//!     .build()?;
//! client.new_account(&["admin@example.com"], None).await?;
//!
//! let key = DomainKey::generate()?;
//! let csr = build_csr("example.com", &key)?;
//! let chain_pem = client.sign("example.com", csr.pem().as_bytes()).await?;
//! # Ok(()) }
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION, USER_AGENT};
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

mod cert;
mod client;
mod fulfillment;
mod key;
mod state;
mod types;

pub use cert::{build_csr, build_self_signed, Csr, DomainKey};
pub use client::{AcmeClient, AcmeClientBuilder};
pub use fulfillment::{
    DavFulfillment, Fulfillment, Outcome, PowerDnsFulfillment, WebrootFulfillment,
};
pub use key::{AccountKey, ExternalAccountKey, Jwk, KeyAuthorization};
pub use state::{ClientState, RsaKeyState};
pub use types::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, ChallengeType, Directory,
    DirectoryMeta, Error, Identifier, LetsEncrypt, OrderState, OrderStatus, Problem, ProblemKind,
    GOOGLE_PUBLIC_CA_DIRECTORY, ZERO_SSL_DIRECTORY,
};

use types::{JoseJson, Signer};

/// Transport abstraction for HTTP requests
///
/// The built-in implementation is [`DefaultClient`]; bring your own to route
/// requests through a proxy, add instrumentation, or (as this crate's own
/// test suite does) substitute a scripted CA.
pub trait HttpClient: Send + Sync + 'static {
    /// Send the given request and return the response with its body collected
    fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, Error>> + Send>>;
}

/// An HTTP response with all body bytes collected
pub struct BytesResponse {
    /// Response status, headers and extensions
    pub parts: http::response::Parts,
    /// The collected body
    pub body: Bytes,
}

impl From<Response<Bytes>> for BytesResponse {
    fn from(rsp: Response<Bytes>) -> Self {
        let (parts, body) = rsp.into_parts();
        Self { parts, body }
    }
}

/// Default HTTP client based on hyper with rustls
///
/// Speaks HTTP/1.1 and HTTP/2 over TLS with native roots; ACME endpoints are
/// HTTPS-only.
pub struct DefaultClient(HyperClient<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>);

impl DefaultClient {
    /// Create a client that only accepts `https` URLs
    pub fn try_new() -> Result<Self, Error> {
        Self::build(true)
    }

    /// Create a client that also accepts plain `http` URLs
    ///
    /// Challenge provisioning endpoints (WebDAV upload, DNS provider APIs on
    /// a LAN) are commonly plain HTTP, unlike the CA itself.
    pub(crate) fn try_new_allowing_http() -> Result<Self, Error> {
        Self::build(false)
    }

    fn build(https_only: bool) -> Result<Self, Error> {
        let builder = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| Error::Transport(Box::new(e)))?;
        let https = match https_only {
            true => builder.https_only(),
            false => builder.https_or_http(),
        }
        .enable_http1()
        .enable_http2()
        .build();

        Ok(Self(
            HyperClient::builder(TokioExecutor::new()).build(https),
        ))
    }
}

impl HttpClient for DefaultClient {
    fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, Error>> + Send>> {
        let fut = self.0.request(req);
        Box::pin(async move {
            let rsp = fut.await.map_err(|e| Error::Transport(Box::new(e)))?;
            let (parts, body) = rsp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| Error::Transport(Box::new(e)))?
                .to_bytes();
            Ok(BytesResponse { parts, body })
        })
    }
}

/// One ACME session: transport, memoized directory, single-slot nonce pool
pub(crate) struct Client {
    http: Box<dyn HttpClient>,
    directory_url: String,
    directory: Mutex<Option<Directory>>,
    nonce: Mutex<Option<String>>,
}

impl Client {
    pub(crate) fn new(directory_url: String, http: Box<dyn HttpClient>) -> Self {
        Self {
            http,
            directory_url,
            directory: Mutex::new(None),
            nonce: Mutex::new(None),
        }
    }

    pub(crate) fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// Fetch the directory on first use, then return the memoized copy
    pub(crate) async fn directory(&self) -> Result<Directory, Error> {
        let mut cached = self.directory.lock().await;
        if let Some(directory) = &*cached {
            return Ok(directory.clone());
        }

        debug!(url = %self.directory_url, "fetching ACME directory");
        let rsp = self
            .request(
                Method::GET,
                &self.directory_url,
                Bytes::new(),
                Some("application/json"),
            )
            .await?;
        let directory: Directory = serde_json::from_slice(&Problem::from_response(rsp)?)?;
        *cached = Some(directory.clone());
        Ok(directory)
    }

    /// Send a signed POST, refreshing the nonce pool from the response
    ///
    /// Transient failures (connect errors, 5xx) are retried with backoff;
    /// a `badNonce` rejection is retried exactly once with a fresh nonce.
    pub(crate) async fn post(
        &self,
        payload: Option<&impl Serialize>,
        signer: &(impl Signer + ?Sized),
        url: &str,
    ) -> Result<BytesResponse, Error> {
        let mut transient_attempts = 0;
        let mut nonce_retried = false;
        let mut delay = TRANSIENT_DELAY;

        loop {
            match self.post_once(payload, signer, url).await {
                Err(Error::Transport(error)) if transient_attempts < TRANSIENT_RETRIES => {
                    transient_attempts += 1;
                    warn!(%error, url, attempt = transient_attempts, "retrying after connection error");
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
                Ok(rsp) if rsp.parts.status.is_server_error() => {
                    if transient_attempts >= TRANSIENT_RETRIES {
                        return Ok(rsp);
                    }
                    transient_attempts += 1;
                    warn!(status = %rsp.parts.status, url, attempt = transient_attempts, "retrying after server error");
                    sleep(delay).await;
                    delay *= 2;
                }
                Ok(rsp) if rsp.parts.status.is_client_error() => {
                    let bad_nonce = serde_json::from_slice::<Problem>(&rsp.body)
                        .map(|problem| problem.kind() == ProblemKind::BadNonce)
                        .unwrap_or(false);
                    // The rejection itself carries a usable Replay-Nonce,
                    // already stored by post_once.
                    if bad_nonce && !nonce_retried {
                        nonce_retried = true;
                        warn!(url, "server rejected nonce, retrying once");
                        continue;
                    }
                    return Ok(rsp);
                }
                Ok(rsp) => return Ok(rsp),
            }
        }
    }

    async fn post_once(
        &self,
        payload: Option<&impl Serialize>,
        signer: &(impl Signer + ?Sized),
        url: &str,
    ) -> Result<BytesResponse, Error> {
        let nonce = self.nonce().await?;
        let body = JoseJson::new(payload, signer.header(Some(&nonce), url), signer)?;
        let rsp = self
            .request(
                Method::POST,
                url,
                serde_json::to_vec(&body)?.into(),
                Some(JOSE_JSON),
            )
            .await?;
        self.remember_nonce(&rsp).await;
        Ok(rsp)
    }

    /// Take the pooled nonce, or fetch one from the `newNonce` endpoint
    async fn nonce(&self) -> Result<String, Error> {
        if let Some(nonce) = self.nonce.lock().await.take() {
            return Ok(nonce);
        }

        let directory = self.directory().await?;
        debug!(url = %directory.new_nonce, "fetching new nonce");
        let rsp = match self
            .request(Method::HEAD, &directory.new_nonce, Bytes::new(), None)
            .await
        {
            Ok(rsp) if nonce_from_response(&rsp).is_some() => rsp,
            // Some servers answer HEAD poorly; RFC 8555 allows GET here.
            _ => {
                self.request(Method::GET, &directory.new_nonce, Bytes::new(), None)
                    .await?
            }
        };

        nonce_from_response(&rsp).ok_or(Error::Str("no nonce found"))
    }

    async fn remember_nonce(&self, rsp: &BytesResponse) {
        if let Some(nonce) = nonce_from_response(rsp) {
            *self.nonce.lock().await = Some(nonce);
        }
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<BytesResponse, Error> {
        let mut builder = Request::builder()
            .method(method)
            .uri(url)
            .header(USER_AGENT, CRATE_USER_AGENT);
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        let request = builder
            .body(Full::from(body))
            .map_err(|e| Error::Transport(Box::new(e)))?;

        match timeout(REQUEST_TIMEOUT, self.http.request(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

pub(crate) fn nonce_from_response(rsp: &BytesResponse) -> Option<String> {
    rsp.parts
        .headers
        .get(REPLAY_NONCE)
        .and_then(|hv| String::from_utf8(hv.as_ref().to_vec()).ok())
}

pub(crate) fn location_from_response(rsp: &BytesResponse) -> Option<String> {
    rsp.parts
        .headers
        .get(LOCATION)
        .and_then(|hv| hv.to_str().ok())
        .map(|s| s.to_owned())
}

const JOSE_JSON: &str = "application/jose+json";
const REPLAY_NONCE: &str = "Replay-Nonce";
const CRATE_USER_AGENT: &str = concat!("acme-drive/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(40);
const TRANSIENT_RETRIES: usize = 3;
const TRANSIENT_DELAY: Duration = Duration::from_millis(500);
