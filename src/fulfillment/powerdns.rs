use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_resolver::TokioAsyncResolver;
use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{Fulfillment, Outcome};
use crate::key::KeyAuthorization;
use crate::types::{Challenge, ChallengeType, Error};
use crate::{DefaultClient, HttpClient};

const API_KEY_HEADER: &str = "X-API-Key";
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TTL: u32 = 60;
const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(60);
const PROPAGATION_POLL_DELAY: Duration = Duration::from_secs(2);

/// `dns-01` fulfillment through the PowerDNS HTTP API
///
/// Publishes `_acme-challenge.<domain>` TXT records by PATCHing the zone's
/// rrsets, then waits for the record to become visible to a resolver before
/// letting the CA validate. Cleanup deletes the rrset.
pub struct PowerDnsFulfillment {
    http: Box<dyn HttpClient>,
    api_url: String,
    api_key: String,
    ttl: u32,
    propagation_timeout: Duration,
}

impl PowerDnsFulfillment {
    /// Talk to the PowerDNS API at `api_url` with the given key
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, Error> {
        Ok(Self::with_http(
            Box::new(DefaultClient::try_new_allowing_http()?),
            api_url,
            api_key,
        ))
    }

    /// Like [`PowerDnsFulfillment::new`], over a caller-supplied transport
    pub fn with_http(
        http: Box<dyn HttpClient>,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let mut api_url = api_url.into();
        while api_url.ends_with('/') {
            api_url.pop();
        }
        Self {
            http,
            api_url,
            api_key: api_key.into(),
            ttl: DEFAULT_TTL,
            propagation_timeout: PROPAGATION_TIMEOUT,
        }
    }

    /// Override the TTL of published TXT records (default 60 s)
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override how long to wait for the record to propagate (default 60 s)
    pub fn propagation_timeout(mut self, timeout: Duration) -> Self {
        self.propagation_timeout = timeout;
        self
    }

    fn record_name(domain: &str) -> String {
        format!("_acme-challenge.{domain}.")
    }

    async fn update_record(&self, domain: &str, rrset: Rrset) -> Result<(), Error> {
        let url = format!(
            "{api}/api/v1/servers/localhost/zones/{domain}",
            api = self.api_url,
        );
        let body = serde_json::to_vec(&RrsetUpdate { rrsets: [rrset] })?;
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::from(Bytes::from(body)))
            .map_err(|e| Error::Transport(Box::new(e)))?;

        let rsp = match timeout(CALL_TIMEOUT, self.http.request(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };

        match rsp.parts.status {
            StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::Fulfillment(
                format!("zone update for {domain} returned {status}").into(),
            )),
        }
    }

    /// Poll a resolver until the TXT record carries `value`
    async fn wait_for_propagation(&self, domain: &str, value: &str) -> Result<(), Error> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().map_err(|e| Error::Dns(e.to_string()))?;
        let name = Self::record_name(domain);

        let poll = async {
            loop {
                if let Ok(lookup) = resolver.txt_lookup(name.as_str()).await {
                    let found = lookup.iter().any(|txt| {
                        let joined: String = txt
                            .txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part))
                            .collect();
                        joined == value
                    });
                    if found {
                        return;
                    }
                }
                sleep(PROPAGATION_POLL_DELAY).await;
            }
        };

        match timeout(self.propagation_timeout, poll).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::Dns(format!("TXT record {name} did not propagate"))),
        }
    }
}

#[async_trait]
impl Fulfillment for PowerDnsFulfillment {
    fn preference(&self) -> &[ChallengeType] {
        &[ChallengeType::Dns01]
    }

    async fn fulfill_dns_01(
        &self,
        domain: &str,
        _challenge: &Challenge,
        key_auth: &KeyAuthorization,
    ) -> Outcome {
        let value = key_auth.dns_value();
        debug!(domain, "publishing TXT record");

        let rrset = Rrset {
            name: Self::record_name(domain),
            r#type: "TXT",
            ttl: Some(self.ttl),
            changetype: "REPLACE",
            records: vec![Record {
                // Zone content syntax wants the value quoted.
                content: format!("\"{value}\""),
                disabled: false,
            }],
        };
        if let Err(error) = self.update_record(domain, rrset).await {
            return Outcome::Failed(error.to_string());
        }

        match self.wait_for_propagation(domain, &value).await {
            Ok(()) => Outcome::Handled,
            Err(error) => {
                warn!(domain, %error, "TXT record not visible, failing challenge");
                Outcome::Failed(error.to_string())
            }
        }
    }

    async fn clear_dns_01(&self, domain: &str, _challenge: &Challenge) -> Result<(), Error> {
        debug!(domain, "deleting TXT record");
        let rrset = Rrset {
            name: Self::record_name(domain),
            r#type: "TXT",
            ttl: None,
            changetype: "DELETE",
            records: Vec::new(),
        };
        self.update_record(domain, rrset).await
    }
}

#[derive(Serialize)]
struct RrsetUpdate {
    rrsets: [Rrset; 1],
}

#[derive(Serialize)]
struct Rrset {
    name: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
    changetype: &'static str,
    records: Vec<Record>,
}

#[derive(Serialize)]
struct Record {
    content: String,
    disabled: bool,
}
