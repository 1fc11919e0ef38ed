use std::borrow::Cow;
use std::fmt;

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::Jwk;
use crate::BytesResponse;

/// Error type for acme-drive
#[derive(Debug, Error)]
pub enum Error {
    /// The CA answered with a problem document (RFC 7807, as profiled by
    /// RFC 8555)
    #[error("API error: {0}")]
    Api(#[from] Problem),
    /// An authorization finalized in a state other than `valid`
    ///
    /// Carries the challenge-level problem document when the server provided one.
    #[error("authorization failed: {0:?}")]
    Authorization(Option<Problem>),
    /// Base64url data from the server or a stored state did not decode
    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Key generation, parsing, signing or CSR construction failed
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    /// DNS resolution failed while verifying a dns-01 record
    #[error("DNS lookup failure: {0}")]
    Dns(String),
    /// No fulfillment handler accepted a challenge, or a handler failed
    #[error("challenge fulfillment failed: {0}")]
    Fulfillment(Cow<'static, str>),
    /// A directory, account or challenge URL did not parse
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// A wire document or state file failed JSON (de)serialization
    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The client is bound to an account but the operation requires an unbound client
    #[error("client is already bound to an account")]
    AlreadyRegistered,
    /// The operation requires an account but the client is not bound to one
    #[error("client is not bound to an account")]
    NotRegistered,
    /// An order finalized as `invalid`
    #[error("order failed: {0:?}")]
    OrderFailed(Option<Problem>),
    /// A polling loop or network request ran out of time
    #[error("operation timed out")]
    Timeout,
    /// The HTTP client failed before a response was read
    #[error("HTTP request failure: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Anything that only needs a static description
    #[error("missing data: {0}")]
    Str(&'static str),
}

impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Error::Str(s)
    }
}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<rsa::signature::Error> for Error {
    fn from(e: rsa::signature::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

/// Problem document (RFC 7807) carried by ACME error responses
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    /// Error urn, usually under `urn:ietf:params:acme:error:`
    ///
    /// See <https://datatracker.ietf.org/doc/html/rfc8555#section-6.7>
    pub r#type: Option<String>,
    /// Prose explanation meant for operators
    pub detail: Option<String>,
    /// HTTP status code the problem was delivered with
    pub status: Option<u16>,
}

impl Problem {
    /// The well-known ACME error category for this problem
    pub fn kind(&self) -> ProblemKind {
        let urn = match &self.r#type {
            Some(urn) => urn.as_str(),
            None => return ProblemKind::Other,
        };

        match urn.strip_prefix("urn:ietf:params:acme:error:") {
            Some("accountDoesNotExist") => ProblemKind::AccountDoesNotExist,
            Some("badCSR") => ProblemKind::BadCsr,
            Some("badNonce") => ProblemKind::BadNonce,
            Some("connection") => ProblemKind::Connection,
            Some("dns") => ProblemKind::Dns,
            Some("externalAccountRequired") => ProblemKind::ExternalAccountRequired,
            Some("incorrectResponse") => ProblemKind::IncorrectResponse,
            Some("malformed") => ProblemKind::Malformed,
            Some("orderNotReady") => ProblemKind::OrderNotReady,
            Some("rateLimited") => ProblemKind::RateLimited,
            Some("rejectedIdentifier") => ProblemKind::RejectedIdentifier,
            Some("serverInternal") => ProblemKind::ServerInternal,
            Some("unauthorized") => ProblemKind::Unauthorized,
            Some("unsupportedContact") => ProblemKind::UnsupportedContact,
            Some("userActionRequired") => ProblemKind::UserActionRequired,
            _ => ProblemKind::Other,
        }
    }

    pub(crate) fn check<T: DeserializeOwned>(rsp: BytesResponse) -> Result<T, Error> {
        Ok(serde_json::from_slice(&Self::from_response(rsp)?)?)
    }

    pub(crate) fn from_response(rsp: BytesResponse) -> Result<bytes::Bytes, Error> {
        let status = rsp.parts.status;
        if status.is_informational() || status.is_success() || status.is_redirection() {
            return Ok(rsp.body);
        }

        Err(serde_json::from_slice::<Problem>(&rsp.body)?.into())
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("API error")?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(r#type) = &self.r#type {
            write!(f, " ({type})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Problem {}

/// Well-known ACME error categories from `urn:ietf:params:acme:error:*`
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProblemKind {
    AccountDoesNotExist,
    BadCsr,
    BadNonce,
    Connection,
    Dns,
    ExternalAccountRequired,
    IncorrectResponse,
    Malformed,
    OrderNotReady,
    RateLimited,
    RejectedIdentifier,
    ServerInternal,
    Unauthorized,
    UnsupportedContact,
    UserActionRequired,
    /// Any urn this client has no special handling for
    Other,
}

/// An ACME directory as described in RFC 8555 (section 7.1.1)
///
/// Fetched lazily once per client lifetime and memoized. The three operations
/// every conforming server must offer are required fields, the rest is
/// optional.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// Endpoint to fetch a fresh replay nonce from
    pub new_nonce: String,
    /// Endpoint for account creation
    pub new_account: String,
    /// Endpoint for order creation
    pub new_order: String,
    /// Endpoint for certificate revocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_cert: Option<String>,
    /// Endpoint for account key rollover
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,
    /// Server metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

impl Directory {
    /// Whether this server requires external account binding for new accounts
    pub fn external_account_required(&self) -> bool {
        self.meta
            .as_ref()
            .and_then(|meta| meta.external_account_required)
            .unwrap_or(false)
    }
}

/// The `meta` block of an ACME directory (RFC 8555 section 9.7.6)
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    /// URL of the server's terms of service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    /// Whether `newAccount` requests must carry an external account binding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_required: Option<bool>,
}

/// One way of proving control over an identifier (RFC 8555 section 7.1.5)
///
/// <https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.5>
#[derive(Clone, Debug, Deserialize)]
pub struct Challenge {
    /// Validation method this challenge uses
    pub r#type: ChallengeType,
    /// Where the readiness POST for this challenge goes
    pub url: String,
    /// Random token the response is derived from
    #[serde(default)]
    pub token: String,
    /// Where validation currently stands
    pub status: ChallengeStatus,
    /// Set by the server when validation failed
    pub error: Option<Problem>,
}

/// Server-side view of an order (RFC 8555 section 7.1.3)
///
/// <https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3>
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderState {
    /// Where the order sits in its lifecycle
    pub status: OrderStatus,
    /// One authorization URL per identifier in the order
    pub authorizations: Vec<String>,
    /// Set by the server when the order failed
    pub error: Option<Problem>,
    /// Where the CSR goes once every authorization is valid
    pub finalize: String,
    /// Download URL, populated once the order reaches `valid`
    pub certificate: Option<String>,
}

/// Proof-of-control state for one identifier (RFC 8555 section 7.1.4)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// Identifier this authorization vouches for
    pub identifier: Identifier,
    /// Where validation of the identifier stands
    pub status: AuthorizationStatus,
    /// Challenges the server will accept; completing one suffices
    pub challenges: Vec<Challenge>,
}

/// Lifecycle states of an [`Authorization`]
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Revoked,
    Expired,
}

/// Subject of an order; only DNS names are supported
#[allow(missing_docs)]
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Identifier {
    Dns(String),
}

/// Validation methods defined for ACME challenges
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    /// A challenge type this client does not know about
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::Unknown => "unknown",
        })
    }
}

/// Lifecycle states of a [`Challenge`]
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Lifecycle states of an order
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// Shorthand for the two Let's Encrypt environments
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug)]
pub enum LetsEncrypt {
    Production,
    Staging,
}

impl LetsEncrypt {
    /// Directory URL of this environment
    pub const fn url(&self) -> &'static str {
        match self {
            LetsEncrypt::Production => "https://acme-v02.api.letsencrypt.org/directory",
            LetsEncrypt::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
        }
    }
}

/// Directory URL for ZeroSSL's ACME endpoint (requires external account binding)
pub const ZERO_SSL_DIRECTORY: &str = "https://acme.zerossl.com/v2/DV90";

/// Directory URL for Google Public CA (requires external account binding)
pub const GOOGLE_PUBLIC_CA_DIRECTORY: &str = "https://dv.acme-v02.api.pki.goog/directory";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewAccountPayload<'a> {
    pub(crate) terms_of_service_agreed: bool,
    pub(crate) contact: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) external_account_binding: Option<JoseJson>,
}

#[derive(Serialize)]
pub(crate) struct NewOrderPayload<'a> {
    pub(crate) identifiers: &'a [Identifier],
}

#[derive(Debug, Serialize)]
pub(crate) struct FinalizeRequest {
    csr: String,
}

impl FinalizeRequest {
    pub(crate) fn new(csr_der: &[u8]) -> Self {
        Self {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RevocationRequest {
    certificate: String,
    reason: u32,
}

impl RevocationRequest {
    pub(crate) fn new(cert_der: &[u8], reason: u32) -> Self {
        Self {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(cert_der),
            reason,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Header<'a> {
    pub(crate) alg: SigningAlgorithm,
    #[serde(flatten)]
    pub(crate) key: KeyOrKeyId<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) nonce: Option<&'a str>,
    pub(crate) url: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) enum KeyOrKeyId<'a> {
    #[serde(rename = "jwk")]
    Key(Jwk),
    #[serde(rename = "kid")]
    KeyId(&'a str),
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256
    Rs256,
    /// HMAC with SHA-256 (external account binding only)
    Hs256,
}

/// A flattened JSON JWS as described in RFC 7515 (section 7.2.2)
#[derive(Debug, Serialize)]
pub(crate) struct JoseJson {
    pub(crate) protected: String,
    pub(crate) payload: String,
    pub(crate) signature: String,
}

impl JoseJson {
    /// Sign `payload` under the given protected header
    ///
    /// A `None` payload produces the empty-string payload used for POST-as-GET
    /// requests, not an empty JSON object.
    pub(crate) fn new(
        payload: Option<&impl Serialize>,
        protected: Header<'_>,
        signer: &(impl Signer + ?Sized),
    ) -> Result<Self, Error> {
        let protected = base64(&protected)?;
        let payload = match payload {
            Some(data) => base64(data)?,
            None => String::new(),
        };

        let combined = format!("{protected}.{payload}");
        let signature = signer.sign(combined.as_bytes())?;
        Ok(Self {
            protected,
            payload,
            signature: BASE64_URL_SAFE_NO_PAD.encode(signature),
        })
    }
}

pub(crate) trait Signer {
    fn header<'n, 'u: 'n, 's: 'u>(&'s self, nonce: Option<&'n str>, url: &'u str) -> Header<'n>;

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, Error>;
}

pub(crate) fn base64(data: &impl Serialize) -> Result<String, serde_json::Error> {
    Ok(BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(data)?))
}

#[derive(Debug, Serialize)]
pub(crate) struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_kind_from_urn() {
        let problem = Problem {
            r#type: Some("urn:ietf:params:acme:error:badNonce".to_owned()),
            detail: None,
            status: Some(400),
        };
        assert_eq!(problem.kind(), ProblemKind::BadNonce);

        let problem = Problem {
            r#type: Some("urn:ietf:params:acme:error:suchProblemVeryNew".to_owned()),
            ..Problem::default()
        };
        assert_eq!(problem.kind(), ProblemKind::Other);

        assert_eq!(Problem::default().kind(), ProblemKind::Other);
    }

    #[test]
    fn directory_meta_optional() {
        let directory: Directory = serde_json::from_value(serde_json::json!({
            "newNonce": "https://ca.test/new-nonce",
            "newAccount": "https://ca.test/new-acct",
            "newOrder": "https://ca.test/new-order",
        }))
        .unwrap();
        assert!(!directory.external_account_required());
        assert!(directory.revoke_cert.is_none());
    }

    #[test]
    fn unknown_challenge_type() {
        let challenge: Challenge = serde_json::from_value(serde_json::json!({
            "type": "dns-account-01",
            "url": "https://ca.test/chall/1",
            "token": "tok",
            "status": "pending",
        }))
        .unwrap();
        assert_eq!(challenge.r#type, ChallengeType::Unknown);
    }
}
