use std::mem;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::cert::to_der;
use crate::fulfillment::{Fulfillment, NoFulfillment, Outcome};
use crate::key::{AccountKey, ExternalAccountKey, KeyAuthorization};
use crate::state::ClientState;
use crate::types::{
    Authorization, AuthorizationStatus, Challenge, ChallengeType, Empty, Error, FinalizeRequest,
    Header, JoseJson, KeyOrKeyId, NewAccountPayload, NewOrderPayload, OrderState, OrderStatus,
    Problem, RevocationRequest, Signer, SigningAlgorithm,
};
use crate::{location_from_response, BytesResponse, Client, DefaultClient, HttpClient};

const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(300);
const ORDER_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INITIAL_DELAY: Duration = Duration::from_secs(1);
const POLL_MAX_DELAY: Duration = Duration::from_secs(30);

/// An ACME client driving the full issuance sequence against one directory
///
/// Create one via [`AcmeClient::builder()`], or rebuild a previous session
/// offline with [`AcmeClient::restore()`]. A client serves one logical
/// session; run independent clients for parallel issuance.
pub struct AcmeClient {
    client: Client,
    key: AccountKey,
    account_url: Option<String>,
    fulfillment: Arc<dyn Fulfillment>,
}

impl AcmeClient {
    /// Start building a client for the given directory URL
    pub fn builder(directory_url: impl Into<String>) -> AcmeClientBuilder {
        AcmeClientBuilder {
            directory_url: directory_url.into(),
            http: None,
            key: None,
            account_url: None,
            fulfillment: None,
        }
    }

    /// Rebuild a client from serialized state, without contacting the CA
    pub fn restore(state: &ClientState) -> Result<AcmeClientBuilder, Error> {
        let mut builder = Self::builder(state.directory.clone());
        builder.key = Some(AccountKey::from_inner(state.key.to_key()?)?);
        builder.account_url = state.account_url.clone();
        Ok(builder)
    }

    /// Serialize the minimum state needed to rebuild this client
    pub fn state(&self) -> Result<ClientState, Error> {
        ClientState::new(
            self.client.directory_url().to_owned(),
            self.key.rsa(),
            self.account_url.clone(),
        )
    }

    /// Whether the client is bound to an account
    pub fn is_bound(&self) -> bool {
        self.account_url.is_some()
    }

    /// The account URL ("kid"), once bound
    pub fn account_url(&self) -> Option<&str> {
        self.account_url.as_deref()
    }

    /// Compute the key authorization for a challenge under this account key
    pub fn key_authorization(&self, challenge: &Challenge) -> KeyAuthorization {
        KeyAuthorization::new(challenge, &self.key)
    }

    /// Create a new account (RFC 8555 section 7.3) and bind the client to it
    ///
    /// `contacts` is a list of email addresses. Supply `eab` credentials for
    /// CAs that link ACME accounts to externally registered ones; when the
    /// directory advertises `externalAccountRequired` they are mandatory.
    ///
    /// A server response indicating the key is already registered still
    /// carries the account URL and is treated as success. Returns the
    /// account URL, which [`AcmeClient::state()`] persists.
    pub async fn new_account(
        &mut self,
        contacts: &[&str],
        eab: Option<&ExternalAccountKey>,
    ) -> Result<String, Error> {
        if self.is_bound() {
            return Err(Error::AlreadyRegistered);
        }

        let directory = self.client.directory().await?;
        let external_account_binding = match (eab, directory.external_account_required()) {
            (Some(eab), _) => Some(JoseJson::new(
                Some(&self.key.jwk()),
                eab.header(None, &directory.new_account),
                eab,
            )?),
            (None, true) => {
                return Err(Error::Str(
                    "directory requires external account binding credentials",
                ))
            }
            (None, false) => None,
        };

        let contact = contacts
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect::<Vec<_>>();
        debug!(?contact, "creating new account");

        let payload = NewAccountPayload {
            terms_of_service_agreed: true,
            contact: &contact,
            external_account_binding,
        };
        let rsp = self.post(Some(&payload), &directory.new_account).await?;

        let account_url = location_from_response(&rsp);
        if rsp.parts.status == http::StatusCode::OK {
            debug!("account key was already registered, reusing account");
        }

        // Everything we need is in the Location header; the body only
        // matters when it is a problem document.
        let _ = Problem::from_response(rsp)?;
        let account_url = account_url.ok_or("failed to get account URL")?;
        self.account_url = Some(account_url.clone());
        Ok(account_url)
    }

    /// Obtain a certificate for `domain` from the given CSR
    ///
    /// `csr` may be PEM (`BEGIN CERTIFICATE REQUEST`) or DER. Runs the whole
    /// RFC 8555 sequence: order creation, one authorization at a time with
    /// challenge dispatch through the configured [`Fulfillment`],
    /// finalization, and certificate download. Returns the CA's PEM chain
    /// verbatim, leaf first.
    pub async fn sign(&self, domain: &str, csr: &[u8]) -> Result<String, Error> {
        self.check_bound()?;
        let csr_der = to_der(csr)?;
        debug!(domain, "requesting certificate");

        // Place the order.
        let directory = self.client.directory().await?;
        let identifiers = [crate::types::Identifier::Dns(domain.to_owned())];
        let rsp = self
            .post(
                Some(&NewOrderPayload {
                    identifiers: &identifiers,
                }),
                &directory.new_order,
            )
            .await?;

        let order_url = location_from_response(&rsp);
        // Let a problem document surface before checking for the Location
        // header: a rejected order has no URL, and the missing-URL error
        // would bury the server's actual complaint.
        let order: OrderState = Problem::check(rsp)?;
        let order_url = order_url.ok_or("no order URL found")?;

        // One authorization per identifier, processed sequentially.
        for auth_url in &order.authorizations {
            self.process_authorization(domain, auth_url).await?;
        }

        // All authorizations are valid; finalize with the CSR.
        debug!(domain, "finalizing order");
        let rsp = self
            .post(Some(&FinalizeRequest::new(&csr_der)), &order.finalize)
            .await?;
        let state: OrderState = Problem::check(rsp)?;

        let state = timeout(ORDER_TIMEOUT, self.poll_order(&order_url, state))
            .await
            .map_err(|_| Error::Timeout)??;

        let cert_url = state.certificate.ok_or("no certificate URL found")?;
        debug!(domain, url = %cert_url, "downloading certificate");
        let rsp = self.post(None::<&Empty>, &cert_url).await?;
        let body = Problem::from_response(rsp)?;
        String::from_utf8(body.to_vec()).map_err(|_| "unable to decode certificate as UTF-8".into())
    }

    /// Revoke a previously issued certificate (RFC 8555 section 7.6)
    ///
    /// `cert` may be PEM or DER; `reason` is an RFC 5280 CRL reason code.
    pub async fn revoke(&self, cert: &[u8], reason: u32) -> Result<(), Error> {
        self.check_bound()?;
        let directory = self.client.directory().await?;
        let revoke_url = directory
            .revoke_cert
            .as_deref()
            .ok_or("no revokeCert URL found")?;

        let payload = RevocationRequest::new(&to_der(cert)?, reason);
        let rsp = self.post(Some(&payload), revoke_url).await?;
        // Accepted revocations come back with no content; only a rejection
        // carries a body worth parsing.
        let _ = Problem::from_response(rsp)?;
        Ok(())
    }

    /// Deactivate the bound account (RFC 8555 section 7.3.6) and unbind
    ///
    /// A deactivated account can no longer create orders; existing orders
    /// and authorizations are invalidated by the server.
    pub async fn deactivate_account(&mut self) -> Result<(), Error> {
        self.check_bound()?;

        #[derive(Serialize)]
        struct DeactivateRequest<'a> {
            status: &'a str,
        }

        let account_url = self.account_url.clone().ok_or(Error::NotRegistered)?;
        let rsp = self
            .post(
                Some(&DeactivateRequest {
                    status: "deactivated",
                }),
                &account_url,
            )
            .await?;
        let _ = Problem::from_response(rsp)?;
        self.account_url = None;
        Ok(())
    }

    /// Fetch, fulfill and validate a single authorization
    async fn process_authorization(&self, domain: &str, auth_url: &str) -> Result<(), Error> {
        let auth: Authorization = self.get(auth_url).await?;
        match auth.status {
            // Already proven, possibly in an earlier order; nothing to do
            // and no fulfillment hook may run.
            AuthorizationStatus::Valid => {
                debug!(domain, "authorization already valid, skipping");
                return Ok(());
            }
            AuthorizationStatus::Pending => {}
            status => {
                warn!(domain, ?status, "authorization in unexpected state");
                return Err(Error::Authorization(None));
            }
        }

        // Dispatch the first challenge a handler accepts, preferring the
        // dispatcher's configured order over the server's.
        let mut dispatched = None;
        for r#type in self.fulfillment.preference() {
            let Some(challenge) = auth.challenges.iter().find(|c| c.r#type == *r#type) else {
                continue;
            };
            let key_auth = KeyAuthorization::new(challenge, &self.key);
            debug!(domain, challenge = %r#type, "attempting fulfillment");
            let outcome = match r#type {
                ChallengeType::Http01 => {
                    self.fulfillment
                        .fulfill_http_01(domain, challenge, &key_auth)
                        .await
                }
                ChallengeType::Dns01 => {
                    self.fulfillment
                        .fulfill_dns_01(domain, challenge, &key_auth)
                        .await
                }
                ChallengeType::TlsAlpn01 => {
                    self.fulfillment
                        .fulfill_tls_alpn_01(domain, challenge, &key_auth)
                        .await
                }
                ChallengeType::Unknown => continue,
            };

            match outcome {
                Outcome::Handled => {
                    dispatched = Some(challenge);
                    break;
                }
                Outcome::NotHandled => debug!(domain, challenge = %r#type, "handler declined"),
                Outcome::Failed(reason) => return Err(Error::Fulfillment(reason.into())),
            }
        }

        let Some(challenge) = dispatched else {
            return Err(Error::Fulfillment(
                "no handler accepted any offered challenge".into(),
            ));
        };

        // From here on the challenge response is provisioned; tear it down on
        // every exit path, including cancellation of the enclosing future.
        let guard = CleanupGuard {
            fulfillment: self.fulfillment.clone(),
            domain: domain.to_owned(),
            challenge: challenge.clone(),
            armed: true,
        };
        let result = self.validate_challenge(auth_url, challenge).await;
        guard.clear().await;
        result
    }

    /// Tell the server the challenge is ready, then poll the authorization
    async fn validate_challenge(&self, auth_url: &str, challenge: &Challenge) -> Result<(), Error> {
        // Readiness is signaled with an empty JSON object, exactly once.
        let rsp = self.post(Some(&Empty {}), &challenge.url).await?;
        let _ = Problem::check::<Challenge>(rsp)?;

        timeout(
            AUTHORIZATION_TIMEOUT,
            self.poll_authorization(auth_url, challenge),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    async fn poll_authorization(&self, auth_url: &str, challenge: &Challenge) -> Result<(), Error> {
        let mut backoff = Backoff::default();
        loop {
            let auth: Authorization = self.get(auth_url).await?;
            match auth.status {
                AuthorizationStatus::Valid => return Ok(()),
                AuthorizationStatus::Pending => {}
                status => {
                    // Surface the challenge-level error, which is where the
                    // server explains what failed validation.
                    let problem = auth
                        .challenges
                        .iter()
                        .find(|c| c.url == challenge.url)
                        .and_then(|c| c.error.clone())
                        .or_else(|| auth.challenges.iter().find_map(|c| c.error.clone()));
                    warn!(?status, ?problem, "authorization failed");
                    return Err(Error::Authorization(problem));
                }
            }
            sleep(backoff.next()).await;
        }
    }

    async fn poll_order(&self, order_url: &str, mut state: OrderState) -> Result<OrderState, Error> {
        let mut backoff = Backoff::default();
        loop {
            match state.status {
                OrderStatus::Valid => return Ok(state),
                OrderStatus::Invalid => return Err(Error::OrderFailed(state.error.take())),
                OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {}
            }
            sleep(backoff.next()).await;
            state = self.get(order_url).await?;
        }
    }

    /// POST-as-GET: a signed request with an empty payload
    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, Error> {
        let rsp = self.post(None::<&Empty>, url).await?;
        Problem::check(rsp)
    }

    async fn post(
        &self,
        payload: Option<&impl Serialize>,
        url: &str,
    ) -> Result<BytesResponse, Error> {
        let signer = RequestSigner {
            key: &self.key,
            account_url: self.account_url.as_deref(),
        };
        self.client.post(payload, &signer, url).await
    }

    fn check_bound(&self) -> Result<(), Error> {
        match self.is_bound() {
            true => Ok(()),
            false => Err(Error::NotRegistered),
        }
    }
}

/// Builder for [`AcmeClient`]
pub struct AcmeClientBuilder {
    directory_url: String,
    http: Option<Box<dyn HttpClient>>,
    key: Option<AccountKey>,
    account_url: Option<String>,
    fulfillment: Option<Arc<dyn Fulfillment>>,
}

impl AcmeClientBuilder {
    /// Use the given HTTP transport instead of the built-in hyper client
    pub fn http(mut self, http: Box<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Use the given account key instead of generating a fresh one
    pub fn key(mut self, key: AccountKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Bind to an existing account URL from a previous `new_account` call
    pub fn account_url(mut self, url: impl Into<String>) -> Self {
        self.account_url = Some(url.into());
        self
    }

    /// Use the given challenge fulfillment dispatcher
    ///
    /// Without one, every challenge is declined and `sign` fails.
    pub fn fulfillment(mut self, fulfillment: Arc<dyn Fulfillment>) -> Self {
        self.fulfillment = Some(fulfillment);
        self
    }

    /// Build the client; generates an account key when none was supplied
    ///
    /// Does not contact the CA: the directory is fetched lazily on first use.
    pub fn build(self) -> Result<AcmeClient, Error> {
        let http = match self.http {
            Some(http) => http,
            None => Box::new(DefaultClient::try_new()?),
        };
        let key = match self.key {
            Some(key) => key,
            None => AccountKey::generate()?,
        };

        Ok(AcmeClient {
            client: Client::new(self.directory_url, http),
            key,
            account_url: self.account_url,
            fulfillment: self
                .fulfillment
                .unwrap_or_else(|| Arc::new(NoFulfillment)),
        })
    }
}

/// Signs requests with `jwk` before account binding and `kid` after
struct RequestSigner<'a> {
    key: &'a AccountKey,
    account_url: Option<&'a str>,
}

impl Signer for RequestSigner<'_> {
    fn header<'n, 'u: 'n, 's: 'u>(&'s self, nonce: Option<&'n str>, url: &'u str) -> Header<'n> {
        match self.account_url {
            Some(kid) => Header {
                alg: SigningAlgorithm::Rs256,
                key: KeyOrKeyId::KeyId(kid),
                nonce,
                url,
            },
            None => self.key.header(nonce, url),
        }
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        self.key.sign(payload)
    }
}

/// Runs the matching `clear_*` hook when the fulfill/validate bracket ends
///
/// `clear()` is the ordinary path; `Drop` covers cancellation by detaching
/// the hook onto the runtime, so provisioned responses are removed even when
/// the `sign` future is dropped mid-validation.
struct CleanupGuard {
    fulfillment: Arc<dyn Fulfillment>,
    domain: String,
    challenge: Challenge,
    armed: bool,
}

impl CleanupGuard {
    async fn clear(mut self) {
        self.armed = false;
        clear_challenge(&*self.fulfillment, &self.domain, &self.challenge).await;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let fulfillment = self.fulfillment.clone();
        let domain = mem::take(&mut self.domain);
        let challenge = self.challenge.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                clear_challenge(&*fulfillment, &domain, &challenge).await;
            });
        } else {
            warn!(%domain, "no runtime available to clear challenge response");
        }
    }
}

/// Invoke the clear hook for the challenge type; failures are logged only
/// so they never mask the validation result.
async fn clear_challenge(fulfillment: &dyn Fulfillment, domain: &str, challenge: &Challenge) {
    let result = match challenge.r#type {
        ChallengeType::Http01 => fulfillment.clear_http_01(domain, challenge).await,
        ChallengeType::Dns01 => fulfillment.clear_dns_01(domain, challenge).await,
        ChallengeType::TlsAlpn01 => fulfillment.clear_tls_alpn_01(domain, challenge).await,
        ChallengeType::Unknown => Ok(()),
    };
    if let Err(error) = result {
        warn!(%error, domain, challenge = %challenge.r#type, "challenge cleanup failed");
    }
}

struct Backoff {
    delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: POLL_INITIAL_DELAY,
        }
    }
}

impl Backoff {
    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (delay * 2).min(POLL_MAX_DELAY);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::default();
        let delays = (0..7).map(|_| backoff.next()).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16, 30, 30].map(Duration::from_secs).to_vec(),
        );
    }
}
