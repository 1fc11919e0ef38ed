//! Challenge fulfillment: how challenge responses get provisioned.
//!
//! The protocol engine proves control over an identifier by provisioning a
//! response where the CA will look for it. The [`Fulfillment`] trait is the
//! seam between the two: the engine asks the dispatcher to fulfill one of the
//! offered challenges, signals readiness to the CA, and calls the paired
//! clear hook once the authorization settles.

use async_trait::async_trait;

mod dav;
mod powerdns;
mod web;

pub use dav::DavFulfillment;
pub use powerdns::PowerDnsFulfillment;
pub use web::WebrootFulfillment;

use crate::key::KeyAuthorization;
use crate::types::{Challenge, ChallengeType, Error};

/// Result of a single fulfillment attempt
#[derive(Debug)]
pub enum Outcome {
    /// The response is provisioned; respond to the challenge and poll
    Handled,
    /// This handler does not serve this challenge type; try the next one
    NotHandled,
    /// Provisioning was attempted and failed; abort the authorization
    Failed(String),
}

/// A set of paired fulfill/clear hooks keyed by challenge type
///
/// Every hook has a default: fulfillment declines (`NotHandled`) and cleanup
/// succeeds. Implementations override the pairs for the challenge types they
/// serve; the engine guarantees that a successful fulfill hook has its clear
/// hook invoked on every exit path, cancellation included. Clear failures
/// are logged, never propagated.
#[async_trait]
pub trait Fulfillment: Send + Sync {
    /// Challenge types to attempt, most preferred first
    ///
    /// The engine follows this order rather than the server's challenge
    /// order.
    fn preference(&self) -> &[ChallengeType] {
        &[
            ChallengeType::Http01,
            ChallengeType::Dns01,
            ChallengeType::TlsAlpn01,
        ]
    }

    /// Provision the `http-01` response for `domain`
    async fn fulfill_http_01(
        &self,
        _domain: &str,
        _challenge: &Challenge,
        _key_auth: &KeyAuthorization,
    ) -> Outcome {
        Outcome::NotHandled
    }

    /// Tear down a previously provisioned `http-01` response
    async fn clear_http_01(&self, _domain: &str, _challenge: &Challenge) -> Result<(), Error> {
        Ok(())
    }

    /// Provision the `dns-01` TXT record for `domain`
    async fn fulfill_dns_01(
        &self,
        _domain: &str,
        _challenge: &Challenge,
        _key_auth: &KeyAuthorization,
    ) -> Outcome {
        Outcome::NotHandled
    }

    /// Tear down a previously provisioned `dns-01` TXT record
    async fn clear_dns_01(&self, _domain: &str, _challenge: &Challenge) -> Result<(), Error> {
        Ok(())
    }

    /// Provision the `tls-alpn-01` responder certificate for `domain`
    ///
    /// No built-in variant serves this type yet; see
    /// [`build_self_signed`](crate::build_self_signed) for constructing the
    /// placeholder certificate such a responder staples.
    async fn fulfill_tls_alpn_01(
        &self,
        _domain: &str,
        _challenge: &Challenge,
        _key_auth: &KeyAuthorization,
    ) -> Outcome {
        Outcome::NotHandled
    }

    /// Tear down a previously provisioned `tls-alpn-01` responder
    async fn clear_tls_alpn_01(&self, _domain: &str, _challenge: &Challenge) -> Result<(), Error> {
        Ok(())
    }
}

/// Declines everything; the builder default when no dispatcher is configured
pub(crate) struct NoFulfillment;

#[async_trait]
impl Fulfillment for NoFulfillment {}
