use std::fmt;

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use num_bigint_dig::{BigInt, BigUint, Sign};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Error;

/// Serialized client state
///
/// This opaque-but-serializable record contains everything needed to rebuild
/// a client without contacting the CA: the directory URL, the account key and
/// the account URL. Absence of `account_url` means the account has not been
/// created yet. Fields this version does not know about survive a round-trip.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClientState {
    /// Directory URL the account key is bound to
    pub directory: String,
    /// The RSA account key, private components included
    pub key: RsaKeyState,
    /// Account URL ("kid") returned by account creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_url: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ClientState {
    pub(crate) fn new(directory: String, key: &RsaPrivateKey, account_url: Option<String>) -> Result<Self, Error> {
        Ok(Self {
            directory,
            key: RsaKeyState::from_key(key)?,
            account_url,
            extra: Map::new(),
        })
    }
}

/// Private RSA key material as base64url big-endian integers (RFC 7518 §6.3)
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct RsaKeyState {
    n: String,
    e: String,
    d: String,
    p: String,
    q: String,
    dp: String,
    dq: String,
    qi: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl RsaKeyState {
    pub(crate) fn from_key(key: &RsaPrivateKey) -> Result<Self, Error> {
        let mut key = key.clone();
        key.precompute()?;

        let [p, q] = match key.primes() {
            [p, q] => [p, q],
            _ => return Err(Error::Crypto("expected a two-prime RSA key".to_owned())),
        };
        let dp = key
            .dp()
            .ok_or_else(|| Error::Crypto("missing CRT exponent dp".to_owned()))?;
        let dq = key
            .dq()
            .ok_or_else(|| Error::Crypto("missing CRT exponent dq".to_owned()))?;
        // mod_inverse may come back negative; the JWK form wants qi in [0, p).
        let mut qi = key
            .qinv()
            .ok_or_else(|| Error::Crypto("missing CRT coefficient qi".to_owned()))?
            .clone();
        if qi.sign() == Sign::Minus {
            qi += BigInt::from_biguint(Sign::Plus, p.clone());
        }
        let qi = qi
            .to_biguint()
            .ok_or_else(|| Error::Crypto("negative CRT coefficient".to_owned()))?;

        Ok(Self {
            n: encode(key.n()),
            e: encode(key.e()),
            d: encode(key.d()),
            p: encode(p),
            q: encode(q),
            dp: encode(dp),
            dq: encode(dq),
            qi: encode(&qi),
            extra: Map::new(),
        })
    }

    pub(crate) fn to_key(&self) -> Result<RsaPrivateKey, Error> {
        let key = RsaPrivateKey::from_components(
            decode(&self.n)?,
            decode(&self.e)?,
            decode(&self.d)?,
            vec![decode(&self.p)?, decode(&self.q)?],
        )?;
        key.validate()?;
        Ok(key)
    }
}

impl fmt::Debug for RsaKeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyState").finish_non_exhaustive()
    }
}

fn encode(value: &BigUint) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn decode(value: &str) -> Result<BigUint, Error> {
    Ok(BigUint::from_bytes_be(&BASE64_URL_SAFE_NO_PAD.decode(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::testdata::RSA_2048_PEM;
    use crate::key::AccountKey;

    fn test_state() -> ClientState {
        let key = AccountKey::from_pem(RSA_2048_PEM).unwrap();
        ClientState::new(
            "https://ca.test/directory".to_owned(),
            key.rsa(),
            Some("https://ca.test/acct/1".to_owned()),
        )
        .unwrap()
    }

    #[test]
    fn round_trip_is_identity() {
        let state = test_state();
        let json = serde_json::to_string(&state).unwrap();
        let reparsed: ClientState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, reparsed);
    }

    #[test]
    fn restored_key_signs_like_the_original() {
        let original = AccountKey::from_pem(RSA_2048_PEM).unwrap();
        let state = test_state();
        let restored = AccountKey::from_inner(state.key.to_key().unwrap()).unwrap();
        assert_eq!(original.thumbprint(), restored.thumbprint());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let mut value: Value = serde_json::to_value(test_state()).unwrap();
        value["pinned_chain"] = Value::String("isrg-root-x1".to_owned());
        value["key"]["kty"] = Value::String("RSA".to_owned());

        let state: ClientState = serde_json::from_value(value.clone()).unwrap();
        let reserialized = serde_json::to_value(&state).unwrap();
        assert_eq!(reserialized["pinned_chain"], value["pinned_chain"]);
        assert_eq!(reserialized["key"]["kty"], value["key"]["kty"]);
    }

    #[test]
    fn missing_account_url_means_key_only() {
        let mut value: Value = serde_json::to_value(test_state()).unwrap();
        value.as_object_mut().unwrap().remove("account_url");
        let state: ClientState = serde_json::from_value(value).unwrap();
        assert!(state.account_url.is_none());
    }

    #[test]
    fn integers_are_unpadded_base64url() {
        let state = test_state();
        assert_eq!(state.key.e, "AQAB");
        assert!(!state.key.n.contains('='));
        // 2048-bit modulus with the leading zero stripped encodes to 342 chars.
        assert_eq!(state.key.n.len(), 342);
        assert!(state.key.n.starts_with("kJgUJzquhfNDkPoJ8-WmBx0oB9clTC-pWUQ5cCME"));
    }
}
