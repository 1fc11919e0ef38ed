use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{Fulfillment, Outcome};
use crate::key::KeyAuthorization;
use crate::types::{Challenge, ChallengeType, Error};

/// `http-01` fulfillment backed by a static web root
///
/// Writes the key authorization to `<root>/<token>`, where `root` is the
/// directory the host web server maps to `/.well-known/acme-challenge/`.
/// Cleanup unlinks the file.
pub struct WebrootFulfillment {
    root: PathBuf,
}

impl WebrootFulfillment {
    /// Serve challenge files from the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn token_path(&self, challenge: &Challenge) -> Option<PathBuf> {
        // Tokens are base64url per RFC 8555; anything else could escape the
        // web root.
        let token = &challenge.token;
        let valid = !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| self.root.join(token))
    }
}

#[async_trait]
impl Fulfillment for WebrootFulfillment {
    fn preference(&self) -> &[ChallengeType] {
        &[ChallengeType::Http01]
    }

    async fn fulfill_http_01(
        &self,
        _domain: &str,
        challenge: &Challenge,
        key_auth: &KeyAuthorization,
    ) -> Outcome {
        let Some(path) = self.token_path(challenge) else {
            return Outcome::Failed("challenge token is not a valid file name".to_owned());
        };

        debug!(path = %path.display(), "writing challenge token");
        match tokio::fs::write(&path, key_auth.as_str()).await {
            Ok(()) => Outcome::Handled,
            Err(error) => Outcome::Failed(format!("failed to write {}: {error}", path.display())),
        }
    }

    async fn clear_http_01(&self, _domain: &str, challenge: &Challenge) -> Result<(), Error> {
        let Some(path) = self.token_path(challenge) else {
            return Ok(());
        };

        debug!(path = %path.display(), "removing challenge token");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(Error::Fulfillment(
                format!("failed to remove {}: {error}", path.display()).into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::testdata::RSA_2048_PEM;
    use crate::key::AccountKey;
    use crate::types::ChallengeStatus;

    fn challenge(token: &str) -> Challenge {
        Challenge {
            r#type: ChallengeType::Http01,
            url: "https://ca.test/chall/1".to_owned(),
            token: token.to_owned(),
            status: ChallengeStatus::Pending,
            error: None,
        }
    }

    #[tokio::test]
    async fn writes_and_removes_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let fulfillment = WebrootFulfillment::new(dir.path());
        let key = AccountKey::from_pem(RSA_2048_PEM).unwrap();

        let challenge = challenge("IlirfxKKXAsHtmzK29Pj8A");
        let key_auth = crate::key::KeyAuthorization::new(&challenge, &key);

        let outcome = fulfillment
            .fulfill_http_01("example.com", &challenge, &key_auth)
            .await;
        assert!(matches!(outcome, Outcome::Handled));

        let path = dir.path().join(&challenge.token);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), key_auth.as_str());

        fulfillment
            .clear_http_01("example.com", &challenge)
            .await
            .unwrap();
        assert!(!path.exists());

        // Clearing twice is not an error.
        fulfillment
            .clear_http_01("example.com", &challenge)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_tokens_that_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let fulfillment = WebrootFulfillment::new(dir.path());
        let key = AccountKey::from_pem(RSA_2048_PEM).unwrap();

        let challenge = challenge("../evil");
        let key_auth = crate::key::KeyAuthorization::new(&challenge, &key);
        let outcome = fulfillment
            .fulfill_http_01("example.com", &challenge, &key_auth)
            .await;
        assert!(matches!(outcome, Outcome::Failed(_)));
    }
}
