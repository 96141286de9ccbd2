//! A remote repository API that rejects every request with an SSO
//! enforcement error until the organization's authorization is granted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use sso_coord::error::{FORBIDDEN, RemoteError};
use sso_coord::poller::{RetryFn, retry_fn};
use tracing::debug;

#[derive(Debug)]
pub struct SimulatedRemote {
    organization: String,
    authorized: AtomicBool,
    requests: AtomicU64,
}

impl SimulatedRemote {
    pub fn new(organization: &str) -> Arc<Self> {
        Arc::new(Self {
            organization: organization.to_string(),
            authorized: AtomicBool::new(false),
            requests: AtomicU64::new(0),
        })
    }

    /// The human finished the external SSO step.
    pub fn authorize(&self) {
        self.authorized.store(true, Ordering::SeqCst);
        debug!(organization = %self.organization, "remote authorization granted");
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub async fn fetch(&self, path: &str) -> Result<(), RemoteError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.is_authorized() {
            return Ok(());
        }
        debug!(path, "rejecting request: sso not authorized");
        Err(RemoteError::new(
            FORBIDDEN,
            format!(
                "Resource protected by organization SAML enforcement. \
                 You must grant your access token access to the `{}` organization.",
                self.organization
            ),
        ))
    }

    pub fn retry(self: &Arc<Self>, path: &str) -> RetryFn {
        let remote = Arc::clone(self);
        let path = path.to_string();
        retry_fn(move || {
            let remote = remote.clone();
            let path = path.clone();
            async move { remote.fetch(&path).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sso_coord::classifier::ErrorClassifier;

    #[tokio::test]
    async fn rejection_names_the_organization() {
        let remote = SimulatedRemote::new("who-smart");
        let err = remote.fetch("repos/who-smart/guides").await.unwrap_err();
        let sso = ErrorClassifier::new().classify(&err).unwrap();
        assert_eq!(sso.organization, "who-smart");
    }

    #[tokio::test]
    async fn authorize_unblocks_retries() {
        let remote = SimulatedRemote::new("acme");
        let retry = remote.retry("repos/acme/guides");
        assert!(retry().await.is_err());
        remote.authorize();
        assert!(retry().await.is_ok());
        assert_eq!(remote.requests(), 2);
    }
}
