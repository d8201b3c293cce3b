use std::{sync::RwLock, time::Duration};

use shared::domain::Credential;
use tracing::warn;

use crate::{read, write};

/// In-memory holder of the current credential.
#[derive(Default)]
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Credential> {
        read(&self.current).clone()
    }

    /// Stores `credential` unless it would move `expires_at` backwards.
    pub fn set(&self, credential: Credential) -> bool {
        let mut current = write(&self.current);
        if let Some(existing) = current.as_ref() {
            if credential.expires_at < existing.expires_at {
                warn!(
                    stored_expires_at = %existing.expires_at,
                    rejected_expires_at = %credential.expires_at,
                    "refresh: refusing credential with an earlier expiry"
                );
                return false;
            }
        }
        *current = Some(credential);
        true
    }

    pub fn clear(&self) {
        write(&self.current).take();
    }

    /// True when there is no credential, or it expires within `margin`.
    pub fn is_expired_or_expiring_within(&self, margin: Duration) -> bool {
        read(&self.current)
            .as_ref()
            .map_or(true, |credential| credential.is_expired_or_expiring_within(margin))
    }
}
