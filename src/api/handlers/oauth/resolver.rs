//! Match an external profile against existing identifications.

use std::collections::HashMap;
use uuid::Uuid;

use super::providers::UserProfile;
use crate::store::{
    StoreResult, StoreTx,
    models::{Identification, IdentificationType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedVia {
    ExternalAccount,
    EmailAddress,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Most recently claimed identification for the provider user id.
    pub external: Option<Identification>,
    /// Claimed email identification for the profile email, verified first.
    pub email: Option<Identification>,
    pub user_id: Option<Uuid>,
    pub matched_via: Option<MatchedVia>,
}

impl Resolution {
    #[must_use]
    pub fn user_exists(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Collapse identifications sharing `(identifier, type)` into one, keeping
/// the verified row over a reserved one and the newest among equals. The
/// relative order of first occurrences is preserved.
#[must_use]
pub fn dedup_identifications(identifications: Vec<Identification>) -> Vec<Identification> {
    let mut order: Vec<(String, IdentificationType)> = Vec::new();
    let mut best: HashMap<(String, IdentificationType), Identification> = HashMap::new();

    for ident in identifications {
        let key = (ident.identifier.clone(), ident.kind.clone());
        match best.get(&key) {
            None => {
                order.push(key.clone());
                best.insert(key, ident);
            }
            Some(current) => {
                let better = (ident.is_verified(), ident.updated_at)
                    > (current.is_verified(), current.updated_at);
                if better {
                    best.insert(key, ident);
                }
            }
        }
    }

    order.into_iter().filter_map(|key| best.remove(&key)).collect()
}

/// Find candidate identifications and the user they lead to.
///
/// The external identification always identifies its user. The email
/// identification only does when the provider vouches for the email, or when
/// the client opted into the unverified-email link flow.
///
/// # Errors
/// Propagates store failures.
pub async fn resolve(
    tx: &mut dyn StoreTx,
    profile: &UserProfile,
    instance_id: &str,
    supports_email_link_flow: bool,
) -> StoreResult<Resolution> {
    let external = tx
        .latest_claimed_identification(
            instance_id,
            &profile.identification_type(),
            &profile.provider_user_id,
        )
        .await?;

    let email = if profile.email_address.is_empty() {
        None
    } else {
        let candidates = tx
            .claimed_identifications(
                instance_id,
                &IdentificationType::EmailAddress,
                &profile.email_address,
            )
            .await?;
        dedup_identifications(candidates).into_iter().next()
    };

    let trust_email = profile.email_address_verified || supports_email_link_flow;

    let (user_id, matched_via) = if let Some(user_id) =
        external.as_ref().and_then(|ident| ident.user_id)
    {
        (Some(user_id), Some(MatchedVia::ExternalAccount))
    } else if let Some(user_id) = email
        .as_ref()
        .filter(|_| trust_email)
        .and_then(|ident| ident.user_id)
    {
        (Some(user_id), Some(MatchedVia::EmailAddress))
    } else {
        (None, None)
    };

    Ok(Resolution {
        external,
        email,
        user_id,
        matched_via,
    })
}
