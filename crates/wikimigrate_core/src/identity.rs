use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{DestinationUser, EntityId, SourceIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerMatch {
    Override,
    Email,
    DisplayName,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnerResolution {
    pub user_id: EntityId,
    pub matched: OwnerMatch,
}

/// Maps source creator identities onto destination users. Results are cached
/// per account for the run.
#[derive(Debug, Default)]
pub struct OwnerResolver {
    overrides: HashMap<String, EntityId>,
    by_email: HashMap<String, EntityId>,
    by_name: HashMap<String, EntityId>,
    ambiguous_names: HashSet<String>,
    default_owner: Option<EntityId>,
    cache: HashMap<String, Option<OwnerResolution>>,
}

impl OwnerResolver {
    pub fn new(
        users: &[DestinationUser],
        overrides: &BTreeMap<String, EntityId>,
        default_owner: Option<EntityId>,
    ) -> Self {
        let mut resolver = Self {
            overrides: overrides
                .iter()
                .map(|(key, id)| (key.trim().to_lowercase(), *id))
                .collect(),
            default_owner,
            ..Self::default()
        };
        for user in users {
            if let Some(email) = user.email.as_deref() {
                let key = email.trim().to_lowercase();
                if !key.is_empty() {
                    resolver.by_email.entry(key).or_insert(user.id);
                }
            }
            let name = user.name.trim().to_lowercase();
            if name.is_empty() {
                continue;
            }
            if resolver.by_name.insert(name.clone(), user.id).is_some() {
                resolver.ambiguous_names.insert(name);
            }
        }
        for name in &resolver.ambiguous_names {
            resolver.by_name.remove(name);
        }
        resolver
    }

    /// `None` when the node has no creator or nothing (not even a default)
    /// applies.
    pub fn resolve(&mut self, identity: Option<&SourceIdentity>) -> Option<OwnerResolution> {
        let identity = identity?;
        if let Some(cached) = self.cache.get(&identity.account_id) {
            return *cached;
        }
        let resolution = self.lookup(identity);
        match resolution {
            Some(OwnerResolution {
                matched: OwnerMatch::Default,
                user_id,
            }) => warn!(
                account_id = identity.account_id.as_str(),
                user_id, "no destination user matches creator, using default owner"
            ),
            Some(found) => debug!(
                account_id = identity.account_id.as_str(),
                user_id = found.user_id,
                matched = ?found.matched,
                "resolved owner"
            ),
            None => debug!(
                account_id = identity.account_id.as_str(),
                "no owner for creator"
            ),
        }
        self.cache.insert(identity.account_id.clone(), resolution);
        resolution
    }

    fn lookup(&self, identity: &SourceIdentity) -> Option<OwnerResolution> {
        let found = |user_id, matched| Some(OwnerResolution { user_id, matched });

        let email = identity
            .email
            .as_deref()
            .map(|email| email.trim().to_lowercase());
        let override_keys = [Some(identity.account_id.to_lowercase()), email.clone()];
        for key in override_keys.iter().flatten() {
            if let Some(id) = self.overrides.get(key) {
                return found(*id, OwnerMatch::Override);
            }
        }
        if let Some(id) = email.as_ref().and_then(|email| self.by_email.get(email)) {
            return found(*id, OwnerMatch::Email);
        }
        if let Some(id) = identity
            .display_name
            .as_deref()
            .map(|name| name.trim().to_lowercase())
            .and_then(|name| self.by_name.get(&name))
        {
            return found(*id, OwnerMatch::DisplayName);
        }
        self.default_owner
            .and_then(|id| found(id, OwnerMatch::Default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: EntityId, name: &str, email: &str) -> DestinationUser {
        DestinationUser {
            id,
            name: name.to_string(),
            email: Some(email.to_string()),
        }
    }

    fn identity(account: &str, email: Option<&str>, name: Option<&str>) -> SourceIdentity {
        SourceIdentity {
            account_id: account.to_string(),
            email: email.map(str::to_string),
            display_name: name.map(str::to_string),
        }
    }

    fn users() -> Vec<DestinationUser> {
        vec![
            user(1, "Admin", "admin@acme.test"),
            user(2, "Alice Smith", "Alice@Acme.test"),
            user(3, "Sam", "sam1@acme.test"),
            user(4, "Sam", "sam2@acme.test"),
        ]
    }

    #[test]
    fn resolution_order_is_override_email_name_default() {
        let mut overrides = BTreeMap::new();
        overrides.insert("acc-override".to_string(), 9);
        let mut resolver = OwnerResolver::new(&users(), &overrides, Some(1));

        let by_override = resolver
            .resolve(Some(&identity("acc-override", Some("alice@acme.test"), None)))
            .expect("override");
        assert_eq!(by_override.matched, OwnerMatch::Override);
        assert_eq!(by_override.user_id, 9);

        let by_email = resolver
            .resolve(Some(&identity("acc-a", Some("ALICE@acme.test"), None)))
            .expect("email");
        assert_eq!((by_email.user_id, by_email.matched), (2, OwnerMatch::Email));

        let by_name = resolver
            .resolve(Some(&identity("acc-b", None, Some("alice smith"))))
            .expect("name");
        assert_eq!(
            (by_name.user_id, by_name.matched),
            (2, OwnerMatch::DisplayName)
        );

        let fallback = resolver
            .resolve(Some(&identity("acc-c", None, Some("Nobody"))))
            .expect("default");
        assert_eq!((fallback.user_id, fallback.matched), (1, OwnerMatch::Default));
    }

    #[test]
    fn ambiguous_display_names_do_not_match() {
        let mut resolver = OwnerResolver::new(&users(), &BTreeMap::new(), None);
        assert_eq!(resolver.resolve(Some(&identity("acc", None, Some("Sam")))), None);
    }

    #[test]
    fn missing_creator_gets_no_owner_even_with_default() {
        let mut resolver = OwnerResolver::new(&users(), &BTreeMap::new(), Some(1));
        assert_eq!(resolver.resolve(None), None);
    }

    #[test]
    fn overrides_accept_email_keys() {
        let mut overrides = BTreeMap::new();
        overrides.insert("Bob@Acme.test".to_string(), 7);
        let mut resolver = OwnerResolver::new(&users(), &overrides, None);
        let resolved = resolver
            .resolve(Some(&identity("acc-bob", Some("bob@acme.test"), None)))
            .expect("override by email");
        assert_eq!(resolved.user_id, 7);
    }
}
