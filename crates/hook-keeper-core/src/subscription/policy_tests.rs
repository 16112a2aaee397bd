//! Tests for webhook merge policies.

use super::*;

fn scope(value: &str) -> Scope {
    Scope::new(value).unwrap()
}

fn config(scope_value: &str, events: &[&str]) -> WebhookConfig {
    WebhookConfig::new(scope(scope_value), events.iter().copied().collect())
}

mod superset_policy_tests {
    use super::*;

    #[test]
    fn test_superset_is_equivalent() {
        let existing = config("acme/widgets", &["push", "release"]);
        let requested = config("acme/widgets", &["push"]);
        assert!(SupersetPolicy.equivalent(&existing, &requested));
    }

    /// Equivalence is directional: a narrower registration does not serve a wider request.
    #[test]
    fn test_subset_is_not_equivalent() {
        let existing = config("acme/widgets", &["push"]);
        let requested = config("acme/widgets", &["push", "release"]);
        assert!(!SupersetPolicy.equivalent(&existing, &requested));
    }

    #[test]
    fn test_different_scope_never_equivalent() {
        let existing = config("acme/widgets", &["push", "release"]);
        let requested = config("acme/gadgets", &["push"]);
        assert!(!SupersetPolicy.equivalent(&existing, &requested));
    }

    #[test]
    fn test_merge_produces_union() {
        let existing = config("acme/widgets", &["push"]);
        let requested = config("acme/widgets", &["release"]);

        let merged = SupersetPolicy.merge(&existing, &requested).unwrap();
        assert_eq!(merged.events, EventSet::from_iter(["push", "release"]));
        assert_eq!(merged.scope, scope("acme/widgets"));
    }

    #[test]
    fn test_merge_rejects_different_scope() {
        let existing = config("acme/widgets", &["push"]);
        let requested = config("acme/gadgets", &["push"]);
        assert!(matches!(
            SupersetPolicy.merge(&existing, &requested),
            Err(SubscriptionError::SubscriptionConflict { .. })
        ));
    }
}

mod exact_events_policy_tests {
    use super::*;

    #[test]
    fn test_only_identical_sets_are_equivalent() {
        let existing = config("acme/widgets", &["push", "release"]);

        assert!(ExactEventsPolicy.equivalent(&existing, &config("acme/widgets", &["push", "release"])));
        assert!(!ExactEventsPolicy.equivalent(&existing, &config("acme/widgets", &["push"])));
    }

    #[test]
    fn test_merge_keeps_union() {
        let existing = config("acme/widgets", &["push", "release"]);
        let merged = ExactEventsPolicy
            .merge(&existing, &config("acme/widgets", &["push"]))
            .unwrap();
        assert_eq!(merged.events, existing.events);
    }
}

mod scope_key_policy_tests {
    use super::*;

    #[test]
    fn test_secondary_key_must_match() {
        let existing = config("team-1", &["Issue"]).with_secondary_key("all-public-teams");
        let same = config("team-1", &["Issue"]).with_secondary_key("all-public-teams");
        let other = config("team-1", &["Issue"]);

        assert!(ScopeKeyPolicy.equivalent(&existing, &same));
        assert!(!ScopeKeyPolicy.equivalent(&existing, &other));
    }

    #[test]
    fn test_merge_with_different_key_conflicts() {
        let existing = config("team-1", &["Issue"]).with_secondary_key("a");
        let requested = config("team-1", &["Comment"]).with_secondary_key("b");

        assert!(matches!(
            ScopeKeyPolicy.merge(&existing, &requested),
            Err(SubscriptionError::SubscriptionConflict { .. })
        ));
    }

    #[test]
    fn test_merge_with_same_key_unions_events() {
        let existing = config("team-1", &["Issue"]).with_secondary_key("a");
        let requested = config("team-1", &["Comment"]).with_secondary_key("a");

        let merged = ScopeKeyPolicy.merge(&existing, &requested).unwrap();
        assert_eq!(merged.events, EventSet::from_iter(["Comment", "Issue"]));
        assert_eq!(merged.secondary_key.as_deref(), Some("a"));
    }
}

mod registry_tests {
    use super::*;

    #[test]
    fn test_unregistered_provider_uses_superset() {
        let registry = PolicyRegistry::new();
        let policy = registry.policy_for(&ProviderId::new("circleci").unwrap());
        assert_eq!(policy.name(), "superset");
    }

    #[test]
    fn test_registered_policy_is_returned() {
        let github = ProviderId::new("github").unwrap();
        let registry = PolicyRegistry::new().with_policy(github.clone(), PolicyKind::ExactEvents.build());

        assert_eq!(registry.policy_for(&github).name(), "exact_events");
        assert_eq!(
            registry
                .policy_for(&ProviderId::new("linear").unwrap())
                .name(),
            "superset"
        );
    }

    #[test]
    fn test_policy_kind_deserializes_snake_case() {
        let kind: PolicyKind = serde_yaml::from_str("scope_key").unwrap();
        assert_eq!(kind, PolicyKind::ScopeKey);
    }
}
