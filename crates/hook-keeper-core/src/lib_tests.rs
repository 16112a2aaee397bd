//! Tests for shared domain types.

use super::*;

mod identifier_tests {
    use super::*;

    #[test]
    fn test_provider_id_accepts_url_safe_names() {
        assert!(ProviderId::new("circleci").is_ok());
        assert!(ProviderId::new("pager_duty-v2").is_ok());
    }

    #[test]
    fn test_provider_id_rejects_invalid_input() {
        assert!(matches!(
            ProviderId::new(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            ProviderId::new("CircleCI"),
            Err(ValidationError::InvalidCharacters { .. })
        ));
        assert!(matches!(
            ProviderId::new("a".repeat(65)),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_scope_rejects_whitespace() {
        assert!(Scope::new("gh/acme/widgets").is_ok());
        assert!(Scope::new("gh/acme widgets").is_err());
        assert!(Scope::new("").is_err());
    }

    #[test]
    fn test_opaque_identifiers_reject_blank() {
        assert!(SubscriberId::new("  ").is_err());
        assert!(ExternalJobKey::new("pipeline-7").is_ok());
        assert_eq!(SubJobId::new("wf-1").unwrap().as_str(), "wf-1");
    }

    /// Identifiers round-trip through serde as plain strings and validate on the way in.
    #[test]
    fn test_identifier_serde_validates() {
        let json = serde_json::to_string(&ProviderId::new("linear").unwrap()).unwrap();
        assert_eq!(json, "\"linear\"");

        let bad: Result<ProviderId, _> = serde_json::from_str("\"Not Valid\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_webhook_id_parses_from_display() {
        let id = WebhookId::new();
        let parsed: WebhookId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<WebhookId>().is_err());
    }

    #[test]
    fn test_execution_ref_generate_unique() {
        assert_ne!(ExecutionRef::generate(), ExecutionRef::generate());
    }
}

mod event_set_tests {
    use super::*;

    #[test]
    fn test_superset_relation() {
        let wide = EventSet::from_iter(["job-completed", "workflow-completed"]);
        let narrow = EventSet::from_iter(["workflow-completed"]);

        assert!(wide.is_superset_of(&narrow));
        assert!(!narrow.is_superset_of(&wide));
        assert!(wide.is_superset_of(&wide));
        assert!(wide.is_superset_of(&EventSet::new()));
    }

    #[test]
    fn test_union_and_missing() {
        let a = EventSet::from_iter(["a", "b"]);
        let b = EventSet::from_iter(["b", "c"]);

        assert_eq!(a.union(&b), EventSet::from_iter(["a", "b", "c"]));
        assert_eq!(a.missing_from(&b), EventSet::from_iter(["c"]));
    }

    #[test]
    fn test_display_is_sorted() {
        let set = EventSet::from_iter(["z", "a"]);
        assert_eq!(set.to_string(), "{a, z}");
    }
}

mod timestamp_tests {
    use super::*;

    #[test]
    fn test_subtract_duration_orders_earlier() {
        let now = Timestamp::now();
        let earlier = now.subtract_duration(Duration::from_secs(90));

        assert!(earlier < now);
        assert_eq!(now.subtract_duration(Duration::ZERO), now);
    }

    #[test]
    fn test_display_is_rfc3339() {
        let rendered = Timestamp::now().to_string();
        assert!(chrono::DateTime::parse_from_rfc3339(&rendered).is_ok(), "{rendered}");
    }
}

mod retry_policy_tests {
    use super::*;

    #[test]
    fn test_first_attempt_has_no_delay() {
        assert_eq!(RetryPolicy::exponential().calculate_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 10.0,
            jitter_enabled: false,
        };
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(5));
        assert_eq!(policy.calculate_delay(8), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential();
        for attempt in 1..6 {
            let delay = policy.calculate_delay(attempt).as_millis() as f64;
            let nominal = 100.0 * 2f64.powi(attempt as i32 - 1);
            assert!(delay >= nominal * 0.74, "attempt {attempt}: {delay}");
            assert!(delay <= nominal * 1.26, "attempt {attempt}: {delay}");
        }
    }
}
