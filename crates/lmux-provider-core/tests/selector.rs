use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lmux_provider_core::{
    Auth, PickError, PickOptions, QuotaManager, Selector, StickyStore,
};

fn selector_with_quota() -> (Selector, Arc<QuotaManager>) {
    let quota = Arc::new(QuotaManager::default());
    let selector = Selector::new(Arc::new(StickyStore::new()), quota.clone());
    (selector, quota)
}

fn auths(provider: &str, ids: &[&str]) -> Vec<Auth> {
    ids.iter().map(|id| Auth::new(provider, *id)).collect()
}

#[test]
fn force_rotate_spreads_over_all_auths() {
    let (selector, _) = selector_with_quota();
    let candidates = auths("claude", &["c1", "c2", "c3"]);
    let options = PickOptions {
        force_rotate: true,
        fingerprint: None,
    };

    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut last = String::new();
    let mut consecutive = 0u32;
    let mut max_consecutive = 0u32;
    for _ in 0..9 {
        let picked = selector
            .pick("claude", "claude-sonnet-4-5", &options, &candidates)
            .unwrap();
        if picked.id == last {
            consecutive += 1;
        } else {
            consecutive = 1;
            last = picked.id.clone();
        }
        max_consecutive = max_consecutive.max(consecutive);
        *counts.entry(picked.id).or_default() += 1;
    }

    assert_eq!(counts.len(), 3, "every auth should be used: {counts:?}");
    assert!(max_consecutive < 9, "one auth must not monopolize");
}

#[test]
fn quota_hit_falls_over_to_the_other_auth() {
    let (selector, quota) = selector_with_quota();
    let candidates = auths("claude", &["c1", "c2"]);
    let options = PickOptions {
        force_rotate: true,
        fingerprint: None,
    };

    let first = selector
        .pick("claude", "claude-sonnet-4-5", &options, &candidates)
        .unwrap();
    quota.record_quota_hit(
        &first.id,
        "claude",
        "claude-sonnet-4-5",
        Some(Duration::from_secs(3 * 3600)),
    );

    let second = selector
        .pick("claude", "claude-sonnet-4-5", &options, &candidates)
        .unwrap();
    assert_ne!(second.id, first.id);

    quota.record_quota_hit(
        &second.id,
        "claude",
        "claude-sonnet-4-5",
        Some(Duration::from_secs(3 * 3600)),
    );
    let err = selector
        .pick("claude", "claude-sonnet-4-5", &options, &candidates)
        .unwrap_err();
    match err {
        PickError::Cooling { retry_after } => {
            let secs = retry_after.as_secs();
            assert!(
                (3 * 3600 - 5..=3 * 3600).contains(&secs),
                "retry-after should be about three hours, got {secs}"
            );
        }
        other => panic!("expected cooling, got {other:?}"),
    }
}

#[test]
fn sticky_fingerprint_keeps_the_same_auth() {
    let (selector, _) = selector_with_quota();
    let candidates = auths("gemini", &["g1", "g2"]);
    let sticky_options = PickOptions {
        force_rotate: false,
        fingerprint: Some("client-k".to_string()),
    };

    let first = selector
        .pick("gemini", "gemini-2.5-pro", &sticky_options, &candidates)
        .unwrap();
    let second = selector
        .pick("gemini", "gemini-2.5-pro", &sticky_options, &candidates)
        .unwrap();
    assert_eq!(first.id, second.id);

    // Forced rotation may pick anything, and must not clear the committed
    // affinity for later non-rotating calls.
    let _ = selector
        .pick(
            "gemini",
            "gemini-2.5-pro",
            &PickOptions {
                force_rotate: true,
                fingerprint: Some("client-k".to_string()),
            },
            &candidates,
        )
        .unwrap();

    let fourth = selector
        .pick("gemini", "gemini-2.5-pro", &sticky_options, &candidates)
        .unwrap();
    assert!(candidates.iter().any(|auth| auth.id == fourth.id));
}

#[test]
fn picked_auth_is_always_pickable() {
    let (selector, quota) = selector_with_quota();
    let mut candidates = auths("claude", &["c1", "c2", "c3", "c4"]);
    candidates[1].disabled = true;
    quota.record_quota_hit("c3", "claude", "m", Some(Duration::from_secs(600)));

    let now = time::OffsetDateTime::now_utc();
    for _ in 0..20 {
        let picked = selector
            .pick(
                "claude",
                "m",
                &PickOptions {
                    force_rotate: true,
                    fingerprint: None,
                },
                &candidates,
            )
            .unwrap();
        assert!(
            picked
                .pickable_for("m", now, quota.cooldown_until(&picked.id))
                .is_ok()
        );
        assert_ne!(picked.id, "c2");
        assert_ne!(picked.id, "c3");
    }
}

#[test]
fn antigravity_ignores_sticky_affinity() {
    let (selector, _) = selector_with_quota();
    let candidates = auths("antigravity", &["a1", "a2", "a3"]);
    let options = PickOptions {
        force_rotate: false,
        fingerprint: Some("same-client".to_string()),
    };

    let mut seen: HashMap<String, u32> = HashMap::new();
    for _ in 0..9 {
        let picked = selector
            .pick("antigravity", "gemini-3-pro", &options, &candidates)
            .unwrap();
        *seen.entry(picked.id).or_default() += 1;
    }
    assert!(
        seen.len() > 1,
        "sticky disabled means rotation even with a fingerprint: {seen:?}"
    );
}
