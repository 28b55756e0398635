use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use lmux_provider_core::QuotaManager;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matched_start_end_pairs_leave_zero_active() {
    let manager = Arc::new(QuotaManager::default());

    let mut handles = Vec::new();
    for worker in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                let ticket = manager.begin("a1", "claude");
                tokio::task::yield_now().await;
                if (worker + i) % 3 == 0 {
                    // Simulated abandoned path: drop without finish.
                    drop(ticket);
                } else {
                    ticket.finish(10, false);
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.state("a1").active_requests(), 0);
}

#[test]
fn explicit_cooldown_lands_within_a_second() {
    let manager = QuotaManager::default();
    let before = OffsetDateTime::now_utc();
    manager.record_quota_hit("a1", "gemini", "gemini-2.5-pro", Some(Duration::from_secs(1800)));

    let until = manager.cooldown_until("a1").expect("cooldown set");
    let expected = before + Duration::from_secs(1800);
    assert!(until >= expected - Duration::from_secs(1));
    assert!(until <= expected + Duration::from_secs(2));
}

#[test]
fn success_clears_cooldown_and_keeps_learned() {
    let manager = QuotaManager::default();
    manager.record_quota_hit("a1", "copilot", "gpt-4o", Some(Duration::from_secs(120)));
    assert!(manager.cooldown_until("a1").is_some());

    let ticket = manager.begin("a1", "copilot");
    ticket.finish(50, false);

    assert!(manager.cooldown_until("a1").is_none());
    assert_eq!(
        manager.state("a1").learned_cooldown(),
        Some(Duration::from_secs(120))
    );
}

#[test]
fn failed_finish_does_not_clear_cooldown() {
    let manager = QuotaManager::default();
    manager.record_quota_hit("a1", "claude", "m", Some(Duration::from_secs(600)));

    let ticket = manager.begin("a1", "claude");
    ticket.finish(0, true);
    assert!(manager.cooldown_until("a1").is_some());
}

#[test]
fn learned_value_seeds_next_implicit_hit() {
    let manager = QuotaManager::default();
    manager.record_quota_hit("a1", "qwen", "qwen3-coder", Some(Duration::from_secs(240)));
    let ticket = manager.begin("a1", "qwen");
    ticket.finish(1, false);

    // No explicit Retry-After this time.
    let before = OffsetDateTime::now_utc();
    manager.record_quota_hit("a1", "qwen", "qwen3-coder", None);
    let until = manager.cooldown_until("a1").expect("cooldown set");
    let remaining = until - before;
    assert!(remaining >= time::Duration::seconds(239));
    assert!(remaining <= time::Duration::seconds(241));
}

#[test]
fn min_remaining_cooldown_takes_the_soonest() {
    let manager = QuotaManager::default();
    manager.record_quota_hit("a1", "claude", "m", Some(Duration::from_secs(3600)));
    manager.record_quota_hit("a2", "claude", "m", Some(Duration::from_secs(60)));

    let now = OffsetDateTime::now_utc();
    let min = manager
        .min_remaining_cooldown(&["a1".to_string(), "a2".to_string()], now)
        .expect("cooldowns exist");
    assert!(min <= Duration::from_secs(60));
    assert!(min >= Duration::from_secs(55));
}

#[test]
fn token_totals_accumulate() {
    let manager = QuotaManager::default();
    manager.begin("a1", "claude").finish(100, false);
    manager.begin("a1", "claude").finish(250, false);
    assert_eq!(manager.state("a1").total_tokens_used(), 350);
}
