//! Canonical model names → provider routes.
//!
//! The table is read-only after boot; thread safety by immutability. A
//! canonical name missing from the table means every provider uses it
//! verbatim, so only divergent or multi-provider names need rows.

use rand::seq::SliceRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRoute {
    pub provider: &'static str,
    pub upstream_id: &'static str,
    /// Lower wins; equal priorities are shuffled for load distribution.
    pub priority: u8,
}

const FAMILY_TABLE: &[(&str, &[ModelRoute])] = &[
    (
        "claude-opus-4-5",
        &[ModelRoute {
            provider: "claude",
            upstream_id: "claude-opus-4-5-20251101",
            priority: 0,
        }],
    ),
    (
        "claude-sonnet-4-5",
        &[ModelRoute {
            provider: "claude",
            upstream_id: "claude-sonnet-4-5-20250929",
            priority: 0,
        }],
    ),
    (
        "claude-haiku-4-5",
        &[ModelRoute {
            provider: "claude",
            upstream_id: "claude-haiku-4-5-20251001",
            priority: 0,
        }],
    ),
    (
        "gemini-2.5-pro",
        &[
            ModelRoute {
                provider: "gemini",
                upstream_id: "gemini-2.5-pro",
                priority: 0,
            },
            ModelRoute {
                provider: "antigravity",
                upstream_id: "gemini-2.5-pro",
                priority: 1,
            },
        ],
    ),
    (
        "gemini-2.5-flash",
        &[
            ModelRoute {
                provider: "gemini",
                upstream_id: "gemini-2.5-flash",
                priority: 0,
            },
            ModelRoute {
                provider: "antigravity",
                upstream_id: "gemini-2.5-flash",
                priority: 1,
            },
        ],
    ),
    (
        "gemini-3-pro",
        &[
            ModelRoute {
                provider: "antigravity",
                upstream_id: "gemini-3-pro-preview",
                priority: 0,
            },
            ModelRoute {
                provider: "gemini",
                upstream_id: "gemini-3-pro-preview",
                priority: 0,
            },
        ],
    ),
    (
        "gpt-5",
        &[
            ModelRoute {
                provider: "codex",
                upstream_id: "gpt-5",
                priority: 0,
            },
            ModelRoute {
                provider: "copilot",
                upstream_id: "gpt-5",
                priority: 1,
            },
        ],
    ),
    (
        "gpt-5-codex",
        &[ModelRoute {
            provider: "codex",
            upstream_id: "gpt-5-codex",
            priority: 0,
        }],
    ),
    (
        "gpt-4o",
        &[ModelRoute {
            provider: "copilot",
            upstream_id: "gpt-4o",
            priority: 0,
        }],
    ),
    (
        "qwen3-coder",
        &[ModelRoute {
            provider: "qwen",
            upstream_id: "qwen3-coder-plus",
            priority: 0,
        }],
    ),
    (
        "qwen3-max",
        &[ModelRoute {
            provider: "iflow",
            upstream_id: "qwen3-max",
            priority: 0,
        }],
    ),
];

/// Routes for a canonical name, priority ascending; equal-priority runs are
/// shuffled so identical scores do not pin one provider.
pub fn resolve(canonical: &str) -> Vec<ModelRoute> {
    let Some((_, routes)) = FAMILY_TABLE
        .iter()
        .find(|(name, _)| *name == canonical)
    else {
        return Vec::new();
    };
    let mut routes = routes.to_vec();
    routes.sort_by_key(|route| route.priority);

    let mut rng = rand::rng();
    let mut start = 0;
    while start < routes.len() {
        let priority = routes[start].priority;
        let end = routes[start..]
            .iter()
            .position(|route| route.priority != priority)
            .map(|offset| start + offset)
            .unwrap_or(routes.len());
        routes[start..end].shuffle(&mut rng);
        start = end;
    }
    routes
}

/// Every canonical name the table knows, for model-list endpoints.
pub fn canonical_models() -> Vec<&'static str> {
    FAMILY_TABLE.iter().map(|(name, _)| *name).collect()
}

/// Providers a canonical name can route to; empty means "any provider,
/// verbatim id".
pub fn providers_for(canonical: &str) -> Vec<&'static str> {
    resolve(canonical)
        .into_iter()
        .map(|route| route.provider)
        .collect()
}

/// A `-reasoning` suffix asks for dynamic thinking without naming a budget.
pub fn split_reasoning_suffix(model: &str) -> (&str, bool) {
    match model.strip_suffix("-reasoning") {
        Some(base) => (base, true),
        None => (model, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn priority_order_is_stable() {
        for _ in 0..50 {
            let routes = resolve("gemini-2.5-pro");
            assert_eq!(routes[0].provider, "gemini");
            assert_eq!(routes[1].provider, "antigravity");
        }
    }

    #[test]
    fn equal_priorities_are_covered_roughly_uniformly() {
        let mut first: HashMap<&str, u32> = HashMap::new();
        let runs = 2000;
        for _ in 0..runs {
            let routes = resolve("gemini-3-pro");
            *first.entry(routes[0].provider).or_default() += 1;
        }
        // Two equal-priority routes; each should lead within ±15% of half.
        for (_, count) in first {
            let share = count as f64 / runs as f64;
            assert!((share - 0.5).abs() < 0.15, "share {share} out of range");
        }
    }

    #[test]
    fn unknown_model_resolves_to_empty() {
        assert!(resolve("mystery-model").is_empty());
    }

    #[test]
    fn reasoning_suffix_splits() {
        assert_eq!(
            split_reasoning_suffix("gemini-2.5-pro-reasoning"),
            ("gemini-2.5-pro", true)
        );
        assert_eq!(
            split_reasoning_suffix("gemini-2.5-pro"),
            ("gemini-2.5-pro", false)
        );
    }
}
