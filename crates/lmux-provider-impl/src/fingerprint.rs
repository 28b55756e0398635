//! Outgoing client identity. Subscription upstreams profile the CLI that
//! talks to them, so each credential presents one consistent user-agent /
//! platform / version triple, chosen by `fnv32a(auth_id) mod N` — stable per
//! auth id, untouched by key rotation.

use lmux_common::fnv32a;
use lmux_provider_core::{Headers, header_set};

#[derive(Debug, Clone, Copy)]
pub struct FingerprintPreset {
    pub user_agent: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
    pub runtime_version: &'static str,
    pub package_version: &'static str,
}

const PRESETS: &[FingerprintPreset] = &[
    FingerprintPreset {
        user_agent: "claude-cli/2.0.62 (external, cli)",
        os: "MacOS",
        arch: "arm64",
        runtime_version: "v22.14.0",
        package_version: "2.0.62",
    },
    FingerprintPreset {
        user_agent: "claude-cli/2.0.59 (external, cli)",
        os: "MacOS",
        arch: "arm64",
        runtime_version: "v20.18.1",
        package_version: "2.0.59",
    },
    FingerprintPreset {
        user_agent: "claude-cli/2.0.62 (external, cli)",
        os: "Linux",
        arch: "x64",
        runtime_version: "v22.11.0",
        package_version: "2.0.62",
    },
    FingerprintPreset {
        user_agent: "claude-cli/2.0.55 (external, cli)",
        os: "Linux",
        arch: "x64",
        runtime_version: "v20.17.0",
        package_version: "2.0.55",
    },
    FingerprintPreset {
        user_agent: "claude-cli/2.0.62 (external, cli)",
        os: "Windows",
        arch: "x64",
        runtime_version: "v22.14.0",
        package_version: "2.0.62",
    },
    FingerprintPreset {
        user_agent: "claude-cli/2.0.59 (external, cli)",
        os: "MacOS",
        arch: "x64",
        runtime_version: "v20.18.1",
        package_version: "2.0.59",
    },
];

pub fn preset_for(auth_id: &str) -> &'static FingerprintPreset {
    &PRESETS[fnv32a(auth_id.as_bytes()) as usize % PRESETS.len()]
}

/// Stainless-style client headers the Anthropic stack expects from its CLI.
pub fn apply_cli_headers(headers: &mut Headers, auth_id: &str) {
    let preset = preset_for(auth_id);
    header_set(headers, "User-Agent", preset.user_agent);
    header_set(headers, "x-stainless-os", preset.os);
    header_set(headers, "x-stainless-arch", preset.arch);
    header_set(headers, "x-stainless-lang", "js");
    header_set(headers, "x-stainless-runtime", "node");
    header_set(headers, "x-stainless-runtime-version", preset.runtime_version);
    header_set(headers, "x-stainless-package-version", preset.package_version);
    header_set(headers, "x-app", "cli");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_is_stable_per_auth_id() {
        let a = preset_for("auth-1") as *const _;
        for _ in 0..10 {
            assert!(std::ptr::eq(a, preset_for("auth-1")));
        }
    }

    #[test]
    fn different_ids_spread_over_presets() {
        let mut distinct = std::collections::HashSet::new();
        for i in 0..64 {
            let preset = preset_for(&format!("auth-{i}"));
            distinct.insert(preset.user_agent.to_string() + preset.os);
        }
        assert!(distinct.len() > 1);
    }
}
