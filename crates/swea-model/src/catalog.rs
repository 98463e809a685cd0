// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// Pricing and context metadata for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelCatalogEntry {
    pub id: &'static str,
    /// Name sent on the wire (may differ from the configured id).
    pub api_name: &'static str,
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,
    pub context_window: u32,
}

/// User-facing shortcuts resolved before the catalog lookup.
const SHORTCUTS: &[(&str, &str)] = &[
    ("gpt4", "gpt-4"),
    ("gpt4-turbo", "gpt-4-1106-preview"),
    ("gpt35", "gpt-3.5-turbo-16k-0613"),
    ("opus", "claude-3-opus-20240229"),
    ("sonnet", "claude-3-sonnet-20240229"),
];

const CATALOG: &[ModelCatalogEntry] = &[
    ModelCatalogEntry {
        id: "gpt-4",
        api_name: "gpt-4",
        cost_per_input_token: 3e-05,
        cost_per_output_token: 6e-05,
        context_window: 8_192,
    },
    ModelCatalogEntry {
        id: "gpt-4-turbo",
        api_name: "gpt-4-turbo",
        cost_per_input_token: 1e-05,
        cost_per_output_token: 3e-05,
        context_window: 128_000,
    },
    ModelCatalogEntry {
        id: "gpt-4-1106-preview",
        api_name: "gpt-4-1106-preview",
        cost_per_input_token: 1e-05,
        cost_per_output_token: 3e-05,
        context_window: 128_000,
    },
    ModelCatalogEntry {
        id: "gpt-3.5-turbo-16k-0613",
        api_name: "gpt-3.5-turbo-16k-0613",
        cost_per_input_token: 1.5e-06,
        cost_per_output_token: 2e-06,
        context_window: 16_385,
    },
    ModelCatalogEntry {
        id: "claude-2",
        api_name: "claude-2",
        cost_per_input_token: 1.102e-05,
        cost_per_output_token: 3.268e-05,
        context_window: 100_000,
    },
    ModelCatalogEntry {
        id: "claude-3-opus-20240229",
        api_name: "claude-3-opus-20240229",
        cost_per_input_token: 1.5e-05,
        cost_per_output_token: 7.5e-05,
        context_window: 200_000,
    },
    ModelCatalogEntry {
        id: "claude-3-sonnet-20240229",
        api_name: "claude-3-sonnet-20240229",
        cost_per_input_token: 3e-06,
        cost_per_output_token: 1.5e-05,
        context_window: 200_000,
    },
    ModelCatalogEntry {
        id: "claude-3-5-sonnet-20241022",
        api_name: "claude-3-5-sonnet-20241022",
        cost_per_input_token: 3e-06,
        cost_per_output_token: 1.5e-05,
        context_window: 200_000,
    },
];

/// Resolve a configured model name to its catalog entry.
///
/// Handles shortcuts plus the `ft:<base>:…` and `azure:<model>` prefixes
/// (priced as the underlying base model).  Unknown models — including every
/// `ollama:` model — return `None`; callers treat that as zero-cost with a
/// logged warning.
pub fn lookup(name: &str) -> Option<&'static ModelCatalogEntry> {
    let resolved = SHORTCUTS
        .iter()
        .find(|(short, _)| *short == name)
        .map(|(_, full)| *full)
        .unwrap_or(name);
    let resolved = resolved
        .strip_prefix("azure:")
        .unwrap_or(resolved);
    let resolved = match resolved.strip_prefix("ft:") {
        Some(rest) => rest.split(':').next().unwrap_or(rest),
        None => resolved,
    };
    CATALOG.iter().find(|e| e.id == resolved)
}

/// Cost of one call, `0.0` for models without catalog pricing.
pub fn cost_for(name: &str, tokens_sent: u64, tokens_received: u64) -> f64 {
    match lookup(name) {
        Some(entry) => {
            entry.cost_per_input_token * tokens_sent as f64
                + entry.cost_per_output_token * tokens_received as f64
        }
        None => 0.0,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
