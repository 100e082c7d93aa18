//! Model and pricing catalog.
//!
//! The catalog is keyed by provider name. Each provider lists its models by
//! display name and API value, with pricing in USD per million tokens. A
//! built-in table covers the supported providers; user configuration may
//! override or extend it.

use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Price per million tokens, in USD
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
}

impl Pricing {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Cost in USD of the given usage
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output
    }
}

/// A model offered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Human-readable name
    pub name: String,
    /// Identifier sent to the API
    pub value: String,
    #[serde(default)]
    pub pricing: Pricing,
}

/// The models of one provider and its default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderModels {
    pub default: String,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl ProviderModels {
    pub fn find(&self, value: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.value == value)
    }
}

/// Provider-keyed model and pricing table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelCatalog {
    providers: BTreeMap<String, ProviderModels>,
}

struct BuiltinModel {
    provider: &'static str,
    name: &'static str,
    value: &'static str,
    pricing: Pricing,
}

const BUILTIN_DEFAULTS: &[(&str, &str)] = &[
    ("openai", "gpt-4o-mini"),
    ("anthropic", "claude-sonnet-4-5-20250929"),
    ("groq", "llama-3.3-70b-versatile"),
    ("openrouter", "openai/gpt-4o-mini"),
    ("ollama", "llama3.2"),
];

const BUILTIN_MODELS: &[BuiltinModel] = &[
    BuiltinModel {
        provider: "openai",
        name: "GPT-4o mini",
        value: "gpt-4o-mini",
        pricing: Pricing::new(0.15, 0.60),
    },
    BuiltinModel {
        provider: "openai",
        name: "GPT-4o",
        value: "gpt-4o",
        pricing: Pricing::new(2.50, 10.00),
    },
    BuiltinModel {
        provider: "openai",
        name: "GPT-4.1",
        value: "gpt-4.1",
        pricing: Pricing::new(2.00, 8.00),
    },
    BuiltinModel {
        provider: "openai",
        name: "GPT-4.1 mini",
        value: "gpt-4.1-mini",
        pricing: Pricing::new(0.40, 1.60),
    },
    BuiltinModel {
        provider: "anthropic",
        name: "Claude Sonnet 4.5",
        value: "claude-sonnet-4-5-20250929",
        pricing: Pricing::new(3.00, 15.00),
    },
    BuiltinModel {
        provider: "anthropic",
        name: "Claude Haiku 4.5",
        value: "claude-haiku-4-5-20251001",
        pricing: Pricing::new(1.00, 5.00),
    },
    BuiltinModel {
        provider: "groq",
        name: "Llama 3.3 70B",
        value: "llama-3.3-70b-versatile",
        pricing: Pricing::new(0.59, 0.79),
    },
    BuiltinModel {
        provider: "openrouter",
        name: "GPT-4o mini (OpenRouter)",
        value: "openai/gpt-4o-mini",
        pricing: Pricing::new(0.15, 0.60),
    },
    BuiltinModel {
        provider: "ollama",
        name: "Llama 3.2 (local)",
        value: "llama3.2",
        pricing: Pricing::new(0.0, 0.0),
    },
];

impl ModelCatalog {
    /// The built-in per-provider defaults
    pub fn builtin() -> Self {
        let mut providers: BTreeMap<String, ProviderModels> = BUILTIN_DEFAULTS
            .iter()
            .map(|(provider, default)| {
                (
                    provider.to_string(),
                    ProviderModels {
                        default: default.to_string(),
                        models: Vec::new(),
                    },
                )
            })
            .collect();

        for model in BUILTIN_MODELS {
            if let Some(entry) = providers.get_mut(model.provider) {
                entry.models.push(ModelEntry {
                    name: model.name.to_string(),
                    value: model.value.to_string(),
                    pricing: model.pricing,
                });
            }
        }

        Self { providers }
    }

    /// Layer configured providers over this catalog.
    ///
    /// A configured provider replaces the default model; its models replace
    /// entries with the same value and are otherwise appended.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, ProviderModels>) -> Self {
        for (provider, configured) in overrides {
            match self.providers.get_mut(&provider) {
                Some(existing) => {
                    existing.default = configured.default;
                    for model in configured.models {
                        match existing.models.iter_mut().find(|m| m.value == model.value) {
                            Some(slot) => *slot = model,
                            None => existing.models.push(model),
                        }
                    }
                }
                None => {
                    self.providers.insert(provider, configured);
                }
            }
        }
        self
    }

    pub fn provider(&self, provider: &str) -> Option<&ProviderModels> {
        self.providers.get(provider)
    }

    /// Names of all providers in the catalog
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// The default model value for a provider
    pub fn default_model(&self, provider: &str) -> Option<&str> {
        self.providers.get(provider).map(|p| p.default.as_str())
    }

    /// Look up a model by provider and API value
    pub fn lookup(&self, provider: &str, value: &str) -> Option<&ModelEntry> {
        self.providers.get(provider).and_then(|p| p.find(value))
    }

    /// Pricing for a model; unknown models are free
    pub fn pricing(&self, provider: &str, value: &str) -> Pricing {
        match self.lookup(provider, value) {
            Some(entry) => entry.pricing,
            None => {
                tracing::debug!("No pricing for {}/{}, assuming zero cost", provider, value);
                Pricing::default()
            }
        }
    }
}
