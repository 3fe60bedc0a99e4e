//! Model registry: resolves model names and aliases to adapters.

use std::sync::Arc;

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backends::{
    AnthropicBackend, Backend, GenerationParams, GuardedBackend, OllamaBackend, OpenAIBackend,
    Provider, QuotaRegistry,
};
use crate::config::{BackendsConfig, ModelEntry};

/// Immutable description of a resolved model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Registered name.
    pub name: String,
    /// Provider family.
    pub provider: Provider,
    /// Identifier sent to the provider.
    pub model_id: String,
    /// Context window in tokens.
    pub context_window_tokens: usize,
    /// Default sampling parameters.
    pub generation: GenerationParams,
}

impl ModelSpec {
    /// Creates a spec with default generation parameters.
    pub fn new(name: impl Into<String>, provider: Provider, context_window_tokens: usize) -> Self {
        let name = name.into();
        Self {
            model_id: name.clone(),
            name,
            provider,
            context_window_tokens,
            generation: GenerationParams::default(),
        }
    }

    fn from_entry(entry: &ModelEntry) -> Self {
        Self {
            name: entry.name().clone(),
            provider: *entry.provider(),
            model_id: entry.resolved_model_id().to_string(),
            context_window_tokens: *entry.context_window_tokens(),
            generation: entry.generation(),
        }
    }
}

/// A model spec bound to the adapter instance that serves it.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    spec: ModelSpec,
    aliases: Vec<String>,
    backend: Arc<dyn Backend>,
}

impl ResolvedModel {
    /// Binds `spec` to `backend`.
    pub fn new(spec: ModelSpec, backend: Arc<dyn Backend>) -> Self {
        Self {
            spec,
            aliases: Vec::new(),
            backend,
        }
    }

    /// Adds an alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Returns the spec.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Returns the adapter.
    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    /// Returns the aliases.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    fn answers_to(&self, name: &str) -> bool {
        self.spec.name == name || self.aliases.iter().any(|a| a == name)
    }
}

/// Explicit registry of the models available to one run.
///
/// Built once before any episode starts and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<ResolvedModel>>,
    quotas: QuotaRegistry,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the same name is already registered for
    /// the same provider.
    #[instrument(skip(self, model), fields(name = %model.spec().name, provider = %model.spec().provider))]
    pub fn register(&mut self, model: ResolvedModel) -> Result<(), RegistryError> {
        let duplicate = self.models.iter().any(|m| {
            m.spec.name == model.spec.name && m.spec.provider == model.spec.provider
        });
        if duplicate {
            warn!("Duplicate model registration");
            return Err(RegistryError::new(RegistryErrorKind::Duplicate(format!(
                "{} ({})",
                model.spec.name, model.spec.provider
            ))));
        }
        debug!("Registered model");
        self.models.push(Arc::new(model));
        Ok(())
    }

    /// Builds one guarded adapter per configured model.
    ///
    /// Adapters of the same provider share one rate limiter and one set of
    /// usage counters.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if credentials are missing, an adapter cannot
    /// be built, or a name is registered twice for one provider.
    #[instrument(skip(config), fields(models = config.models().len()))]
    pub fn from_config(config: &BackendsConfig) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for entry in config.models() {
            let adapter = registry.build_adapter(entry)?;
            let mut model = ResolvedModel::new(ModelSpec::from_entry(entry), adapter);
            for alias in entry.aliases() {
                model = model.with_alias(alias.clone());
            }
            registry.register(model)?;
        }
        info!(count = registry.models.len(), "Model registry loaded");
        Ok(registry)
    }

    fn build_adapter(&self, entry: &ModelEntry) -> Result<Arc<dyn Backend>, RegistryError> {
        let credential = match entry.credential_env() {
            Some(var) => match std::env::var(var) {
                Ok(value) => Some(value),
                Err(_) if *entry.provider() == Provider::OpenAICompatible => None,
                Err(_) => {
                    return Err(RegistryError::new(RegistryErrorKind::MissingCredentials(
                        format!("{} environment variable not set for '{}'", var, entry.name()),
                    )));
                }
            },
            None => None,
        };

        let model_id = entry.resolved_model_id().to_string();
        let window = *entry.context_window_tokens();
        let build_failed =
            |e: crate::backends::BackendError| RegistryError::new(RegistryErrorKind::Adapter(e.to_string()));

        let inner: Arc<dyn Backend> = match entry.provider() {
            Provider::OpenAI => Arc::new(OpenAIBackend::new(
                credential.unwrap_or_default(),
                model_id,
                window,
            )),
            Provider::OpenAICompatible => Arc::new(OpenAIBackend::compatible(
                entry.endpoint().clone().unwrap_or_default(),
                credential,
                model_id,
                window,
            )),
            Provider::Anthropic => Arc::new(
                AnthropicBackend::new(
                    credential.unwrap_or_default(),
                    model_id,
                    entry.endpoint().clone(),
                    window,
                    entry.timeout(),
                )
                .map_err(build_failed)?,
            ),
            Provider::Ollama => Arc::new(
                OllamaBackend::new(model_id, entry.endpoint().clone(), window, entry.timeout())
                    .map_err(build_failed)?,
            ),
            Provider::Programmatic | Provider::Scripted => {
                return Err(RegistryError::new(RegistryErrorKind::Adapter(format!(
                    "'{}': {} models are registered in code, not configuration",
                    entry.name(),
                    entry.provider()
                ))));
            }
        };

        let provider = *entry.provider();
        let guarded = GuardedBackend::new(inner, entry.timeout())
            .with_limiter(self.quotas.limiter(provider, *entry.requests_per_minute()))
            .with_usage(self.quotas.usage(provider));
        Ok(Arc::new(guarded))
    }

    /// Resolves a name or alias to the first matching model.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] with [`RegistryErrorKind::UnknownModel`] if
    /// nothing matches.
    #[instrument(skip(self))]
    pub fn resolve(&self, name: &str) -> Result<Arc<ResolvedModel>, RegistryError> {
        self.models
            .iter()
            .find(|m| m.answers_to(name))
            .cloned()
            .ok_or_else(|| {
                warn!(name, "Unknown model");
                RegistryError::new(RegistryErrorKind::UnknownModel(name.to_string()))
            })
    }

    /// Resolves a name or alias served by a specific provider.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if no model of that provider matches.
    #[instrument(skip(self))]
    pub fn resolve_with_provider(
        &self,
        name: &str,
        provider: Provider,
    ) -> Result<Arc<ResolvedModel>, RegistryError> {
        self.models
            .iter()
            .find(|m| m.spec.provider == provider && m.answers_to(name))
            .cloned()
            .ok_or_else(|| {
                RegistryError::new(RegistryErrorKind::UnknownModel(format!(
                    "{} ({})",
                    name, provider
                )))
            })
    }

    /// Returns the specs of all registered models, in registration order.
    pub fn models(&self) -> Vec<&ModelSpec> {
        self.models.iter().map(|m| &m.spec).collect()
    }

    /// Returns the shared per-provider quotas.
    pub fn quotas(&self) -> &QuotaRegistry {
        &self.quotas
    }
}

/// Registry failure kinds.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum RegistryErrorKind {
    /// No registered model answers to the name.
    #[display("unknown model: {_0}")]
    UnknownModel(String),
    /// Name already registered for the provider.
    #[display("duplicate model: {_0}")]
    Duplicate(String),
    /// Credentials missing from the environment.
    #[display("missing credentials: {_0}")]
    MissingCredentials(String),
    /// Adapter could not be constructed.
    #[display("adapter construction failed: {_0}")]
    Adapter(String),
}

/// Registry error with location tracking.
#[derive(Debug, Clone, Display, Error)]
#[display("Registry error: {} at {}:{}", kind, file, line)]
pub struct RegistryError {
    /// What went wrong.
    pub kind: RegistryErrorKind,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl RegistryError {
    /// Creates a new registry error.
    #[track_caller]
    pub fn new(kind: RegistryErrorKind) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            line: loc.line(),
            file: loc.file(),
        }
    }
}
