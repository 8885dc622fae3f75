use std::fmt;

use crate::model::LanguageModel;

/// A source of models, such as one hosted API or a local runtime.
///
/// Conversations only store a model id; the provider turns it back into a
/// [`LanguageModel`] each time a reply is generated.
pub struct LanguageModelProvider {
    inner: Box<dyn LanguageModelProviderBackend>,
}

impl LanguageModelProvider {
    pub fn new(backend: impl LanguageModelProviderBackend + 'static) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    /// The provider name (e.g. `"openai"`, `"ollama"`).
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Resolve `model_id` to a model handle. Unknown ids are reported by the
    /// model's response stream, not here.
    pub fn model(&self, model_id: &str) -> LanguageModel {
        self.inner.model(model_id)
    }
}

impl fmt::Debug for LanguageModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageModelProvider")
            .field("name", &self.name())
            .finish()
    }
}

/// Trait that provider crates implement.
pub trait LanguageModelProviderBackend: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self, model_id: &str) -> LanguageModel;
}
