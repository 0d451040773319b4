use crate::error::TbResult;

/// An opaque text-completion service: prompt in, generated text out.
///
/// Implementations hold no conversation memory; every call carries the
/// full context in `prompt`.
pub trait TextCompletion: Send + Sync {
    fn generate_text(&self, prompt: &str) -> TbResult<String>;
}

impl<T: TextCompletion + ?Sized> TextCompletion for std::sync::Arc<T> {
    fn generate_text(&self, prompt: &str) -> TbResult<String> {
        (**self).generate_text(prompt)
    }
}

impl<T: TextCompletion + ?Sized> TextCompletion for &T {
    fn generate_text(&self, prompt: &str) -> TbResult<String> {
        (**self).generate_text(prompt)
    }
}
