pub mod error;
pub mod model;
pub mod provider;
pub mod request;
pub mod response;
pub mod stream;

pub use error::Error;
pub use model::{LanguageModel, LanguageModelBackend};
pub use provider::{LanguageModelProvider, LanguageModelProviderBackend};
pub use request::{
    AssistantPart, GenerateRequest, ImagePart, Message, RequestBuilder, TextPart, UserPart,
    request,
};
pub use response::Response;
pub use stream::{FinishReason, StreamEvent, Usage};
pub use tokio_util::sync::CancellationToken;
