use crate::error::Error;
use crate::stream::StreamEvent;
use futures::Stream;
use std::pin::Pin;

/// A live streaming response from a language model.
///
/// Consume it event-by-event via [`events()`](Response::events).
pub struct Response {
    inner: Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>,
}

impl Response {
    pub fn new(stream: impl Stream<Item = Result<StreamEvent, Error>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// A response that fails immediately, for backends that cannot even
    /// start a request.
    pub fn error(err: Error) -> Self {
        Self::new(futures::stream::once(async move { Err(err) }))
    }

    /// Consume the response as an async stream of events.
    pub fn events(self) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>> {
        self.inner
    }
}
