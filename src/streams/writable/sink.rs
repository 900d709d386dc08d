use super::controller::WritableStreamDefaultController;
use crate::streams::StreamResult;
use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use std::future::Future;

/// The destination a [`WritableStream`](super::WritableStream) delivers into.
///
/// Every algorithm is optional: the defaults succeed immediately, and the
/// default `write` discards the chunk. The stream calls at most one of
/// `start`, `write`, `close` and `abort` at a time and waits for the returned
/// future before dispatching the next.
pub trait WritableSink<T: 'static>: Sized + 'static {
    /// The reserved `type` member. Construction fails when this is present.
    fn sink_type(&self) -> Option<&str> {
        None
    }

    /// Start the sink.
    ///
    /// Called synchronously while the stream is being constructed. The
    /// returned future is driven afterwards, so it must not borrow the sink.
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> LocalBoxFuture<'static, StreamResult<()>> {
        let _ = controller;
        future::ready(Ok(())).boxed_local()
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> {
        let _ = (chunk, controller);
        future::ready(Ok(()))
    }

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> {
        future::ready(Ok(()))
    }

    /// Abort the sink
    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
        let _ = reason;
        future::ready(Ok(()))
    }
}

type StartFn =
    Box<dyn FnOnce(WritableStreamDefaultController) -> LocalBoxFuture<'static, StreamResult<()>>>;
type WriteFn<T> =
    Box<dyn FnMut(T, WritableStreamDefaultController) -> LocalBoxFuture<'static, StreamResult<()>>>;
type CloseFn = Box<dyn FnOnce() -> LocalBoxFuture<'static, StreamResult<()>>>;
type AbortFn = Box<dyn FnOnce(Option<String>) -> LocalBoxFuture<'static, StreamResult<()>>>;

/// A sink assembled from optional closures, one per algorithm.
///
/// ```ignore
/// let sink = UnderlyingSink::new()
///     .with_write(|chunk: String, _controller| async move {
///         println!("{chunk}");
///         Ok(())
///     });
/// ```
pub struct UnderlyingSink<T> {
    sink_type: Option<String>,
    start: Option<StartFn>,
    write: Option<WriteFn<T>>,
    close: Option<CloseFn>,
    abort: Option<AbortFn>,
}

impl<T: 'static> UnderlyingSink<T> {
    pub fn new() -> Self {
        Self {
            sink_type: None,
            start: None,
            write: None,
            close: None,
            abort: None,
        }
    }

    /// Set the reserved `type` member. Streams reject such sinks.
    pub fn with_type(mut self, sink_type: impl Into<String>) -> Self {
        self.sink_type = Some(sink_type.into());
        self
    }

    pub fn with_start<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(WritableStreamDefaultController) -> Fut + 'static,
        Fut: Future<Output = StreamResult<()>> + 'static,
    {
        self.start = Some(Box::new(move |controller| f(controller).boxed_local()));
        self
    }

    pub fn with_write<F, Fut>(mut self, mut f: F) -> Self
    where
        F: FnMut(T, WritableStreamDefaultController) -> Fut + 'static,
        Fut: Future<Output = StreamResult<()>> + 'static,
    {
        self.write = Some(Box::new(move |chunk, controller| {
            f(chunk, controller).boxed_local()
        }));
        self
    }

    pub fn with_close<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = StreamResult<()>> + 'static,
    {
        self.close = Some(Box::new(move || f().boxed_local()));
        self
    }

    pub fn with_abort<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<String>) -> Fut + 'static,
        Fut: Future<Output = StreamResult<()>> + 'static,
    {
        self.abort = Some(Box::new(move |reason| f(reason).boxed_local()));
        self
    }

    pub fn has_start(&self) -> bool {
        self.start.is_some()
    }

    pub fn has_write(&self) -> bool {
        self.write.is_some()
    }

    pub fn has_close(&self) -> bool {
        self.close.is_some()
    }

    pub fn has_abort(&self) -> bool {
        self.abort.is_some()
    }
}

impl<T: 'static> Default for UnderlyingSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> WritableSink<T> for UnderlyingSink<T> {
    fn sink_type(&self) -> Option<&str> {
        self.sink_type.as_deref()
    }

    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> LocalBoxFuture<'static, StreamResult<()>> {
        match self.start.take() {
            Some(start) => start(controller.clone()),
            None => future::ready(Ok(())).boxed_local(),
        }
    }

    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> {
        match self.write.as_mut() {
            Some(write) => write(chunk, controller.clone()),
            None => future::ready(Ok(())).boxed_local(),
        }
    }

    fn close(self) -> impl Future<Output = StreamResult<()>> {
        match self.close {
            Some(close) => close(),
            None => future::ready(Ok(())).boxed_local(),
        }
    }

    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
        match self.abort.take() {
            Some(abort) => abort(reason),
            None => future::ready(Ok(())).boxed_local(),
        }
    }
}
