use super::StreamInner;
use super::controller::ControllerCore;
use super::sink::WritableSink;
use crate::streams::StreamResult;
use crate::streams::completion::Completion;
use crate::streams::error::StreamError;
use crate::streams::trace::{Edge, EdgeVisitor, Traceable};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Writer-side state the stream holds while locked.
///
/// The stream reaches its writer only through this slot, and the slot has no
/// pointer back to the stream.
pub(crate) struct WriterSlot {
    ready: RefCell<Completion>,
    closed: RefCell<Completion>,
    released: Cell<bool>,
}

impl WriterSlot {
    pub(crate) fn new(ready: Completion, closed: Completion) -> Rc<Self> {
        Rc::new(Self {
            ready: RefCell::new(ready),
            closed: RefCell::new(closed),
            released: Cell::new(false),
        })
    }

    pub(crate) fn ready(&self) -> Completion {
        self.ready.borrow().clone()
    }

    pub(crate) fn closed(&self) -> Completion {
        self.closed.borrow().clone()
    }

    /// Backpressure applied: hand out a fresh pending `ready`.
    pub(crate) fn reset_ready(&self) {
        *self.ready.borrow_mut() = Completion::pending();
    }

    pub(crate) fn resolve_ready(&self) {
        self.ready().resolve();
    }

    pub(crate) fn ensure_ready_rejected(&self, error: StreamError) {
        let current = self.ready();
        if !current.reject(error.clone()) {
            *self.ready.borrow_mut() = Completion::rejected(error);
        }
    }

    pub(crate) fn ensure_closed_rejected(&self, error: StreamError) {
        let current = self.closed();
        if !current.reject(error.clone()) {
            *self.closed.borrow_mut() = Completion::rejected(error);
        }
    }

    pub(crate) fn resolve_closed(&self) {
        self.closed().resolve();
    }

    pub(crate) fn reject_closed(&self, error: StreamError) {
        self.closed().reject(error);
    }

    pub(crate) fn mark_released(&self) {
        self.released.set(true);
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }
}

impl Traceable for WriterSlot {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor) {
        visitor.visit(Edge::Completion("ready", &self.ready.borrow()));
        visitor.visit(Edge::Completion("closed", &self.closed.borrow()));
    }
}

/// Exclusive handle for writing into a locked [`WritableStream`](super::WritableStream).
///
/// Clones share the lock, but each clone tracks its own `futures::Sink` flush
/// and close state.
pub struct WritableStreamDefaultWriter<T: 'static, Sink: WritableSink<T>> {
    stream: Rc<RefCell<StreamInner<T, Sink>>>,
    slot: Rc<WriterSlot>,
    last_write: Option<Completion>,
    pending_close: Option<Completion>,
}

impl<T: 'static, Sink: WritableSink<T>> WritableStreamDefaultWriter<T, Sink> {
    pub(crate) fn new(stream: Rc<RefCell<StreamInner<T, Sink>>>, slot: Rc<WriterSlot>) -> Self {
        Self {
            stream,
            slot,
            last_write: None,
            pending_close: None,
        }
    }

    /// Write a chunk to the stream by immediately enqueueing it for writing.
    ///
    /// The returned completion settles when the sink has accepted the chunk.
    /// Completions settle in the order the writes were issued.
    ///
    /// Writing while [`ready()`](Self::ready) is pending is allowed; the chunk is
    /// queued and only the readiness signal is delayed. Callers that ignore
    /// `ready()` can grow the queue without bound.
    ///
    /// # Example
    ///
    /// ```ignore
    /// writer.ready().await?;
    /// writer.write(chunk).await?;
    /// ```
    pub fn write(&self, chunk: T) -> Completion {
        if self.slot.is_released() {
            return Completion::rejected(StreamError::Released);
        }
        // The size algorithm is user code and may reach back into the stream.
        let strategy = self.stream.borrow().size_strategy();
        let size = match strategy {
            Some(strategy) => ControllerCore::<T, Sink>::measure(&*strategy, &chunk),
            None => Ok(1.0),
        };
        if self.slot.is_released() {
            return Completion::rejected(StreamError::Released);
        }
        self.stream.borrow_mut().write_chunk(chunk, size)
    }

    /// Waits for the stream to be ready (i.e., no backpressure) before
    /// enqueueing the chunk. Returns the write's completion without awaiting it.
    pub async fn enqueue_when_ready(&self, chunk: T) -> StreamResult<Completion> {
        self.ready().await?;
        Ok(self.write(chunk))
    }

    pub fn close(&self) -> Completion {
        if self.slot.is_released() {
            return Completion::rejected(StreamError::Released);
        }
        self.stream.borrow_mut().close()
    }

    pub fn abort(&self, reason: Option<String>) -> Completion {
        if self.slot.is_released() {
            return Completion::rejected(StreamError::Released);
        }
        self.stream.borrow_mut().abort(reason)
    }

    /// Release the lock. The stream itself is unaffected.
    pub fn release_lock(&self) {
        self.stream.borrow_mut().release_writer(&self.slot);
    }

    /// Pending while backpressure holds, fulfilled otherwise.
    pub fn ready(&self) -> Completion {
        self.slot.ready()
    }

    /// Settles once, when the stream closes or errors.
    pub fn closed(&self) -> Completion {
        self.slot.closed()
    }

    /// How much more cost the stream can take before backpressure.
    /// Returns `None` if the stream is erroring or errored.
    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        if self.slot.is_released() {
            return Err(StreamError::Released);
        }
        Ok(self.stream.borrow().desired_size())
    }

    /// True while this writer holds the stream's lock.
    pub fn is_bound(&self) -> bool {
        self.stream.borrow().is_bound_to(&self.slot)
    }
}

impl<T: 'static, Sink: WritableSink<T>> Clone for WritableStreamDefaultWriter<T, Sink> {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.stream), Rc::clone(&self.slot))
    }
}

impl<T: 'static, Sink: WritableSink<T>> Traceable for WritableStreamDefaultWriter<T, Sink> {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor) {
        if self.is_bound() {
            visitor.visit(Edge::Stream);
        }
        self.slot.visit_edges(visitor);
    }
}

impl<T: 'static, Sink: WritableSink<T>> futures::Sink<T> for WritableStreamDefaultWriter<T, Sink> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.slot.is_released() {
            return Poll::Ready(Err(StreamError::Released));
        }
        let mut ready = self.slot.ready();
        Pin::new(&mut ready).poll(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let completion = this.write(item);
        if let Some(Err(err)) = completion.result() {
            return Err(err);
        }
        this.last_write = Some(completion);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        // Writes settle in order, so the newest one settling covers all of them.
        let Some(last) = this.last_write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(last).poll(cx) {
            Poll::Ready(result) => {
                this.last_write = None;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        let close = this.pending_close.get_or_insert_with(|| {
            if this.slot.is_released() {
                Completion::rejected(StreamError::Released)
            } else {
                this.stream.borrow_mut().close()
            }
        });
        Pin::new(close).poll(cx)
    }
}
