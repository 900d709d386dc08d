//! Writable streams: a destination for chunks with queuing, backpressure and a
//! single in-flight sink operation.
//!
//! A [`WritableStream`] owns its state behind `Rc<RefCell<..>>`. Sink futures
//! are not run by the stream itself; they are driven by the future returned
//! from [`WritableStreamBuilder::prepare`], or spawned by
//! [`WritableStreamBuilder::spawn`]:
//!
//! ```ignore
//! let stream = WritableStream::builder(sink)
//!     .strategy(CountQueuingStrategy::new(4.0))
//!     .spawn(tokio::task::spawn_local)?;
//! let writer = stream.get_writer()?;
//! writer.write(chunk).await?;
//! writer.close().await?;
//! ```

mod controller;
mod sink;
mod writer;

pub use controller::{SinkOperation, WritableStreamDefaultController};
pub use sink::{UnderlyingSink, WritableSink};
pub use writer::WritableStreamDefaultWriter;

use crate::streams::completion::Completion;
use crate::streams::error::StreamError;
use crate::streams::trace::{Edge, EdgeVisitor, Traceable};
use crate::streams::{CountQueuingStrategy, QueuingStrategy, StreamResult};
use controller::{ControllerCore, ControllerTarget, SinkOutcome};
use futures::FutureExt;
use futures::future::{LocalBoxFuture, poll_fn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::Poll;
use writer::WriterSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Writable,
    /// An error is stored but not yet propagated to queued writes.
    Erroring,
    /// Erroring while a sink write is still running; finishing waits for it.
    ErroringPendingWrite,
    Closed,
    Errored,
}

impl StreamState {
    pub fn is_erroring(self) -> bool {
        matches!(self, Self::Erroring | Self::ErroringPendingWrite)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

struct PendingAbortRequest {
    completion: Completion,
    reason: Option<String>,
    was_already_erroring: bool,
}

pub(crate) struct StreamInner<T: 'static, Sink: WritableSink<T>> {
    state: StreamState,
    controller: ControllerCore<T, Sink>,
    writer: Option<Rc<WriterSlot>>,
    backpressure: bool,
    close_request: Option<Completion>,
    in_flight_write_request: Option<Completion>,
    in_flight_close_request: Option<Completion>,
    pending_abort_request: Option<PendingAbortRequest>,
    stored_error: Option<StreamError>,
    write_requests: VecDeque<Completion>,
}

impl<T: 'static, Sink: WritableSink<T>> StreamInner<T, Sink> {
    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "stream state transition");
            self.state = state;
        }
    }

    fn stored_error_or(&self, fallback: StreamError) -> StreamError {
        self.stored_error.clone().unwrap_or(fallback)
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close_request.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write_request.is_some() || self.in_flight_close_request.is_some()
    }

    pub(crate) fn is_bound_to(&self, slot: &Rc<WriterSlot>) -> bool {
        self.writer
            .as_ref()
            .is_some_and(|bound| Rc::ptr_eq(bound, slot))
    }

    fn is_finished(&self) -> bool {
        self.state.is_terminal() && !self.controller.busy()
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.state {
            StreamState::Erroring | StreamState::ErroringPendingWrite | StreamState::Errored => None,
            StreamState::Closed => Some(0.0),
            StreamState::Writable => Some(self.controller.desired_size()),
        }
    }

    fn start_erroring(&mut self, error: StreamError) {
        debug_assert!(self.stored_error.is_none());
        debug_assert_eq!(self.state, StreamState::Writable);
        tracing::debug!(%error, "stream erroring");
        self.stored_error = Some(error.clone());
        if self.in_flight_write_request.is_some() {
            self.set_state(StreamState::ErroringPendingWrite);
        } else {
            self.set_state(StreamState::Erroring);
        }
        if let Some(slot) = &self.writer {
            slot.ensure_ready_rejected(error);
        }
        if !self.has_operation_marked_in_flight() && self.controller.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        self.set_state(StreamState::Erroring);
        self.controller.reset_queue();
        let error = self.stored_error_or(StreamError::TaskDropped);
        for request in self.write_requests.drain(..) {
            request.reject(error.clone());
        }

        let Some(abort) = self.pending_abort_request.take() else {
            self.set_state(StreamState::Errored);
            self.reject_close_and_closed_if_needed();
            return;
        };

        if abort.was_already_erroring {
            abort.completion.reject(error);
            self.set_state(StreamState::Errored);
            self.reject_close_and_closed_if_needed();
            return;
        }

        let reason = abort.reason.clone();
        self.pending_abort_request = Some(abort);
        self.controller.dispatch_abort(reason);
    }

    /// Rejects the close request and the writer's `closed`, then detaches the writer.
    fn reject_close_and_closed_if_needed(&mut self) {
        debug_assert_eq!(self.state, StreamState::Errored);
        let error = self.stored_error_or(StreamError::TaskDropped);
        if let Some(close) = self.close_request.take() {
            debug_assert!(self.in_flight_close_request.is_none());
            close.reject(error.clone());
        }
        if let Some(slot) = self.writer.take() {
            slot.reject_closed(error);
        }
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == StreamState::Writable {
            self.start_erroring(error);
        } else {
            self.finish_erroring();
        }
    }

    fn update_backpressure(&mut self, backpressure: bool) {
        if backpressure == self.backpressure {
            return;
        }
        tracing::trace!(backpressure, "backpressure changed");
        if let Some(slot) = &self.writer {
            if backpressure {
                slot.reset_ready();
            } else {
                slot.resolve_ready();
            }
        }
        self.backpressure = backpressure;
    }

    fn refresh_backpressure(&mut self) {
        if !self.close_queued_or_in_flight() && self.state == StreamState::Writable {
            let backpressure = self.controller.backpressure();
            self.update_backpressure(backpressure);
        }
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.controller.started || self.controller.busy() {
            return;
        }
        if self.state.is_erroring() {
            self.finish_erroring();
            return;
        }
        if self.state != StreamState::Writable {
            return;
        }
        match self.controller.peek_is_close() {
            None => {}
            Some(true) => {
                self.in_flight_close_request = self.close_request.take();
                self.controller.dispatch_close();
            }
            Some(false) => {
                self.in_flight_write_request = self.write_requests.pop_front();
                self.controller.dispatch_write();
            }
        }
    }

    fn on_sink_outcome(&mut self, outcome: SinkOutcome<Sink>) {
        let operation = self.controller.finish_operation();
        tracing::debug!(?operation, "sink operation settled");
        match outcome {
            SinkOutcome::Started(sink, result) => {
                self.controller.restore_sink(sink);
                self.controller.started = true;
                match result {
                    Ok(()) => self.advance_queue_if_needed(),
                    Err(error) => self.deal_with_rejection(error),
                }
            }
            SinkOutcome::Written(sink, result) => {
                self.controller.restore_sink(sink);
                if self.state == StreamState::ErroringPendingWrite {
                    self.set_state(StreamState::Erroring);
                }
                let request = self.in_flight_write_request.take();
                if let Some(SinkOperation::Write { size }) = operation {
                    self.controller.release_size(size);
                }
                match result {
                    Ok(()) => {
                        if let Some(request) = request {
                            request.resolve();
                        }
                        self.refresh_backpressure();
                        self.advance_queue_if_needed();
                    }
                    Err(error) => {
                        if let Some(request) = request {
                            request.reject(error.clone());
                        }
                        self.deal_with_rejection(error);
                    }
                }
            }
            SinkOutcome::Closed(Ok(())) => {
                if let Some(close) = self.in_flight_close_request.take() {
                    close.resolve();
                }
                if self.state.is_erroring() {
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort_request.take() {
                        abort.completion.resolve();
                    }
                }
                self.set_state(StreamState::Closed);
                if let Some(slot) = self.writer.take() {
                    slot.resolve_closed();
                }
            }
            SinkOutcome::Closed(Err(error)) => {
                if let Some(close) = self.in_flight_close_request.take() {
                    close.reject(error.clone());
                }
                if let Some(abort) = self.pending_abort_request.take() {
                    abort.completion.reject(error.clone());
                }
                self.deal_with_rejection(error);
            }
            SinkOutcome::Aborted(result) => {
                self.set_state(StreamState::Errored);
                if let Some(abort) = self.pending_abort_request.take() {
                    abort.completion.settle_with(result);
                }
                self.controller.reset_queue();
                self.reject_close_and_closed_if_needed();
            }
        }
    }

    /// The size algorithm to run for the next chunk, or `None` when the write
    /// will be rejected anyway and the chunk need not be measured.
    pub(crate) fn size_strategy(&self) -> Option<Rc<dyn QueuingStrategy<T>>> {
        (self.state == StreamState::Writable && !self.close_queued_or_in_flight())
            .then(|| self.controller.strategy())
    }

    /// Enqueues a chunk whose cost was measured with the stream unborrowed.
    ///
    /// The size algorithm may have called back into the stream, so the state
    /// is checked after a failed measurement has errored the stream.
    pub(crate) fn write_chunk(&mut self, chunk: T, size: StreamResult<f64>) -> Completion {
        let size = match size {
            Ok(size) => Some(size),
            Err(error) => {
                if self.state == StreamState::Writable {
                    self.start_erroring(error);
                }
                None
            }
        };

        match self.state {
            StreamState::Erroring | StreamState::ErroringPendingWrite | StreamState::Errored => {
                return Completion::rejected(self.stored_error_or(StreamError::Closed));
            }
            StreamState::Closed => return Completion::rejected(StreamError::Closed),
            StreamState::Writable => {}
        }
        if self.close_queued_or_in_flight() {
            return Completion::rejected(StreamError::Closing);
        }
        let Some(size) = size else {
            return Completion::rejected(self.stored_error_or(StreamError::Closed));
        };

        let completion = Completion::pending();
        self.write_requests.push_back(completion.clone());
        self.controller.enqueue_chunk(chunk, size);
        self.refresh_backpressure();
        self.advance_queue_if_needed();
        completion
    }

    pub(crate) fn close(&mut self) -> Completion {
        match self.state {
            StreamState::Closed => return Completion::rejected(StreamError::Closed),
            StreamState::Errored => {
                return Completion::rejected(self.stored_error_or(StreamError::Closed));
            }
            _ => {}
        }
        if self.close_queued_or_in_flight() {
            return Completion::rejected(StreamError::Closing);
        }

        let completion = Completion::pending();
        self.close_request = Some(completion.clone());
        if self.backpressure && self.state == StreamState::Writable {
            if let Some(slot) = &self.writer {
                slot.resolve_ready();
            }
        }
        self.controller.enqueue_close();
        self.advance_queue_if_needed();
        completion
    }

    pub(crate) fn abort(&mut self, reason: Option<String>) -> Completion {
        if self.state.is_terminal() {
            return Completion::resolved();
        }
        if let Some(pending) = &self.pending_abort_request {
            return pending.completion.clone();
        }
        if let Some(close) = self.close_request.as_ref().or(self.in_flight_close_request.as_ref()) {
            let mirror = Completion::pending();
            let target = mirror.clone();
            close.on_settle(move |result| {
                target.settle_with(result.clone());
            });
            return mirror;
        }

        self.controller.signal_abort(reason.clone());
        let was_already_erroring = self.state.is_erroring();
        let completion = Completion::pending();
        self.pending_abort_request = Some(PendingAbortRequest {
            completion: completion.clone(),
            reason: if was_already_erroring { None } else { reason.clone() },
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(StreamError::Aborted(reason));
        }
        completion
    }

    fn acquire_writer(&mut self) -> StreamResult<Rc<WriterSlot>> {
        if self.writer.is_some() {
            return Err(StreamError::Locked);
        }
        let (ready, closed) = match self.state {
            StreamState::Writable => {
                let ready = if self.backpressure && !self.close_queued_or_in_flight() {
                    Completion::pending()
                } else {
                    Completion::resolved()
                };
                (ready, Completion::pending())
            }
            StreamState::Erroring | StreamState::ErroringPendingWrite => (
                Completion::rejected(self.stored_error_or(StreamError::Closed)),
                Completion::pending(),
            ),
            StreamState::Closed => (Completion::resolved(), Completion::resolved()),
            StreamState::Errored => {
                let error = self.stored_error_or(StreamError::Closed);
                (Completion::rejected(error.clone()), Completion::rejected(error))
            }
        };
        let slot = WriterSlot::new(ready, closed);
        if !self.state.is_terminal() {
            self.writer = Some(Rc::clone(&slot));
        }
        Ok(slot)
    }

    pub(crate) fn release_writer(&mut self, slot: &Rc<WriterSlot>) {
        if !self.is_bound_to(slot) {
            return;
        }
        slot.mark_released();
        slot.ensure_ready_rejected(StreamError::Released);
        slot.ensure_closed_rejected(StreamError::Released);
        self.writer = None;
        tracing::debug!("writer released");
    }
}

impl<T: 'static, Sink: WritableSink<T>> ControllerTarget for StreamInner<T, Sink> {
    fn error_from_controller(&mut self, error: StreamError) {
        if self.state == StreamState::Writable {
            self.start_erroring(error);
        }
    }

    fn visit_controller_edges(&self, visitor: &mut dyn EdgeVisitor) {
        self.controller.visit_edges(visitor);
    }
}

impl<T: 'static, Sink: WritableSink<T>> Traceable for StreamInner<T, Sink> {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor) {
        visitor.visit(Edge::Controller);
        self.controller.visit_edges(visitor);
        if let Some(slot) = &self.writer {
            visitor.visit(Edge::Writer);
            slot.visit_edges(visitor);
        }
        for request in &self.write_requests {
            visitor.visit(Edge::Completion("write_request", request));
        }
        if let Some(request) = &self.in_flight_write_request {
            visitor.visit(Edge::Completion("in_flight_write_request", request));
        }
        if let Some(request) = &self.close_request {
            visitor.visit(Edge::Completion("close_request", request));
        }
        if let Some(request) = &self.in_flight_close_request {
            visitor.visit(Edge::Completion("in_flight_close_request", request));
        }
        if let Some(abort) = &self.pending_abort_request {
            visitor.visit(Edge::Completion("pending_abort_request", &abort.completion));
            visitor.visit(Edge::AbortReason(abort.reason.as_deref()));
        }
        if let Some(error) = &self.stored_error {
            visitor.visit(Edge::StoredError(error));
        }
    }
}

impl<T: 'static, Sink: WritableSink<T>> Drop for StreamInner<T, Sink> {
    fn drop(&mut self) {
        let error = StreamError::TaskDropped;
        for request in self
            .write_requests
            .drain(..)
            .chain(self.in_flight_write_request.take())
            .chain(self.close_request.take())
            .chain(self.in_flight_close_request.take())
        {
            request.reject(error.clone());
        }
        if let Some(abort) = self.pending_abort_request.take() {
            abort.completion.reject(error.clone());
        }
        if let Some(slot) = self.writer.take() {
            slot.ready().reject(error.clone());
            slot.reject_closed(error);
        }
        self.controller.release_driver();
    }
}

/// Polls the in-flight sink operation of one stream.
///
/// The operation future is moved out of the shared state before it is polled,
/// so sink code can call back into the stream (e.g. `controller.error()`).
/// Ends once the stream is terminal with nothing in flight, or when every
/// handle to the stream is gone.
fn drive<T, Sink>(stream: Weak<RefCell<StreamInner<T, Sink>>>) -> impl Future<Output = ()> + 'static
where
    T: 'static,
    Sink: WritableSink<T>,
{
    poll_fn(move |cx| {
        loop {
            let Some(inner) = stream.upgrade() else {
                return Poll::Ready(());
            };

            let mut op = {
                let mut state = inner.borrow_mut();
                state.controller.register_driver(cx.waker());
                match state.controller.take_pending_op() {
                    Some(op) => op,
                    None if state.is_finished() => {
                        tracing::debug!(state = ?state.state, "stream driver finished");
                        return Poll::Ready(());
                    }
                    None => return Poll::Pending,
                }
            };

            match op.as_mut().poll(cx) {
                Poll::Ready(outcome) => inner.borrow_mut().on_sink_outcome(outcome),
                Poll::Pending => {
                    inner.borrow_mut().controller.restore_pending_op(op);
                    return Poll::Pending;
                }
            }
        }
    })
}

/// Shared handle to a writable stream.
pub struct WritableStream<T: 'static, Sink: WritableSink<T>> {
    inner: Rc<RefCell<StreamInner<T, Sink>>>,
}

impl<T: 'static, Sink: WritableSink<T>> Clone for WritableStream<T, Sink> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static, Sink: WritableSink<T>> WritableStream<T, Sink> {
    /// Create a builder for configuring and spawning the stream
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    fn new_inner(
        sink: Sink,
        strategy: Rc<dyn QueuingStrategy<T>>,
    ) -> StreamResult<(Self, impl Future<Output = ()> + 'static)> {
        if let Some(sink_type) = sink.sink_type() {
            return Err(StreamError::ReservedSinkType(sink_type.to_owned()));
        }
        let high_water_mark = strategy.high_water_mark();
        if high_water_mark.is_nan() || high_water_mark < 0.0 {
            return Err(StreamError::InvalidHighWaterMark(high_water_mark));
        }

        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<StreamInner<T, Sink>>>| {
            let target: Weak<RefCell<dyn ControllerTarget>> = weak.clone();
            let handle = WritableStreamDefaultController::new(target);
            RefCell::new(StreamInner {
                state: StreamState::Writable,
                controller: ControllerCore::new(sink, strategy, high_water_mark, handle),
                writer: None,
                backpressure: false,
                close_request: None,
                in_flight_write_request: None,
                in_flight_close_request: None,
                pending_abort_request: None,
                stored_error: None,
                write_requests: VecDeque::new(),
            })
        });

        // `start` runs before construction returns, with the stream unborrowed so
        // it may call `controller.error()`.
        let (sink, mut controller) = {
            let mut state = inner.borrow_mut();
            (state.controller.take_sink(), state.controller.handle().clone())
        };
        let started = sink.map(|mut sink| {
            let started = sink.start(&mut controller);
            (sink, started)
        });
        inner.borrow_mut().controller.dispatch_start(started);
        tracing::debug!(high_water_mark, "writable stream created");

        let driver = drive(Rc::downgrade(&inner));
        Ok((Self { inner }, driver))
    }

    /// Whether a writer currently holds the lock.
    pub fn locked(&self) -> bool {
        self.inner.borrow().writer.is_some()
    }

    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    pub fn backpressure(&self) -> bool {
        self.inner.borrow().backpressure
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.inner.borrow().desired_size()
    }

    pub fn queue_total_size(&self) -> f64 {
        self.inner.borrow().controller.queue_total_size()
    }

    pub fn high_water_mark(&self) -> f64 {
        self.inner.borrow().controller.high_water_mark()
    }

    pub fn stored_error(&self) -> Option<StreamError> {
        self.inner.borrow().stored_error.clone()
    }

    /// The sink operation currently running, if any.
    pub fn in_flight_operation(&self) -> Option<SinkOperation> {
        self.inner.borrow().controller.in_flight()
    }

    /// The handle passed to the sink's algorithms.
    pub fn controller(&self) -> WritableStreamDefaultController {
        self.inner.borrow().controller.handle().clone()
    }

    /// Close the stream. Fails with `Locked` while a writer holds the lock.
    pub fn close(&self) -> Completion {
        let mut inner = self.inner.borrow_mut();
        if inner.writer.is_some() {
            return Completion::rejected(StreamError::Locked);
        }
        inner.close()
    }

    /// Abort the stream. Fails with `Locked` while a writer holds the lock.
    pub fn abort(&self, reason: Option<String>) -> Completion {
        let mut inner = self.inner.borrow_mut();
        if inner.writer.is_some() {
            return Completion::rejected(StreamError::Locked);
        }
        inner.abort(reason)
    }

    /// Acquire the stream's writer.
    ///
    /// On a closed or errored stream the writer comes back already detached
    /// and the stream stays unlocked.
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T, Sink>> {
        let slot = self.inner.borrow_mut().acquire_writer()?;
        Ok(WritableStreamDefaultWriter::new(Rc::clone(&self.inner), slot))
    }
}

impl<T: 'static, Sink: WritableSink<T>> Traceable for WritableStream<T, Sink> {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor) {
        self.inner.borrow().visit_edges(visitor);
    }
}

pub struct WritableStreamBuilder<T: 'static, Sink: WritableSink<T>> {
    sink: Sink,
    strategy: Rc<dyn QueuingStrategy<T>>,
}

impl<T: 'static, Sink: WritableSink<T>> WritableStreamBuilder<T, Sink> {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Rc::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + 'static>(mut self, s: S) -> Self {
        self.strategy = Rc::new(s);
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> StreamResult<(WritableStream<T, Sink>, impl Future<Output = ()> + 'static)> {
        WritableStream::new_inner(self.sink, self.strategy)
    }

    /// Spawn the driver with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T, Sink>>
    where
        F: FnOnce(LocalBoxFuture<'static, ()>) -> R,
    {
        let (stream, driver) = self.prepare()?;
        spawn_fn(driver.boxed_local());
        Ok(stream)
    }
}
