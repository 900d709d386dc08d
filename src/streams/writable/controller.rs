use super::sink::WritableSink;
use crate::streams::completion::WakerSet;
use crate::streams::error::StreamError;
use crate::streams::trace::{Edge, EdgeVisitor, Traceable};
use crate::streams::{QueuingStrategy, StreamResult};
use futures::FutureExt;
use futures::future::{LocalBoxFuture, poll_fn};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Poll, Waker};

/// Receiver of `controller.error(e)` calls; implemented by the stream state.
pub(crate) trait ControllerTarget {
    fn error_from_controller(&mut self, error: StreamError);

    /// Reports the edges owned by the controller half of the stream.
    fn visit_controller_edges(&self, visitor: &mut dyn EdgeVisitor);
}

#[derive(Default)]
struct AbortSignal {
    aborted: Cell<bool>,
    reason: RefCell<Option<String>>,
    wakers: RefCell<WakerSet>,
}

/// Handle given to sink algorithms.
///
/// It lets a sink error the stream and observe abort requests. The handle only
/// holds a weak reference to the stream, so a sink keeping it alive does not
/// keep the stream alive.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    target: Weak<RefCell<dyn ControllerTarget>>,
    signal: Rc<AbortSignal>,
}

impl WritableStreamDefaultController {
    pub(crate) fn new(target: Weak<RefCell<dyn ControllerTarget>>) -> Self {
        Self {
            target,
            signal: Rc::new(AbortSignal::default()),
        }
    }

    /// Signal an error on the stream. Ignored unless the stream is still writable.
    pub fn error(&self, error: StreamError) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        match target.try_borrow_mut() {
            Ok(mut stream) => stream.error_from_controller(error),
            Err(_) => tracing::warn!(%error, "controller.error() called re-entrantly; ignored"),
        }
    }

    /// Returns `true` if the stream has been aborted.
    ///
    /// This is a synchronous check of the abort flag.
    pub fn is_aborted(&self) -> bool {
        self.signal.aborted.get()
    }

    /// The reason passed to `abort()`, once aborted.
    pub fn abort_reason(&self) -> Option<String> {
        self.signal.reason.borrow().clone()
    }

    pub(crate) fn signal_abort(&self, reason: Option<String>) {
        if self.signal.aborted.replace(true) {
            return;
        }
        *self.signal.reason.borrow_mut() = reason;
        self.signal.wakers.borrow_mut().wake_all();
    }

    /// Returns a future that resolves once the stream is aborted.
    ///
    /// An abort never interrupts a sink operation that is already running; a
    /// sink that wants to stop early can `select!` on this future alongside
    /// its own work.
    pub fn abort_future(&self) -> impl Future<Output = ()> + 'static {
        let signal = Rc::clone(&self.signal);
        poll_fn(move |cx| {
            if signal.aborted.get() {
                Poll::Ready(())
            } else {
                signal.wakers.borrow_mut().register(cx.waker());
                Poll::Pending
            }
        })
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted)` carrying
    /// the abort reason. Otherwise, returns the result of the future wrapped in `Ok`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// async fn write(
    ///     &mut self,
    ///     chunk: Vec<u8>,
    ///     controller: &mut WritableStreamDefaultController,
    /// ) -> StreamResult<()> {
    ///     controller
    ///         .with_abort(async move {
    ///             tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    ///         })
    ///         .await
    /// }
    /// ```
    pub fn with_abort<F, T>(&self, fut: F) -> impl Future<Output = Result<T, StreamError>>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let abort_fut = Box::pin(self.abort_future());
        let fut = Box::pin(fut);
        let signal = Rc::clone(&self.signal);

        futures::future::select(fut, abort_fut).map(move |either| match either {
            futures::future::Either::Left((value, _)) => Ok(value),
            futures::future::Either::Right(((), _)) => {
                Err(StreamError::Aborted(signal.reason.borrow().clone()))
            }
        })
    }
}

impl Traceable for WritableStreamDefaultController {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor) {
        if let Some(target) = self.target.upgrade() {
            if let Ok(stream) = target.try_borrow() {
                stream.visit_controller_edges(visitor);
            }
        }
        if self.is_aborted() {
            visitor.visit(Edge::AbortReason(self.signal.reason.borrow().as_deref()));
        }
    }
}

pub(crate) enum QueueEntry<T> {
    Chunk { chunk: T, size: f64 },
    Close,
}

/// The sink operation currently dispatched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkOperation {
    Start,
    Write { size: f64 },
    Close,
    Abort,
}

pub(crate) enum SinkOutcome<Sink> {
    Started(Option<Sink>, StreamResult<()>),
    Written(Option<Sink>, StreamResult<()>),
    Closed(StreamResult<()>),
    Aborted(StreamResult<()>),
}

/// Queue and backpressure engine owned by the stream.
pub(crate) struct ControllerCore<T, Sink> {
    queue: VecDeque<QueueEntry<T>>,
    queue_total_size: f64,
    high_water_mark: f64,
    strategy: Rc<dyn QueuingStrategy<T>>,
    sink: Option<Sink>,
    pub(crate) started: bool,
    in_flight: Option<SinkOperation>,
    pending_op: Option<LocalBoxFuture<'static, SinkOutcome<Sink>>>,
    driver: Option<Waker>,
    handle: WritableStreamDefaultController,
}

impl<T, Sink> ControllerCore<T, Sink>
where
    T: 'static,
    Sink: WritableSink<T>,
{
    pub(crate) fn new(
        sink: Sink,
        strategy: Rc<dyn QueuingStrategy<T>>,
        high_water_mark: f64,
        handle: WritableStreamDefaultController,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            queue_total_size: 0.0,
            high_water_mark,
            strategy,
            sink: Some(sink),
            started: false,
            in_flight: None,
            pending_op: None,
            driver: None,
            handle,
        }
    }

    pub(crate) fn handle(&self) -> &WritableStreamDefaultController {
        &self.handle
    }

    pub(crate) fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub(crate) fn queue_total_size(&self) -> f64 {
        self.queue_total_size
    }

    pub(crate) fn desired_size(&self) -> f64 {
        self.high_water_mark - self.queue_total_size
    }

    pub(crate) fn backpressure(&self) -> bool {
        self.queue_total_size > self.high_water_mark
    }

    pub(crate) fn in_flight(&self) -> Option<SinkOperation> {
        self.in_flight
    }

    pub(crate) fn busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The size algorithm, detached so it can run without the stream borrowed.
    pub(crate) fn strategy(&self) -> Rc<dyn QueuingStrategy<T>> {
        Rc::clone(&self.strategy)
    }

    /// Runs the size algorithm and validates its result.
    pub(crate) fn measure(strategy: &dyn QueuingStrategy<T>, chunk: &T) -> StreamResult<f64> {
        let size = strategy.size(chunk)?;
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::InvalidChunkSize(size));
        }
        Ok(size)
    }

    pub(crate) fn enqueue_chunk(&mut self, chunk: T, size: f64) {
        self.queue.push_back(QueueEntry::Chunk { chunk, size });
        self.queue_total_size += size;
        tracing::trace!(
            size,
            total = self.queue_total_size,
            hwm = self.high_water_mark,
            "chunk queued"
        );
    }

    pub(crate) fn enqueue_close(&mut self) {
        self.queue.push_back(QueueEntry::Close);
    }

    pub(crate) fn peek_is_close(&self) -> Option<bool> {
        self.queue
            .front()
            .map(|entry| matches!(entry, QueueEntry::Close))
    }

    pub(crate) fn reset_queue(&mut self) {
        self.queue.clear();
        self.queue_total_size = 0.0;
    }

    pub(crate) fn signal_abort(&self, reason: Option<String>) {
        self.handle.signal_abort(reason);
    }

    /// Wakes the driver one last time so it notices the stream is gone.
    pub(crate) fn release_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.wake();
        }
    }

    pub(crate) fn register_driver(&mut self, waker: &Waker) {
        match &self.driver {
            Some(existing) if existing.will_wake(waker) => {}
            _ => self.driver = Some(waker.clone()),
        }
    }

    pub(crate) fn take_pending_op(&mut self) -> Option<LocalBoxFuture<'static, SinkOutcome<Sink>>> {
        self.pending_op.take()
    }

    pub(crate) fn restore_pending_op(&mut self, op: LocalBoxFuture<'static, SinkOutcome<Sink>>) {
        self.pending_op = Some(op);
    }

    /// Marks the in-flight operation as settled and returns what it was.
    pub(crate) fn finish_operation(&mut self) -> Option<SinkOperation> {
        self.in_flight.take()
    }

    pub(crate) fn restore_sink(&mut self, sink: Option<Sink>) {
        if sink.is_some() {
            self.sink = sink;
        }
    }

    /// Removes the cost of a settled write from the queue total.
    pub(crate) fn release_size(&mut self, size: f64) {
        self.queue_total_size = (self.queue_total_size - size).max(0.0);
    }

    fn install(&mut self, operation: SinkOperation, op: LocalBoxFuture<'static, SinkOutcome<Sink>>) {
        debug_assert!(self.in_flight.is_none(), "sink already has an operation in flight");
        tracing::debug!(?operation, "dispatching sink operation");
        self.in_flight = Some(operation);
        self.pending_op = Some(op);
        if let Some(driver) = &self.driver {
            driver.wake_by_ref();
        }
    }

    /// Hands the sink out so `start` can run without the stream borrowed.
    pub(crate) fn take_sink(&mut self) -> Option<Sink> {
        self.sink.take()
    }

    /// Installs an already-invoked `start` as the first in-flight operation.
    pub(crate) fn dispatch_start(
        &mut self,
        started: Option<(Sink, LocalBoxFuture<'static, StreamResult<()>>)>,
    ) {
        let op = match started {
            Some((sink, started)) => {
                async move { SinkOutcome::Started(Some(sink), started.await) }.boxed_local()
            }
            None => futures::future::ready(SinkOutcome::Started(None, Ok(()))).boxed_local(),
        };
        self.install(SinkOperation::Start, op);
    }

    /// Pops the head chunk and hands it to the sink.
    pub(crate) fn dispatch_write(&mut self) {
        let Some(QueueEntry::Chunk { chunk, size }) = self.queue.pop_front() else {
            return;
        };
        let mut controller = self.handle.clone();
        let op = match self.sink.take() {
            Some(mut sink) => async move {
                let result = sink.write(chunk, &mut controller).await;
                SinkOutcome::Written(Some(sink), result)
            }
            .boxed_local(),
            None => futures::future::ready(SinkOutcome::Written(None, Err("Sink missing".into())))
                .boxed_local(),
        };
        self.install(SinkOperation::Write { size }, op);
    }

    /// Pops the close sentinel and closes the sink.
    pub(crate) fn dispatch_close(&mut self) {
        if let Some(QueueEntry::Close) = self.queue.front() {
            self.queue.pop_front();
        }
        debug_assert!(self.queue.is_empty());
        let op = match self.sink.take() {
            Some(sink) => async move { SinkOutcome::Closed(sink.close().await) }.boxed_local(),
            None => futures::future::ready(SinkOutcome::Closed(Ok(()))).boxed_local(),
        };
        self.install(SinkOperation::Close, op);
    }

    pub(crate) fn dispatch_abort(&mut self, reason: Option<String>) {
        let op = match self.sink.take() {
            Some(mut sink) => {
                async move { SinkOutcome::Aborted(sink.abort(reason).await) }.boxed_local()
            }
            None => futures::future::ready(SinkOutcome::Aborted(Ok(()))).boxed_local(),
        };
        self.install(SinkOperation::Abort, op);
    }
}

impl<T: 'static, Sink> Traceable for ControllerCore<T, Sink> {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor) {
        for entry in &self.queue {
            if let QueueEntry::Chunk { chunk, .. } = entry {
                visitor.visit(Edge::Chunk(chunk as &dyn Any));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{CountQueuingStrategy, SizeFnQueuingStrategy};

    struct Discard;
    impl WritableSink<u32> for Discard {}

    struct NoTarget;
    impl ControllerTarget for NoTarget {
        fn error_from_controller(&mut self, _error: StreamError) {}
        fn visit_controller_edges(&self, _visitor: &mut dyn EdgeVisitor) {}
    }

    fn detached_handle() -> WritableStreamDefaultController {
        let target: Rc<RefCell<dyn ControllerTarget>> = Rc::new(RefCell::new(NoTarget));
        WritableStreamDefaultController::new(Rc::downgrade(&target))
    }

    fn core(hwm: f64) -> ControllerCore<u32, Discard> {
        ControllerCore::new(
            Discard,
            Rc::new(CountQueuingStrategy::new(hwm)),
            hwm,
            detached_handle(),
        )
    }

    #[test]
    fn backpressure_applies_strictly_above_high_water_mark() {
        let mut core = core(2.0);
        assert!(!core.backpressure());
        core.enqueue_chunk(1, 1.0);
        core.enqueue_chunk(2, 1.0);
        assert!(!core.backpressure());
        assert_eq!(core.desired_size(), 0.0);
        core.enqueue_chunk(3, 1.0);
        assert!(core.backpressure());
        core.release_size(1.0);
        assert!(!core.backpressure());
    }

    #[test]
    fn rejects_invalid_chunk_sizes() {
        let strategy = SizeFnQueuingStrategy::new(1.0, |chunk: &u32| {
            Ok::<f64, StreamError>(if *chunk == 0 { f64::NAN } else { -(*chunk as f64) })
        });
        let measure = ControllerCore::<u32, Discard>::measure;
        assert!(matches!(measure(&strategy, &0), Err(StreamError::InvalidChunkSize(_))));
        assert!(matches!(measure(&strategy, &3), Err(StreamError::InvalidChunkSize(_))));
    }

    #[test]
    fn single_operation_in_flight() {
        let mut core = core(1.0);
        core.enqueue_chunk(7, 1.0);
        core.dispatch_write();
        assert_eq!(core.in_flight(), Some(SinkOperation::Write { size: 1.0 }));
        assert_eq!(core.queue_total_size(), 1.0);
        assert!(core.take_pending_op().is_some());
        assert_eq!(core.finish_operation(), Some(SinkOperation::Write { size: 1.0 }));
        assert!(!core.busy());
    }

    #[test]
    fn reset_clears_queue_and_total() {
        let mut core = core(1.0);
        core.enqueue_chunk(1, 1.0);
        core.enqueue_close();
        core.reset_queue();
        assert_eq!(core.queue_total_size(), 0.0);
        assert_eq!(core.peek_is_close(), None);
    }

    #[test]
    fn abort_signal_is_sticky_and_keeps_first_reason() {
        let handle = detached_handle();
        assert!(!handle.is_aborted());
        handle.signal_abort(Some("first".into()));
        handle.signal_abort(Some("second".into()));
        assert!(handle.is_aborted());
        assert_eq!(handle.abort_reason().as_deref(), Some("first"));
        assert!(handle.abort_future().now_or_never().is_some());
    }

    #[test]
    fn with_abort_reports_reason() {
        let handle = detached_handle();
        let raced = handle.with_abort(futures::future::pending::<()>());
        handle.signal_abort(Some("stop".into()));
        match raced.now_or_never() {
            Some(Err(StreamError::Aborted(reason))) => assert_eq!(reason.as_deref(), Some("stop")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_on_dropped_stream_is_ignored() {
        let handle = detached_handle();
        handle.error("nobody listening".into());
    }
}
