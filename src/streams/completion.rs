//! Promise-like completion handles.
//!
//! A [`Completion`] is a shared, settle-once cell: it starts `Pending` and moves
//! to `Fulfilled` or `Rejected` exactly once. Clones share the same state, so a
//! handle returned to a caller observes settlement performed by the stream.
//! Awaiting a completion registers the task's waker; the executor that owns the
//! task is the job queue that resumes it.

use super::error::StreamError;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

type StreamResult<T> = Result<T, StreamError>;

type Continuation = Box<dyn FnOnce(&StreamResult<()>)>;

/// Observable state of a [`Completion`].
#[derive(Debug, Clone)]
pub enum CompletionState {
    Pending,
    Fulfilled,
    Rejected(StreamError),
}

impl CompletionState {
    fn as_result(&self) -> Option<StreamResult<()>> {
        match self {
            CompletionState::Pending => None,
            CompletionState::Fulfilled => Some(Ok(())),
            CompletionState::Rejected(err) => Some(Err(err.clone())),
        }
    }
}

/// A set of wakers without duplicates (based on `will_wake`).
#[derive(Default)]
pub(crate) struct WakerSet(Vec<Waker>);

impl WakerSet {
    pub(crate) fn new() -> Self {
        WakerSet(Vec::new())
    }

    pub(crate) fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    /// Wake all registered wakers and clear the set.
    pub(crate) fn wake_all(&mut self) {
        for waker in self.0.drain(..) {
            waker.wake();
        }
    }
}

struct CompletionInner {
    state: CompletionState,
    wakers: WakerSet,
    continuations: Vec<Continuation>,
}

#[derive(Clone)]
pub struct Completion {
    inner: Rc<RefCell<CompletionInner>>,
}

impl Completion {
    fn with_state(state: CompletionState) -> Self {
        Self {
            inner: Rc::new(RefCell::new(CompletionInner {
                state,
                wakers: WakerSet::new(),
                continuations: Vec::new(),
            })),
        }
    }

    pub fn pending() -> Self {
        Self::with_state(CompletionState::Pending)
    }

    pub fn resolved() -> Self {
        Self::with_state(CompletionState::Fulfilled)
    }

    pub fn rejected(error: StreamError) -> Self {
        Self::with_state(CompletionState::Rejected(error))
    }

    pub fn state(&self) -> CompletionState {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, CompletionState::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.borrow().state, CompletionState::Fulfilled)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, CompletionState::Rejected(_))
    }

    /// The settled result, or `None` while pending.
    pub fn result(&self) -> Option<StreamResult<()>> {
        self.inner.borrow().state.as_result()
    }

    /// True when both handles share one completion.
    pub fn ptr_eq(&self, other: &Completion) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn resolve(&self) -> bool {
        self.settle(CompletionState::Fulfilled)
    }

    pub(crate) fn reject(&self, error: StreamError) -> bool {
        self.settle(CompletionState::Rejected(error))
    }

    /// Settle with an operation's result.
    pub(crate) fn settle_with(&self, result: StreamResult<()>) -> bool {
        match result {
            Ok(()) => self.resolve(),
            Err(err) => self.reject(err),
        }
    }

    /// Run `f` once this completion settles. Runs immediately if already settled.
    ///
    /// Continuations run inline at settlement and must not call back into a stream.
    pub(crate) fn on_settle<F>(&self, f: F)
    where
        F: FnOnce(&StreamResult<()>) + 'static,
    {
        let settled = {
            let mut inner = self.inner.borrow_mut();
            match inner.state.as_result() {
                Some(result) => result,
                None => {
                    inner.continuations.push(Box::new(f));
                    return;
                }
            }
        };
        f(&settled);
    }

    fn settle(&self, state: CompletionState) -> bool {
        let (result, continuations) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, CompletionState::Pending) {
                return false;
            }
            inner.state = state;
            inner.wakers.wake_all();
            let result = inner.state.as_result();
            (result, std::mem::take(&mut inner.continuations))
        };
        if let Some(result) = result {
            for continuation in continuations {
                continuation(&result);
            }
        }
        true
    }
}

impl Future for Completion {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match inner.state.as_result() {
            Some(result) => Poll::Ready(result),
            None => {
                inner.wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completion")
            .field(&self.inner.borrow().state)
            .finish()
    }
}
