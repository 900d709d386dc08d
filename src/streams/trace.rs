//! Edge enumeration for host collectors.
//!
//! Streams, writers and controllers reference each other and a set of pending
//! completions. A host that tracks object lifetimes walks these references
//! through [`Traceable::visit_edges`]; every live reference an entity holds is
//! reported, none are hidden.

use super::completion::Completion;
use super::error::StreamError;
use std::any::Any;

/// One outgoing reference of a traced entity.
pub enum Edge<'a> {
    /// A writer's reference to the stream it is locked to.
    Stream,
    Controller,
    Writer,
    /// A completion owned by the entity, tagged with the slot that holds it.
    Completion(&'static str, &'a Completion),
    StoredError(&'a StreamError),
    AbortReason(Option<&'a str>),
    Chunk(&'a dyn Any),
}

pub trait EdgeVisitor {
    fn visit(&mut self, edge: Edge<'_>);
}

pub trait Traceable {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor);
}

/// Visitor that counts edges by kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EdgeCounts {
    pub streams: usize,
    pub controllers: usize,
    pub writers: usize,
    pub completions: usize,
    pub stored_errors: usize,
    pub abort_reasons: usize,
    pub chunks: usize,
}

impl EdgeVisitor for EdgeCounts {
    fn visit(&mut self, edge: Edge<'_>) {
        match edge {
            Edge::Stream => self.streams += 1,
            Edge::Controller => self.controllers += 1,
            Edge::Writer => self.writers += 1,
            Edge::Completion(..) => self.completions += 1,
            Edge::StoredError(_) => self.stored_errors += 1,
            Edge::AbortReason(_) => self.abort_reasons += 1,
            Edge::Chunk(_) => self.chunks += 1,
        }
    }
}

impl<F> EdgeVisitor for F
where
    F: FnMut(Edge<'_>),
{
    fn visit(&mut self, edge: Edge<'_>) {
        self(edge)
    }
}

impl<T: Traceable + ?Sized> Traceable for &T {
    fn visit_edges(&self, visitor: &mut dyn EdgeVisitor) {
        (**self).visit_edges(visitor)
    }
}
