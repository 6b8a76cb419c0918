//! Lazily pulled document streams.
//!
//! A stream yields `Ok(Some(doc))` until it is drained, then `Ok(None)`
//! forever. Operators wrap a source stream they own exclusively; the only
//! shared stream is the fan-out multiplexer, which lets several cursors
//! replay one source.

mod multiplexer;
mod operators;

pub use multiplexer::{MultiplexedStream, SharedStream, StreamMultiplexer};
pub use operators::{
    ConcatMapStream, DistinctStream, FilterStream, InterruptibleStream, LimitStream, MapStream,
    SkipStream, UnionStream,
};

use std::cmp::Ordering;
use std::collections::VecDeque;

use serde_json::Value;

use crate::error::RuntimeResult;

pub trait JsonStream: Send {
    /// Pull the next document, or `None` once the stream is drained.
    fn next(&mut self) -> RuntimeResult<Option<Value>>;
}

pub type BoxedStream = Box<dyn JsonStream>;

impl<S: JsonStream + ?Sized> JsonStream for Box<S> {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        (**self).next()
    }
}

/// Decides whether a document passes a filter.
pub trait DocPredicate: Send {
    fn test(&mut self, doc: &Value) -> RuntimeResult<bool>;
}

impl<F> DocPredicate for F
where
    F: FnMut(&Value) -> RuntimeResult<bool> + Send,
{
    fn test(&mut self, doc: &Value) -> RuntimeResult<bool> {
        self(doc)
    }
}

/// Transforms one document into another.
pub trait DocMapping: Send {
    fn apply(&mut self, doc: Value) -> RuntimeResult<Value>;
}

impl<F> DocMapping for F
where
    F: FnMut(Value) -> RuntimeResult<Value> + Send,
{
    fn apply(&mut self, doc: Value) -> RuntimeResult<Value> {
        self(doc)
    }
}

/// Transforms one document into a sub-stream.
pub trait DocStreamMapping: Send {
    fn apply(&mut self, doc: Value) -> RuntimeResult<BoxedStream>;
}

impl<F> DocStreamMapping for F
where
    F: FnMut(Value) -> RuntimeResult<BoxedStream> + Send,
{
    fn apply(&mut self, doc: Value) -> RuntimeResult<BoxedStream> {
        self(doc)
    }
}

/// A finite, already materialized sequence.
#[derive(Debug, Default)]
pub struct InMemoryStream {
    data: VecDeque<Value>,
}

impl InMemoryStream {
    pub fn new<I: IntoIterator<Item = Value>>(docs: I) -> Self {
        Self {
            data: docs.into_iter().collect(),
        }
    }

    /// Drain `stream` into memory.
    pub fn from_stream<S: JsonStream + ?Sized>(stream: &mut S) -> RuntimeResult<Self> {
        let mut data = VecDeque::new();
        while let Some(doc) = stream.next()? {
            data.push_back(doc);
        }
        Ok(Self { data })
    }

    /// Stable sort of the remaining documents.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        self.data.make_contiguous().sort_by(compare);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.data.iter()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.data.into()
    }
}

impl JsonStream for InMemoryStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        Ok(self.data.pop_front())
    }
}

/// Pull every remaining document of `stream`, in order.
pub fn drain<S: JsonStream + ?Sized>(stream: &mut S) -> RuntimeResult<Vec<Value>> {
    Ok(InMemoryStream::from_stream(stream)?.into_vec())
}
