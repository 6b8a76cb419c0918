//! Stream operators. Each owns its source exclusively.

use std::collections::{BTreeSet, VecDeque};

use serde_json::Value;

use super::{BoxedStream, DocMapping, DocPredicate, DocStreamMapping, JsonStream};
use crate::backtrace::Backtrace;
use crate::error::{RuntimeError, RuntimeResult};
use crate::executor::helpers::OrderedValue;
use crate::interrupt::Interruptor;

/// Concatenation: every document of stream `i` before any of stream `i + 1`.
pub struct UnionStream {
    streams: VecDeque<BoxedStream>,
}

impl UnionStream {
    pub fn new(streams: Vec<BoxedStream>) -> Self {
        Self {
            streams: streams.into(),
        }
    }
}

impl JsonStream for UnionStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        while let Some(head) = self.streams.front_mut() {
            if let Some(doc) = head.next()? {
                return Ok(Some(doc));
            }
            self.streams.pop_front();
        }
        Ok(None)
    }
}

pub struct FilterStream<P> {
    source: BoxedStream,
    predicate: P,
    exhausted: bool,
}

impl<P: DocPredicate> FilterStream<P> {
    pub fn new(source: BoxedStream, predicate: P) -> Self {
        Self {
            source,
            predicate,
            exhausted: false,
        }
    }
}

impl<P: DocPredicate> JsonStream for FilterStream<P> {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        if self.exhausted {
            return Ok(None);
        }
        while let Some(doc) = self.source.next()? {
            if self.predicate.test(&doc)? {
                return Ok(Some(doc));
            }
        }
        self.exhausted = true;
        Ok(None)
    }
}

pub struct MapStream<F> {
    source: BoxedStream,
    mapping: F,
}

impl<F: DocMapping> MapStream<F> {
    pub fn new(source: BoxedStream, mapping: F) -> Self {
        Self { source, mapping }
    }
}

impl<F: DocMapping> JsonStream for MapStream<F> {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        match self.source.next()? {
            Some(doc) => Ok(Some(self.mapping.apply(doc)?)),
            None => Ok(None),
        }
    }
}

/// Flat-map. The sub-stream of document `i` is drained before the source
/// is pulled for document `i + 1`.
pub struct ConcatMapStream<F> {
    source: BoxedStream,
    mapping: F,
    // None before the first outer pull and after the source is drained.
    current: Option<BoxedStream>,
    exhausted: bool,
}

impl<F: DocStreamMapping> ConcatMapStream<F> {
    pub fn new(source: BoxedStream, mapping: F) -> Self {
        Self {
            source,
            mapping,
            current: None,
            exhausted: false,
        }
    }
}

impl<F: DocStreamMapping> JsonStream for ConcatMapStream<F> {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(doc) = current.next()? {
                    return Ok(Some(doc));
                }
                self.current = None;
            }
            if self.exhausted {
                return Ok(None);
            }
            match self.source.next()? {
                Some(doc) => self.current = Some(self.mapping.apply(doc)?),
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }
    }
}

fn non_negative(count: i64, what: &str, backtrace: &Backtrace) -> RuntimeResult<usize> {
    usize::try_from(count).map_err(|_| {
        RuntimeError::new(
            format!("{} must be non-negative, got {}", what, count),
            backtrace,
        )
    })
}

/// Yields at most `limit` documents. A limit of zero never touches the
/// source.
pub struct LimitStream {
    source: BoxedStream,
    remaining: usize,
}

impl LimitStream {
    pub fn new(source: BoxedStream, limit: i64, backtrace: &Backtrace) -> RuntimeResult<Self> {
        Ok(Self {
            source,
            remaining: non_negative(limit, "limit", backtrace)?,
        })
    }
}

impl JsonStream for LimitStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.source.next()? {
            Some(doc) => {
                self.remaining -= 1;
                Ok(Some(doc))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }
}

/// Drops the first `count` documents.
pub struct SkipStream {
    source: BoxedStream,
    to_skip: usize,
}

impl SkipStream {
    pub fn new(source: BoxedStream, count: i64, backtrace: &Backtrace) -> RuntimeResult<Self> {
        Ok(Self {
            source,
            to_skip: non_negative(count, "skip count", backtrace)?,
        })
    }
}

impl JsonStream for SkipStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        while self.to_skip > 0 {
            if self.source.next()?.is_none() {
                self.to_skip = 0;
                return Ok(None);
            }
            self.to_skip -= 1;
        }
        self.source.next()
    }
}

/// Keeps the first occurrence of each document, in source order.
pub struct DistinctStream {
    source: BoxedStream,
    seen: BTreeSet<OrderedValue>,
}

impl DistinctStream {
    pub fn new(source: BoxedStream) -> Self {
        Self {
            source,
            seen: BTreeSet::new(),
        }
    }
}

impl JsonStream for DistinctStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        while let Some(doc) = self.source.next()? {
            if self.seen.insert(OrderedValue(doc.clone())) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }
}

/// Checks the interruptor before every pull.
pub struct InterruptibleStream {
    source: BoxedStream,
    interruptor: Interruptor,
    backtrace: Backtrace,
}

impl InterruptibleStream {
    pub fn new(source: BoxedStream, interruptor: Interruptor, backtrace: Backtrace) -> Self {
        Self {
            source,
            interruptor,
            backtrace,
        }
    }
}

impl JsonStream for InterruptibleStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        self.interruptor.check(&self.backtrace)?;
        self.source.next()
    }
}
