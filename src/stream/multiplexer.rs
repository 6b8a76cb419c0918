//! Fan-out of one stream to many independent cursors.
//!
//! Documents pulled from the source are appended to a shared buffer before
//! any cursor sees them, so the source is read at most once per document no
//! matter how many cursors replay it. Access to the buffer is serialized by
//! a mutex, which also makes cursors safe to drain from different threads.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::{BoxedStream, JsonStream};
use crate::error::RuntimeResult;

pub struct StreamMultiplexer {
    source: BoxedStream,
    data: Vec<Value>,
    exhausted: bool,
}

impl StreamMultiplexer {
    pub fn new(source: BoxedStream) -> Self {
        Self {
            source,
            data: Vec::new(),
            exhausted: false,
        }
    }

    /// Pull one more document into the buffer. Returns `false` once the
    /// source is drained; the source is not pulled again after that.
    fn maybe_read_more(&mut self) -> RuntimeResult<bool> {
        if self.exhausted {
            return Ok(false);
        }
        match self.source.next()? {
            Some(doc) => {
                self.data.push(doc);
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }
}

/// Shared handle to a multiplexer; clones refer to the same buffer.
#[derive(Clone)]
pub struct SharedStream {
    inner: Arc<Mutex<StreamMultiplexer>>,
}

impl SharedStream {
    pub fn new(source: BoxedStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamMultiplexer::new(source))),
        }
    }

    /// A new cursor positioned at the first document.
    pub fn cursor(&self) -> MultiplexedStream {
        MultiplexedStream {
            parent: self.inner.clone(),
            index: 0,
        }
    }

    /// Number of documents buffered so far.
    pub fn buffered(&self) -> usize {
        self.inner.lock().data.len()
    }
}

pub struct MultiplexedStream {
    parent: Arc<Mutex<StreamMultiplexer>>,
    index: usize,
}

impl JsonStream for MultiplexedStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        let mut parent = self.parent.lock();
        while self.index >= parent.data.len() {
            if !parent.maybe_read_more()? {
                return Ok(None);
            }
        }
        let doc = parent.data[self.index].clone();
        self.index += 1;
        Ok(Some(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::drain;
    use crate::stream::testing::{pulls, CountingStream};
    use serde_json::json;

    #[test]
    fn test_source_read_once() {
        let (source, counter) = CountingStream::new(vec![json!(1), json!(2), json!(3)]);
        let shared = SharedStream::new(Box::new(source));

        let mut a = shared.cursor();
        let mut b = shared.cursor();
        assert_eq!(drain(&mut a).unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(drain(&mut b).unwrap(), vec![json!(1), json!(2), json!(3)]);

        // Three data pulls plus one end-of-stream pull.
        assert_eq!(pulls(&counter), 4);
        assert_eq!(shared.buffered(), 3);
    }

    #[test]
    fn test_interleaved_cursors() {
        let (source, counter) = CountingStream::new(vec![json!("a"), json!("b")]);
        let shared = SharedStream::new(Box::new(source));
        let mut a = shared.cursor();
        let mut b = shared.cursor();

        assert_eq!(a.next().unwrap(), Some(json!("a")));
        assert_eq!(b.next().unwrap(), Some(json!("a")));
        assert_eq!(b.next().unwrap(), Some(json!("b")));
        assert_eq!(a.next().unwrap(), Some(json!("b")));
        assert_eq!(a.next().unwrap(), None);
        assert_eq!(b.next().unwrap(), None);
        assert_eq!(b.next().unwrap(), None);
        assert_eq!(pulls(&counter), 3);
    }

    #[test]
    fn test_late_cursor_replays_from_start() {
        let shared = SharedStream::new(Box::new(crate::stream::InMemoryStream::new(vec![
            json!(1),
            json!(2),
        ])));
        let mut first = shared.cursor();
        drain(&mut first).unwrap();

        let mut late = shared.cursor();
        assert_eq!(drain(&mut late).unwrap(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_cursors_on_threads() {
        let docs: Vec<Value> = (0..100).map(|i| json!(i)).collect();
        let (source, counter) = CountingStream::new(docs.clone());
        let shared = SharedStream::new(Box::new(source));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mut cursor = shared.cursor();
                std::thread::spawn(move || drain(&mut cursor).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), docs);
        }
        assert_eq!(pulls(&counter), 101);
    }
}
