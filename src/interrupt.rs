//! Cooperative cancellation signal shared by one query's evaluation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backtrace::Backtrace;
use crate::error::{RuntimeError, RuntimeResult};

#[derive(Debug, Clone, Default)]
pub struct Interruptor {
    tripped: Arc<AtomicBool>,
}

impl Interruptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Every clone observes it.
    pub fn trip(&self) {
        if !self.tripped.swap(true, Ordering::AcqRel) {
            tracing::info!("[QUERY] Interruptor tripped");
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn check(&self, backtrace: &Backtrace) -> RuntimeResult<()> {
        if self.is_tripped() {
            Err(RuntimeError::new("query interrupted", backtrace))
        } else {
            Ok(())
        }
    }
}
