pub mod ast;
pub mod backtrace;
pub mod config;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod namespace;
pub mod scope;
pub mod scripting;
pub mod stream;
pub mod typecheck;

pub use ast::{Builtin, Query, ReadQuery, TableRef, Term, WriteQuery};
pub use backtrace::{Backtrace, Frame};
pub use config::EngineConfig;
pub use error::{
    BadQueryError, ErrorCategory, MalformedQuery, QueryError, QueryResult, RuntimeError,
    RuntimeResult, ScriptError, StorageError,
};
pub use executor::{
    run_query, run_query_str, Response, ResponseEnvelope, RuntimeEnvironment, StatusCode,
    WriteSummary,
};
pub use interrupt::Interruptor;
pub use namespace::{ClusterMetadata, MemoryNamespace, MemoryNamespaceRepo};
pub use scripting::ScriptPool;
pub use typecheck::{check_query_type, TermType, TypeEnvironment};
