//! Query evaluation.
//!
//! The evaluator walks a type-checked tree. JSON-typed terms are evaluated
//! eagerly by [`eval`]; stream-typed terms become lazy operator pipelines via
//! [`eval_stream`], and write targets are resolved to a [`View`] by
//! [`eval_view`]. [`run_query`] ties checking and execution together.

mod eval;
mod eval_stream;
pub mod helpers;
mod query;
mod response;
mod write;

pub use eval::{eval, eval_call, eval_cmp};
pub use eval_stream::{eval_stream, eval_stream_call, eval_table_ref, eval_view, View};
pub use query::{execute, execute_read, run_query, run_query_str};
pub use response::{Response, ResponseEnvelope, StatusCode, WriteSummary};
pub use write::execute_write;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::Value;

use crate::ast::Term;
use crate::backtrace::Backtrace;
use crate::config::EngineConfig;
use crate::error::{RuntimeError, RuntimeResult, ScriptError};
use crate::interrupt::Interruptor;
use crate::namespace::{MetadataView, NamespaceAccess, NamespaceRepo};
use crate::scope::{ImplicitValue, VariableScope};
use crate::scripting::ScriptPool;
use crate::stream::SharedStream;
use crate::typecheck::{get_term_type, TermType, TypeEnvironment};

/// A stream bound to a name by `let`. Views keep their table so a bound
/// view stays a valid write target.
#[derive(Clone)]
pub struct BoundStream {
    pub shared: SharedStream,
    pub access: Option<Arc<dyn NamespaceAccess>>,
}

/// Everything evaluation needs: lexical scopes and handles to the cluster.
///
/// Cloning is cheap apart from the scopes themselves; lazy stream operators
/// keep a clone so the bindings they were created under survive across
/// pulls.
#[derive(Clone)]
pub struct RuntimeEnvironment {
    pub scope: VariableScope<Value>,
    pub stream_scope: VariableScope<BoundStream>,
    pub type_env: TypeEnvironment,
    pub implicit_value: ImplicitValue<Value>,
    pub script_pool: Arc<ScriptPool>,
    pub ns_repo: Arc<dyn NamespaceRepo>,
    pub metadata: Arc<dyn MetadataView>,
    pub interruptor: Interruptor,
    pub config: Arc<EngineConfig>,
}

impl RuntimeEnvironment {
    pub fn new(
        script_pool: Arc<ScriptPool>,
        ns_repo: Arc<dyn NamespaceRepo>,
        metadata: Arc<dyn MetadataView>,
        interruptor: Interruptor,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            scope: VariableScope::new(),
            stream_scope: VariableScope::new(),
            type_env: TypeEnvironment::new(),
            implicit_value: ImplicitValue::new(),
            script_pool,
            ns_repo,
            metadata,
            interruptor,
            config,
        }
    }

    /// Build an environment with a fresh script pool sized from `config`.
    pub fn from_config(
        config: EngineConfig,
        ns_repo: Arc<dyn NamespaceRepo>,
        metadata: Arc<dyn MetadataView>,
    ) -> Result<Self, ScriptError> {
        let pool = ScriptPool::with_wait_poll(config.script_pool_size, config.script_wait_poll())?;
        Ok(Self::new(
            Arc::new(pool),
            ns_repo,
            metadata,
            Interruptor::new(),
            Arc::new(config),
        ))
    }

    /// Push a frame on the value, stream and type scopes.
    pub fn new_scope(&mut self) -> RuntimeFrame<'_> {
        self.push_scopes();
        RuntimeFrame {
            env: self,
            implicit: false,
        }
    }

    /// Push a frame binding `arg` to `row`, with `row` as the implicit value.
    pub fn row_scope(&mut self, arg: &str, row: Value) -> RuntimeFrame<'_> {
        self.push_scopes();
        self.implicit_value.push_value(row.clone());
        self.type_env.implicit_type.push_value(TermType::Json);
        self.bind_value(arg, row);
        RuntimeFrame {
            env: self,
            implicit: true,
        }
    }

    /// Push a frame with no implicit value visible.
    pub fn opaque_scope(&mut self) -> RuntimeFrame<'_> {
        self.push_scopes();
        self.implicit_value.push();
        self.type_env.implicit_type.push();
        RuntimeFrame {
            env: self,
            implicit: true,
        }
    }

    fn push_scopes(&mut self) {
        self.scope.push();
        self.stream_scope.push();
        self.type_env.scope.push();
    }

    pub fn bind_value(&mut self, name: &str, value: Value) {
        self.scope.put_in_scope(name, value);
        self.type_env.scope.put_in_scope(name, TermType::Json);
    }

    pub fn bind_stream(&mut self, name: &str, stream: BoundStream) {
        let term_type = if stream.access.is_some() {
            TermType::View
        } else {
            TermType::Stream
        };
        self.stream_scope.put_in_scope(name, stream);
        self.type_env.scope.put_in_scope(name, term_type);
    }

    /// Type of `term` under the current bindings. The tree was checked
    /// before evaluation, so a failure here is reported as a runtime error.
    pub fn type_of(&mut self, term: &Term, backtrace: &Backtrace) -> RuntimeResult<TermType> {
        get_term_type(term, &mut self.type_env, backtrace)
            .map_err(|e| RuntimeError::new(e.message(), backtrace))
    }
}

/// Scope frames pushed on a [`RuntimeEnvironment`]; popped on drop.
pub struct RuntimeFrame<'a> {
    env: &'a mut RuntimeEnvironment,
    implicit: bool,
}

impl Deref for RuntimeFrame<'_> {
    type Target = RuntimeEnvironment;

    fn deref(&self) -> &Self::Target {
        self.env
    }
}

impl DerefMut for RuntimeFrame<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.env
    }
}

impl Drop for RuntimeFrame<'_> {
    fn drop(&mut self) {
        self.env.scope.pop();
        self.env.stream_scope.pop();
        self.env.type_env.scope.pop();
        if self.implicit {
            self.env.implicit_value.pop();
            self.env.type_env.implicit_type.pop();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::namespace::{ClusterMetadata, MemoryNamespace, MemoryNamespaceRepo};

    /// A runtime environment over an in-memory cluster with one table,
    /// `test.users`, keyed by `id`.
    pub fn users_env(docs: Vec<Value>) -> (RuntimeEnvironment, Arc<MemoryNamespace>) {
        let metadata = Arc::new(ClusterMetadata::new());
        let repo = Arc::new(MemoryNamespaceRepo::new());
        let table = metadata.create_table("test", "users", "id", 1);
        let users = repo.create_namespace(&table);
        users.load(docs).unwrap();

        let env = RuntimeEnvironment::new(
            Arc::new(ScriptPool::new(1).unwrap()),
            repo,
            metadata,
            Interruptor::new(),
            Arc::new(EngineConfig::default()),
        );
        (env, users)
    }
}
