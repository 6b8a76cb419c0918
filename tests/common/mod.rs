//! Common test utilities for query tests
//!
//! Provides shared helper functions for:
//! - Building an in-memory cluster with seeded tables
//! - Creating runtime environments over it
//! - Constructing query terms tersely

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use docql::ast::{Builtin, Comparison, Mapping, Predicate};
use docql::config::EngineConfig;
use docql::error::RuntimeResult;
use docql::executor::RuntimeEnvironment;
use docql::interrupt::Interruptor;
use docql::namespace::{ClusterMetadata, MemoryNamespace, MemoryNamespaceRepo};
use docql::scripting::ScriptPool;
use docql::stream::JsonStream;
use docql::{Query, Term};
use serde_json::{json, Value};

pub const DB: &str = "test";

/// Route test logs through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestCluster {
    pub metadata: Arc<ClusterMetadata>,
    pub repo: Arc<MemoryNamespaceRepo>,
    pub pool: Arc<ScriptPool>,
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            metadata: Arc::new(ClusterMetadata::new()),
            repo: Arc::new(MemoryNamespaceRepo::new()),
            pool: Arc::new(ScriptPool::new(2).unwrap()),
        }
    }

    pub fn create_table(&self, name: &str, primary_key: &str, shards: u16) -> Arc<MemoryNamespace> {
        let table = self.metadata.create_table(DB, name, primary_key, shards);
        self.repo.create_namespace(&table)
    }

    pub fn env(&self) -> RuntimeEnvironment {
        self.env_with(Interruptor::new())
    }

    pub fn env_with(&self, interruptor: Interruptor) -> RuntimeEnvironment {
        RuntimeEnvironment::new(
            self.pool.clone(),
            self.repo.clone(),
            self.metadata.clone(),
            interruptor,
            Arc::new(EngineConfig::default()),
        )
    }
}

/// A cluster with `test.users` (keyed by `_key`, 4 shards) and
/// `test.orders` (keyed by `id`, 2 shards).
pub fn create_seeded_cluster() -> (TestCluster, Arc<MemoryNamespace>, Arc<MemoryNamespace>) {
    let cluster = TestCluster::new();

    let users = cluster.create_table("users", "_key", 4);
    users
        .load(vec![
            json!({"_key": "alice", "name": "Alice", "age": 30, "dept": "eng"}),
            json!({"_key": "bob", "name": "Bob", "age": 25, "dept": "eng"}),
            json!({"_key": "charlie", "name": "Charlie", "age": 35, "dept": "sales"}),
            json!({"_key": "diana", "name": "Diana", "age": 28, "dept": "marketing"}),
        ])
        .unwrap();

    let orders = cluster.create_table("orders", "id", 2);
    orders
        .load(vec![
            json!({"id": 1, "user": "alice", "total": 100}),
            json!({"id": 2, "user": "bob", "total": 50}),
            json!({"id": 3, "user": "alice", "total": 25}),
            json!({"id": 4, "user": "charlie", "total": 75}),
            json!({"id": 5, "user": "alice", "total": 10}),
        ])
        .unwrap();

    (cluster, users, orders)
}

pub fn table(name: &str) -> Term {
    Term::table(DB, name)
}

pub fn attr(var: &str, name: &str) -> Term {
    Term::call(Builtin::GetAttr { attr: name.into() }, vec![Term::var(var)])
}

pub fn row(name: &str) -> Term {
    Term::call(Builtin::ImplicitGetAttr { attr: name.into() }, vec![])
}

pub fn cmp(comparison: Comparison, left: Term, right: Term) -> Term {
    Term::call(Builtin::Compare { comparison }, vec![left, right])
}

pub fn filter(source: Term, arg: &str, body: Term) -> Term {
    Term::call(
        Builtin::Filter {
            predicate: Predicate::new(arg, body),
        },
        vec![source],
    )
}

pub fn map(source: Term, arg: &str, body: Term) -> Term {
    Term::call(
        Builtin::Map {
            mapping: Mapping::new(arg, body),
        },
        vec![source],
    )
}

pub fn order_by(source: Term, key: &str) -> Term {
    Term::call(
        Builtin::OrderBy {
            keys: vec![docql::ast::OrderKey::asc(key)],
        },
        vec![source],
    )
}

pub fn read(term: Term) -> Query {
    Query::read(term)
}

/// Stream over fixed documents that counts how often it is pulled.
pub struct CountingStream {
    docs: Vec<Value>,
    index: usize,
    pulls: Arc<AtomicUsize>,
}

impl CountingStream {
    pub fn new(docs: Vec<Value>) -> (Self, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let stream = Self {
            docs,
            index: 0,
            pulls: pulls.clone(),
        };
        (stream, pulls)
    }
}

impl JsonStream for CountingStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let doc = self.docs.get(self.index).cloned();
        if doc.is_some() {
            self.index += 1;
        }
        Ok(doc)
    }
}

pub fn pulls(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}
