//! Query tree.
//!
//! The protocol layer hands us a parsed tree; these types are its shape.
//! Every node derives serde so the tree can be decoded from JSON, with a
//! decode failure reported as a [`MalformedQuery`].

use serde::{Deserialize, Serialize};

use crate::error::MalformedQuery;

/// Reference to a table by database and table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub db_name: String,
    pub table_name: String,
}

impl TableRef {
    pub fn new(db_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            table_name: table_name.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db_name, self.table_name)
    }
}

/// A name bound to a term, used by `let` and object literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub term: Term,
}

impl Binding {
    pub fn new(name: impl Into<String>, term: Term) -> Self {
        Self {
            name: name.into(),
            term,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Term {
    Var {
        name: String,
    },
    Let {
        binds: Vec<Binding>,
        expr: Box<Term>,
    },
    Call {
        builtin: Builtin,
        #[serde(default)]
        args: Vec<Term>,
    },
    If {
        test: Box<Term>,
        true_branch: Box<Term>,
        false_branch: Box<Term>,
    },
    Error {
        message: String,
    },
    Number {
        value: f64,
    },
    String {
        value: String,
    },
    /// A JSON literal given as text.
    Json {
        raw: String,
    },
    Bool {
        value: bool,
    },
    Null,
    Array {
        #[serde(default)]
        elements: Vec<Term>,
    },
    Object {
        #[serde(default)]
        fields: Vec<Binding>,
    },
    GetByKey {
        table: TableRef,
        attr: String,
        key: Box<Term>,
    },
    Table {
        table: TableRef,
    },
    /// Function body run by the external-function pool.
    Script {
        source: String,
    },
    /// The current row inside a predicate or mapping body.
    ImplicitVar,
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Term::Var { name: name.into() }
    }

    pub fn number(value: f64) -> Self {
        Term::Number { value }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Term::String {
            value: value.into(),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Term::Bool { value }
    }

    pub fn json(raw: impl Into<String>) -> Self {
        Term::Json { raw: raw.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Term::Error {
            message: message.into(),
        }
    }

    pub fn array(elements: Vec<Term>) -> Self {
        Term::Array { elements }
    }

    pub fn object<K: Into<String>>(fields: Vec<(K, Term)>) -> Self {
        Term::Object {
            fields: fields
                .into_iter()
                .map(|(k, t)| Binding::new(k, t))
                .collect(),
        }
    }

    pub fn call(builtin: Builtin, args: Vec<Term>) -> Self {
        Term::Call { builtin, args }
    }

    pub fn let_in<K: Into<String>>(binds: Vec<(K, Term)>, expr: Term) -> Self {
        Term::Let {
            binds: binds
                .into_iter()
                .map(|(k, t)| Binding::new(k, t))
                .collect(),
            expr: Box::new(expr),
        }
    }

    pub fn if_then_else(test: Term, true_branch: Term, false_branch: Term) -> Self {
        Term::If {
            test: Box::new(test),
            true_branch: Box::new(true_branch),
            false_branch: Box::new(false_branch),
        }
    }

    pub fn table(db_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Term::Table {
            table: TableRef::new(db_name, table_name),
        }
    }

    pub fn get_by_key(table: TableRef, attr: impl Into<String>, key: Term) -> Self {
        Term::GetByKey {
            table,
            attr: attr.into(),
            key: Box::new(key),
        }
    }

    pub fn script(source: impl Into<String>) -> Self {
        Term::Script {
            source: source.into(),
        }
    }

    /// Short name of the term kind, used in error messages and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Term::Var { .. } => "var",
            Term::Let { .. } => "let",
            Term::Call { .. } => "call",
            Term::If { .. } => "if",
            Term::Error { .. } => "error",
            Term::Number { .. } => "number",
            Term::String { .. } => "string",
            Term::Json { .. } => "json",
            Term::Bool { .. } => "bool",
            Term::Null => "null",
            Term::Array { .. } => "array",
            Term::Object { .. } => "object",
            Term::GetByKey { .. } => "get_by_key",
            Term::Table { .. } => "table",
            Term::Script { .. } => "script",
            Term::ImplicitVar => "implicit_var",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Sort key for `order_by`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderKey {
    pub attr: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_ascending() -> bool {
    true
}

impl OrderKey {
    pub fn asc(attr: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            ascending: true,
        }
    }

    pub fn desc(attr: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            ascending: false,
        }
    }
}

/// One-argument function producing a document (or a stream for concat-map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub arg: String,
    pub body: Box<Term>,
}

impl Mapping {
    pub fn new(arg: impl Into<String>, body: Term) -> Self {
        Self {
            arg: arg.into(),
            body: Box::new(body),
        }
    }
}

/// One-argument function producing a boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub arg: String,
    pub body: Box<Term>,
}

impl Predicate {
    pub fn new(arg: impl Into<String>, body: Term) -> Self {
        Self {
            arg: arg.into(),
            body: Box::new(body),
        }
    }
}

/// Left fold: `body` combines the accumulator `var1` with the element `var2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    pub base: Box<Term>,
    pub var1: String,
    pub var2: String,
    pub body: Box<Term>,
}

impl Reduction {
    pub fn new(base: Term, var1: impl Into<String>, var2: impl Into<String>, body: Term) -> Self {
        Self {
            base: Box::new(base),
            var1: var1.into(),
            var2: var2.into(),
            body: Box::new(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Builtin {
    Not,
    GetAttr {
        attr: String,
    },
    ImplicitGetAttr {
        attr: String,
    },
    HasAttr {
        attr: String,
    },
    ImplicitHasAttr {
        attr: String,
    },
    PickAttrs {
        attrs: Vec<String>,
    },
    ImplicitPickAttrs {
        attrs: Vec<String>,
    },
    Without {
        attrs: Vec<String>,
    },
    ImplicitWithout {
        attrs: Vec<String>,
    },
    MapMerge,
    ArrayAppend,
    ArrayConcat,
    ArraySlice,
    ArrayNth,
    ArrayLength,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Compare {
        comparison: Comparison,
    },
    Any,
    All,
    Filter {
        predicate: Predicate,
    },
    Map {
        mapping: Mapping,
    },
    ConcatMap {
        mapping: Mapping,
    },
    OrderBy {
        keys: Vec<OrderKey>,
    },
    Distinct,
    Limit,
    Skip,
    Length,
    Union,
    Nth,
    StreamToArray,
    ArrayToStream,
    Reduce {
        reduction: Reduction,
    },
    GroupedMapReduce {
        group_mapping: Mapping,
        value_mapping: Mapping,
        reduction: Reduction,
    },
    Range {
        attr: String,
        #[serde(default)]
        lower: Option<Box<Term>>,
        #[serde(default)]
        upper: Option<Box<Term>>,
    },
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Not => "not",
            Builtin::GetAttr { .. } => "get_attr",
            Builtin::ImplicitGetAttr { .. } => "implicit_get_attr",
            Builtin::HasAttr { .. } => "has_attr",
            Builtin::ImplicitHasAttr { .. } => "implicit_has_attr",
            Builtin::PickAttrs { .. } => "pick_attrs",
            Builtin::ImplicitPickAttrs { .. } => "implicit_pick_attrs",
            Builtin::Without { .. } => "without",
            Builtin::ImplicitWithout { .. } => "implicit_without",
            Builtin::MapMerge => "map_merge",
            Builtin::ArrayAppend => "array_append",
            Builtin::ArrayConcat => "array_concat",
            Builtin::ArraySlice => "array_slice",
            Builtin::ArrayNth => "array_nth",
            Builtin::ArrayLength => "array_length",
            Builtin::Add => "add",
            Builtin::Subtract => "subtract",
            Builtin::Multiply => "multiply",
            Builtin::Divide => "divide",
            Builtin::Modulo => "modulo",
            Builtin::Compare { .. } => "compare",
            Builtin::Any => "any",
            Builtin::All => "all",
            Builtin::Filter { .. } => "filter",
            Builtin::Map { .. } => "map",
            Builtin::ConcatMap { .. } => "concat_map",
            Builtin::OrderBy { .. } => "order_by",
            Builtin::Distinct => "distinct",
            Builtin::Limit => "limit",
            Builtin::Skip => "skip",
            Builtin::Length => "length",
            Builtin::Union => "union",
            Builtin::Nth => "nth",
            Builtin::StreamToArray => "stream_to_array",
            Builtin::ArrayToStream => "array_to_stream",
            Builtin::Reduce { .. } => "reduce",
            Builtin::GroupedMapReduce { .. } => "grouped_map_reduce",
            Builtin::Range { .. } => "range",
        }
    }

    /// Stream builtins that keep their input's table binding when applied
    /// to a view.
    pub fn preserves_view(&self) -> bool {
        matches!(
            self,
            Builtin::Filter { .. }
                | Builtin::OrderBy { .. }
                | Builtin::Distinct
                | Builtin::Limit
                | Builtin::Skip
                | Builtin::Range { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadQuery {
    pub term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteQuery {
    Update {
        view: Term,
        mapping: Mapping,
    },
    Delete {
        view: Term,
    },
    Mutate {
        view: Term,
        mapping: Mapping,
    },
    Insert {
        table: TableRef,
        terms: Vec<Term>,
    },
    ForEach {
        stream: Term,
        var: String,
        queries: Vec<WriteQuery>,
    },
    PointUpdate {
        table: TableRef,
        attr: String,
        key: Term,
        mapping: Mapping,
    },
    PointDelete {
        table: TableRef,
        attr: String,
        key: Term,
    },
    PointMutate {
        table: TableRef,
        attr: String,
        key: Term,
        mapping: Mapping,
    },
}

impl WriteQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteQuery::Update { .. } => "update",
            WriteQuery::Delete { .. } => "delete",
            WriteQuery::Mutate { .. } => "mutate",
            WriteQuery::Insert { .. } => "insert",
            WriteQuery::ForEach { .. } => "for_each",
            WriteQuery::PointUpdate { .. } => "point_update",
            WriteQuery::PointDelete { .. } => "point_delete",
            WriteQuery::PointMutate { .. } => "point_mutate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Read(ReadQuery),
    Write(WriteQuery),
}

impl Query {
    pub fn read(term: Term) -> Self {
        Query::Read(ReadQuery { term })
    }

    /// Decode a query tree from its JSON wire form.
    pub fn from_json_str(input: &str) -> Result<Self, MalformedQuery> {
        serde_json::from_str(input).map_err(|e| MalformedQuery::new(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, MalformedQuery> {
        serde_json::from_value(value).map_err(|e| MalformedQuery::new(e.to_string()))
    }
}
