//! Backtraces locate a subterm inside a query tree.
//!
//! A backtrace is the path of child positions taken from the query root.
//! The type checker and evaluator extend it as they descend, so an error
//! raised deep inside the tree can be walked back to the exact node with
//! [`Backtrace::resolve`].

use serde::Serialize;

use crate::ast::{Builtin, Mapping, Predicate, Query, Reduction, Term, WriteQuery};

/// One step from a node to one of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Call argument by index.
    Arg(usize),
    /// `let` binding by name.
    Bind(String),
    /// Body of a `let`.
    Expr,
    Test,
    TrueBranch,
    FalseBranch,
    /// Array literal element, or insert payload, by index.
    Element(usize),
    /// Object literal field by name.
    Attr(String),
    /// Key of a point lookup or point write.
    Key,
    /// Body of a mapping, predicate or reduction.
    Body,
    /// Base of a reduction.
    Base,
    Predicate,
    Mapping,
    Reduction,
    /// Grouping mapping of a grouped map-reduce.
    Group,
    /// Value mapping of a grouped map-reduce.
    Value,
    Lower,
    Upper,
    /// Target of a view write.
    View,
    /// Source of a for-each write.
    Stream,
    /// Nested write query of a for-each, by index.
    Query(usize),
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Arg(i) => write!(f, "arg:{}", i),
            Frame::Bind(name) => write!(f, "bind:{}", name),
            Frame::Expr => write!(f, "expr"),
            Frame::Test => write!(f, "test"),
            Frame::TrueBranch => write!(f, "true"),
            Frame::FalseBranch => write!(f, "false"),
            Frame::Element(i) => write!(f, "elem:{}", i),
            Frame::Attr(name) => write!(f, "attr:{}", name),
            Frame::Key => write!(f, "key"),
            Frame::Body => write!(f, "body"),
            Frame::Base => write!(f, "base"),
            Frame::Predicate => write!(f, "predicate"),
            Frame::Mapping => write!(f, "mapping"),
            Frame::Reduction => write!(f, "reduction"),
            Frame::Group => write!(f, "group"),
            Frame::Value => write!(f, "value"),
            Frame::Lower => write!(f, "lower"),
            Frame::Upper => write!(f, "upper"),
            Frame::View => write!(f, "view"),
            Frame::Stream => write!(f, "stream"),
            Frame::Query(i) => write!(f, "query:{}", i),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<Frame>,
}

impl Backtrace {
    pub fn root() -> Self {
        Self::default()
    }

    /// A copy of this backtrace extended by one frame.
    pub fn with(&self, frame: Frame) -> Self {
        let mut frames = self.frames.clone();
        frames.push(frame);
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_root(&self) -> bool {
        self.frames.is_empty()
    }

    /// Walk this backtrace from the root of `query`.
    ///
    /// Returns `None` if some frame does not name a child of the node
    /// reached so far.
    pub fn resolve<'a>(&self, query: &'a Query) -> Option<Node<'a>> {
        let mut node = match query {
            Query::Read(read) => Node::Term(&read.term),
            Query::Write(write) => Node::Write(write),
        };
        for frame in &self.frames {
            node = node.child(frame)?;
        }
        Some(node)
    }
}

impl std::fmt::Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.frames.iter().map(|fr| fr.to_string()).collect();
        write!(f, "{}", parts.join("/"))
    }
}

impl Serialize for Backtrace {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.frames.iter().map(|fr| fr.to_string()))
    }
}

/// A node of the query tree reachable through a backtrace.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Write(&'a WriteQuery),
    Term(&'a Term),
    Mapping(&'a Mapping),
    Predicate(&'a Predicate),
    Reduction(&'a Reduction),
}

impl<'a> Node<'a> {
    pub fn as_term(&self) -> Option<&'a Term> {
        match self {
            Node::Term(t) => Some(t),
            _ => None,
        }
    }

    fn child(self, frame: &Frame) -> Option<Node<'a>> {
        match self {
            Node::Term(term) => term_child(term, frame),
            Node::Write(write) => write_child(write, frame),
            Node::Mapping(m) => match frame {
                Frame::Body => Some(Node::Term(&m.body)),
                _ => None,
            },
            Node::Predicate(p) => match frame {
                Frame::Body => Some(Node::Term(&p.body)),
                _ => None,
            },
            Node::Reduction(r) => match frame {
                Frame::Base => Some(Node::Term(&r.base)),
                Frame::Body => Some(Node::Term(&r.body)),
                _ => None,
            },
        }
    }
}

fn term_child<'a>(term: &'a Term, frame: &Frame) -> Option<Node<'a>> {
    match (term, frame) {
        (Term::Let { binds, .. }, Frame::Bind(name)) => binds
            .iter()
            .find(|b| &b.name == name)
            .map(|b| Node::Term(&b.term)),
        (Term::Let { expr, .. }, Frame::Expr) => Some(Node::Term(expr)),
        (Term::Call { args, .. }, Frame::Arg(i)) => args.get(*i).map(Node::Term),
        (Term::Call { builtin, .. }, frame) => builtin_child(builtin, frame),
        (Term::If { test, .. }, Frame::Test) => Some(Node::Term(test)),
        (Term::If { true_branch, .. }, Frame::TrueBranch) => Some(Node::Term(true_branch)),
        (Term::If { false_branch, .. }, Frame::FalseBranch) => Some(Node::Term(false_branch)),
        (Term::Array { elements }, Frame::Element(i)) => elements.get(*i).map(Node::Term),
        (Term::Object { fields }, Frame::Attr(name)) => fields
            .iter()
            .find(|b| &b.name == name)
            .map(|b| Node::Term(&b.term)),
        (Term::GetByKey { key, .. }, Frame::Key) => Some(Node::Term(key)),
        _ => None,
    }
}

fn builtin_child<'a>(builtin: &'a Builtin, frame: &Frame) -> Option<Node<'a>> {
    match (builtin, frame) {
        (Builtin::Filter { predicate }, Frame::Predicate) => Some(Node::Predicate(predicate)),
        (Builtin::Map { mapping }, Frame::Mapping)
        | (Builtin::ConcatMap { mapping }, Frame::Mapping) => Some(Node::Mapping(mapping)),
        (Builtin::Reduce { reduction }, Frame::Reduction) => Some(Node::Reduction(reduction)),
        (Builtin::GroupedMapReduce { group_mapping, .. }, Frame::Group) => {
            Some(Node::Mapping(group_mapping))
        }
        (Builtin::GroupedMapReduce { value_mapping, .. }, Frame::Value) => {
            Some(Node::Mapping(value_mapping))
        }
        (Builtin::GroupedMapReduce { reduction, .. }, Frame::Reduction) => {
            Some(Node::Reduction(reduction))
        }
        (Builtin::Range { lower, .. }, Frame::Lower) => lower.as_deref().map(Node::Term),
        (Builtin::Range { upper, .. }, Frame::Upper) => upper.as_deref().map(Node::Term),
        _ => None,
    }
}

fn write_child<'a>(write: &'a WriteQuery, frame: &Frame) -> Option<Node<'a>> {
    match (write, frame) {
        (WriteQuery::Update { view, .. }, Frame::View)
        | (WriteQuery::Delete { view }, Frame::View)
        | (WriteQuery::Mutate { view, .. }, Frame::View) => Some(Node::Term(view)),
        (WriteQuery::Update { mapping, .. }, Frame::Mapping)
        | (WriteQuery::Mutate { mapping, .. }, Frame::Mapping)
        | (WriteQuery::PointUpdate { mapping, .. }, Frame::Mapping)
        | (WriteQuery::PointMutate { mapping, .. }, Frame::Mapping) => Some(Node::Mapping(mapping)),
        (WriteQuery::Insert { terms, .. }, Frame::Element(i)) => terms.get(*i).map(Node::Term),
        (WriteQuery::ForEach { stream, .. }, Frame::Stream) => Some(Node::Term(stream)),
        (WriteQuery::ForEach { queries, .. }, Frame::Query(i)) => queries.get(*i).map(Node::Write),
        (WriteQuery::PointUpdate { key, .. }, Frame::Key)
        | (WriteQuery::PointDelete { key, .. }, Frame::Key)
        | (WriteQuery::PointMutate { key, .. }, Frame::Key) => Some(Node::Term(key)),
        _ => None,
    }
}
