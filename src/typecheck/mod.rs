//! Static type checking of query trees.
//!
//! Every term has one of four types: a single JSON value, a stream of
//! documents, a view (a stream still bound to its table, required for write
//! targets), or `arbitrary`, the type of `error` terms, which is accepted
//! wherever anything else is expected.
//!
//! Checking only walks the tree shape and the variable bindings; it never
//! touches storage or runs scripts.

mod builtins;
mod query;

pub use builtins::{
    check_mapping_type, check_predicate_type, check_reduction_type, get_function_type,
};
pub use query::{check_query_type, check_read_query_type, check_write_query_type};

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::ast::Term;
use crate::backtrace::{Backtrace, Frame};
use crate::error::{BadQueryError, CheckResult, MalformedQuery};
use crate::scope::{ImplicitValue, VariableScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermType {
    Json,
    Stream,
    View,
    /// Type of `error` terms; compatible with every other type.
    Arbitrary,
}

impl TermType {
    /// Whether a term of this type may appear where `expected` is required.
    ///
    /// A view is accepted where a stream is expected.
    pub fn is_compatible_with(self, expected: TermType) -> bool {
        self == expected
            || self == TermType::Arbitrary
            || expected == TermType::Arbitrary
            || (self == TermType::View && expected == TermType::Stream)
    }

    pub fn is_stream_like(self) -> bool {
        matches!(self, TermType::Stream | TermType::View)
    }
}

impl std::fmt::Display for TermType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TermType::Json => "json",
            TermType::Stream => "stream",
            TermType::View => "view",
            TermType::Arbitrary => "arbitrary",
        };
        write!(f, "{}", name)
    }
}

/// Argument and return types of a builtin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionType {
    arg_types: Vec<TermType>,
    variadic: bool,
    return_type: TermType,
}

impl FunctionType {
    pub fn fixed(arg_types: Vec<TermType>, return_type: TermType) -> Self {
        Self {
            arg_types,
            variadic: false,
            return_type,
        }
    }

    pub fn unary(arg: TermType, return_type: TermType) -> Self {
        Self::fixed(vec![arg], return_type)
    }

    pub fn binary(arg1: TermType, arg2: TermType, return_type: TermType) -> Self {
        Self::fixed(vec![arg1, arg2], return_type)
    }

    /// Any number of arguments, all of type `arg`.
    pub fn variadic(arg: TermType, return_type: TermType) -> Self {
        Self {
            arg_types: vec![arg],
            variadic: true,
            return_type,
        }
    }

    /// Number of arguments, or `None` for a variadic function.
    pub fn arg_count(&self) -> Option<usize> {
        if self.variadic {
            None
        } else {
            Some(self.arg_types.len())
        }
    }

    pub fn arg_type(&self, n: usize) -> TermType {
        if self.variadic {
            self.arg_types[0]
        } else {
            self.arg_types
                .get(n)
                .copied()
                .unwrap_or(TermType::Arbitrary)
        }
    }

    pub fn return_type(&self) -> TermType {
        self.return_type
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeEnvironment {
    pub scope: VariableScope<TermType>,
    pub implicit_type: ImplicitValue<TermType>,
}

impl TypeEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a variable frame, popped when the guard drops.
    pub fn new_scope(&mut self) -> TypeFrame<'_> {
        self.scope.push();
        TypeFrame {
            env: self,
            implicit: false,
        }
    }

    /// Push a variable frame binding `arg` and an implicit frame of `row_type`.
    pub fn row_scope(&mut self, arg: &str, row_type: TermType) -> TypeFrame<'_> {
        self.scope.push();
        self.scope.put_in_scope(arg, row_type);
        self.implicit_type.push_value(row_type);
        TypeFrame {
            env: self,
            implicit: true,
        }
    }

    /// Push a variable frame and an empty implicit frame.
    pub fn opaque_scope(&mut self) -> TypeFrame<'_> {
        self.scope.push();
        self.implicit_type.push();
        TypeFrame {
            env: self,
            implicit: true,
        }
    }
}

pub struct TypeFrame<'a> {
    env: &'a mut TypeEnvironment,
    implicit: bool,
}

impl Deref for TypeFrame<'_> {
    type Target = TypeEnvironment;

    fn deref(&self) -> &Self::Target {
        self.env
    }
}

impl DerefMut for TypeFrame<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.env
    }
}

impl Drop for TypeFrame<'_> {
    fn drop(&mut self) {
        self.env.scope.pop();
        if self.implicit {
            self.env.implicit_type.pop();
        }
    }
}

/// Infer the type of `term`.
pub fn get_term_type(
    term: &Term,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<TermType> {
    match term {
        Term::Var { name } => env.scope.get(name).copied().ok_or_else(|| {
            BadQueryError::new(format!("symbol '{}' is not in scope", name), backtrace).into()
        }),
        Term::Let { binds, expr } => {
            ensure_unique(binds.iter().map(|b| b.name.as_str()), "let binding", backtrace)?;
            let mut env = env.new_scope();
            for bind in binds {
                let bt = backtrace.with(Frame::Bind(bind.name.clone()));
                let ty = get_term_type(&bind.term, &mut env, &bt)?;
                env.scope.put_in_scope(bind.name.as_str(), ty);
            }
            get_term_type(expr, &mut env, &backtrace.with(Frame::Expr))
        }
        Term::Call { builtin, args } => {
            let fn_type = get_function_type(builtin, env, backtrace)?;
            if let Some(expected) = fn_type.arg_count() {
                if args.len() != expected {
                    return Err(BadQueryError::new(
                        format!(
                            "{} expects {} argument{} but was given {}",
                            builtin.name(),
                            expected,
                            if expected == 1 { "" } else { "s" },
                            args.len()
                        ),
                        backtrace,
                    )
                    .into());
                }
            }

            let mut first_arg = None;
            for (i, arg) in args.iter().enumerate() {
                let bt = backtrace.with(Frame::Arg(i));
                let actual = check_term_type(arg, fn_type.arg_type(i), env, &bt)?;
                if i == 0 {
                    first_arg = Some(actual);
                }
            }

            if builtin.preserves_view() && first_arg == Some(TermType::View) {
                Ok(TermType::View)
            } else {
                Ok(fn_type.return_type())
            }
        }
        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            check_term_type(test, TermType::Json, env, &backtrace.with(Frame::Test))?;
            let t = get_term_type(true_branch, env, &backtrace.with(Frame::TrueBranch))?;
            let f = get_term_type(false_branch, env, &backtrace.with(Frame::FalseBranch))?;
            unify_branches(t, f).ok_or_else(|| {
                BadQueryError::new(
                    format!(
                        "mismatch between true and false branch types: {} and {}",
                        t, f
                    ),
                    backtrace,
                )
                .into()
            })
        }
        Term::Error { .. } => Ok(TermType::Arbitrary),
        Term::Number { .. } | Term::String { .. } | Term::Bool { .. } | Term::Null => {
            Ok(TermType::Json)
        }
        Term::Json { raw } => {
            serde_json::from_str::<serde_json::Value>(raw).map_err(|e| {
                MalformedQuery::new(format!("invalid JSON literal at {}: {}", backtrace, e))
            })?;
            Ok(TermType::Json)
        }
        Term::Array { elements } => {
            for (i, element) in elements.iter().enumerate() {
                check_term_type(element, TermType::Json, env, &backtrace.with(Frame::Element(i)))?;
            }
            Ok(TermType::Json)
        }
        Term::Object { fields } => {
            ensure_unique(fields.iter().map(|f| f.name.as_str()), "object attribute", backtrace)?;
            for field in fields {
                let bt = backtrace.with(Frame::Attr(field.name.clone()));
                check_term_type(&field.term, TermType::Json, env, &bt)?;
            }
            Ok(TermType::Json)
        }
        Term::GetByKey { key, .. } => {
            check_term_type(key, TermType::Json, env, &backtrace.with(Frame::Key))?;
            Ok(TermType::Json)
        }
        Term::Table { .. } => Ok(TermType::View),
        Term::Script { .. } => Ok(TermType::Json),
        Term::ImplicitVar => env.implicit_type.get_value().copied().ok_or_else(|| {
            BadQueryError::new("no implicit variable in scope", backtrace).into()
        }),
    }
}

/// Names in one `let` frame or one object literal must be distinct, so a
/// backtrace naming one of them is unambiguous.
fn ensure_unique<'a>(
    names: impl Iterator<Item = &'a str>,
    what: &str,
    backtrace: &Backtrace,
) -> CheckResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            let mut message = format!("duplicate {} '{}'", what, name);
            if !backtrace.is_root() {
                message.push_str(&format!(" at {}", backtrace));
            }
            return Err(MalformedQuery::new(message).into());
        }
    }
    Ok(())
}

/// Infer the type of `term` and require it to be compatible with `expected`.
///
/// Returns the inferred type.
pub fn check_term_type(
    term: &Term,
    expected: TermType,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<TermType> {
    let actual = get_term_type(term, env, backtrace)?;
    if !actual.is_compatible_with(expected) {
        tracing::debug!(
            "[QUERY] Type mismatch at '{}': expected {}, got {}",
            backtrace,
            expected,
            actual
        );
        return Err(BadQueryError::new(
            format!("expected a {} but got a {}", expected, actual),
            backtrace,
        )
        .into());
    }
    Ok(actual)
}

fn unify_branches(t: TermType, f: TermType) -> Option<TermType> {
    match (t, f) {
        (a, b) if a == b => Some(a),
        (TermType::Arbitrary, other) | (other, TermType::Arbitrary) => Some(other),
        (TermType::View, TermType::Stream) | (TermType::Stream, TermType::View) => {
            Some(TermType::Stream)
        }
        _ => None,
    }
}
