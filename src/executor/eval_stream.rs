//! Lazy evaluation of stream- and view-typed terms.

use std::sync::Arc;

use serde_json::Value;

use super::eval::{apply_mapping, apply_predicate, bind_all, eval, eval_test};
use super::helpers::{compare_values, expect_array, expect_integer, get_attr};
use super::RuntimeEnvironment;
use crate::ast::{Builtin, Mapping, OrderKey, Predicate, TableRef, Term};
use crate::backtrace::{Backtrace, Frame};
use crate::error::{RuntimeError, RuntimeResult, StorageError, WithBacktrace};
use crate::namespace::{DocumentCursor, KeyRange, NamespaceAccess};
use crate::stream::{
    BoxedStream, ConcatMapStream, DistinctStream, DocMapping, DocPredicate, DocStreamMapping,
    FilterStream, InMemoryStream, InterruptibleStream, JsonStream, LimitStream, MapStream,
    SkipStream, UnionStream,
};

/// A stream still bound to the table it reads, so it can be written back.
pub struct View {
    pub access: Arc<dyn NamespaceAccess>,
    pub stream: BoxedStream,
}

/// Evaluate a stream- or view-typed term to a lazy stream.
pub fn eval_stream(
    term: &Term,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<BoxedStream> {
    env.interruptor.check(backtrace)?;

    match term {
        Term::Var { name } => env
            .stream_scope
            .get(name)
            .map(|bound| Box::new(bound.shared.cursor()) as BoxedStream)
            .ok_or_else(|| {
                RuntimeError::new(format!("stream '{}' is not in scope", name), backtrace)
            }),
        Term::Let { binds, expr } => {
            let mut env = env.new_scope();
            bind_all(binds, &mut env, backtrace)?;
            eval_stream(expr, &mut env, &backtrace.with(Frame::Expr))
        }
        Term::Call { builtin, args } => eval_stream_call(builtin, args, env, backtrace),
        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            if eval_test(test, env, backtrace)? {
                eval_stream(true_branch, env, &backtrace.with(Frame::TrueBranch))
            } else {
                eval_stream(false_branch, env, &backtrace.with(Frame::FalseBranch))
            }
        }
        Term::Error { message } => Err(RuntimeError::new(message.clone(), backtrace)),
        Term::Table { table } => {
            let access = eval_table_ref(table, env, backtrace)?;
            table_stream(access.as_ref(), KeyRange::all(), env, backtrace)
        }
        other => Err(RuntimeError::new(
            format!("expected a stream but found a {} term", other.kind()),
            backtrace,
        )),
    }
}

/// Evaluate a builtin call whose result is a stream.
pub fn eval_stream_call(
    builtin: &Builtin,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<BoxedStream> {
    match builtin {
        Builtin::Union => {
            let mut streams = Vec::with_capacity(args.len());
            for (i, term) in args.iter().enumerate() {
                streams.push(eval_stream(term, env, &backtrace.with(Frame::Arg(i)))?);
            }
            Ok(Box::new(UnionStream::new(streams)))
        }
        Builtin::ArrayToStream => {
            let bt = backtrace.with(Frame::Arg(0));
            let value = eval(first_arg(args, backtrace)?, env, &bt)?;
            Ok(Box::new(InMemoryStream::new(expect_array(&value, &bt)?.clone())))
        }
        Builtin::Range { .. } => {
            if let Some(view) = pushdown_range(builtin, args, env, backtrace)? {
                return Ok(view.stream);
            }
            let bt = backtrace.with(Frame::Arg(0));
            let source = eval_stream(first_arg(args, backtrace)?, env, &bt)?;
            transform_stream(builtin, source, args, env, backtrace)
        }
        _ if is_stream_transform(builtin) => {
            let bt = backtrace.with(Frame::Arg(0));
            let source = eval_stream(first_arg(args, backtrace)?, env, &bt)?;
            transform_stream(builtin, source, args, env, backtrace)
        }
        _ => Err(RuntimeError::new(
            format!("{} produces a value where a stream was expected", builtin.name()),
            backtrace,
        )),
    }
}

fn first_arg<'a>(args: &'a [Term], backtrace: &Backtrace) -> RuntimeResult<&'a Term> {
    args.first()
        .ok_or_else(|| RuntimeError::new("missing argument 0", backtrace))
}

/// Builtins that turn their first argument's stream into another stream.
fn is_stream_transform(builtin: &Builtin) -> bool {
    builtin.preserves_view() || matches!(builtin, Builtin::Map { .. } | Builtin::ConcatMap { .. })
}

/// Apply a one-source stream builtin to an already evaluated `source`.
fn transform_stream(
    builtin: &Builtin,
    source: BoxedStream,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<BoxedStream> {
    let stream: BoxedStream = match builtin {
        Builtin::Filter { predicate } => Box::new(FilterStream::new(
            source,
            RowPredicate::new(predicate, env, backtrace.with(Frame::Predicate)),
        )),
        Builtin::Map { mapping } => Box::new(MapStream::new(
            source,
            RowMapping::new(mapping, env, backtrace.with(Frame::Mapping)),
        )),
        Builtin::ConcatMap { mapping } => Box::new(ConcatMapStream::new(
            source,
            RowStreamMapping::new(mapping, env, backtrace.with(Frame::Mapping)),
        )),
        Builtin::OrderBy { keys } => Box::new(order_by(source, keys, backtrace)?),
        Builtin::Distinct => Box::new(DistinctStream::new(source)),
        Builtin::Limit | Builtin::Skip => {
            let bt = backtrace.with(Frame::Arg(1));
            let term = args
                .get(1)
                .ok_or_else(|| RuntimeError::new("missing argument 1", backtrace))?;
            let count = expect_integer(&eval(term, env, &bt)?, &bt)?;
            if matches!(builtin, Builtin::Limit) {
                Box::new(LimitStream::new(source, count, &bt)?)
            } else {
                Box::new(SkipStream::new(source, count, &bt)?)
            }
        }
        Builtin::Range { attr, .. } => {
            let range = eval_range(builtin, env, backtrace)?;
            let attr = attr.clone();
            Box::new(FilterStream::new(
                source,
                move |doc: &Value| -> RuntimeResult<bool> {
                    Ok(doc.get(&attr).is_some_and(|v| range.contains(v)))
                },
            ))
        }
        _ => {
            return Err(RuntimeError::new(
                format!("{} does not transform a stream", builtin.name()),
                backtrace,
            ))
        }
    };
    Ok(stream)
}

/// A range over a table's primary key is pushed down to the shard read.
/// Returns `None` when the range has to be applied as a filter instead.
fn pushdown_range(
    builtin: &Builtin,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Option<View>> {
    let (Builtin::Range { attr, .. }, Some(Term::Table { table })) = (builtin, args.first())
    else {
        return Ok(None);
    };
    let access = eval_table_ref(table, env, &backtrace.with(Frame::Arg(0)))?;
    if access.primary_key() != attr.as_str() {
        return Ok(None);
    }
    let range = eval_range(builtin, env, backtrace)?;
    let stream = table_stream(access.as_ref(), range, env, backtrace)?;
    Ok(Some(View { access, stream }))
}

fn eval_range(
    builtin: &Builtin,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<KeyRange> {
    let Builtin::Range { lower, upper, .. } = builtin else {
        return Ok(KeyRange::all());
    };
    let lower = match lower {
        Some(term) => Some(eval(term, env, &backtrace.with(Frame::Lower))?),
        None => None,
    };
    let upper = match upper {
        Some(term) => Some(eval(term, env, &backtrace.with(Frame::Upper))?),
        None => None,
    };
    Ok(KeyRange::between(lower, upper))
}

/// Materialize `source` and sort it by `keys`, stably.
fn order_by(
    mut source: BoxedStream,
    keys: &[OrderKey],
    backtrace: &Backtrace,
) -> RuntimeResult<InMemoryStream> {
    let mut docs = InMemoryStream::from_stream(&mut source)?;
    for doc in docs.iter() {
        for key in keys {
            get_attr(doc, &key.attr, backtrace)?;
        }
    }
    docs.sort_by(|a, b| {
        for key in keys {
            let ordering = compare_values(
                a.get(&key.attr).unwrap_or(&Value::Null),
                b.get(&key.attr).unwrap_or(&Value::Null),
            );
            let ordering = if key.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(docs)
}

/// Resolve a table reference through the cluster metadata.
pub fn eval_table_ref(
    table_ref: &TableRef,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Arc<dyn NamespaceAccess>> {
    let metadata = env
        .metadata
        .lookup_table(&table_ref.db_name, &table_ref.table_name)
        .ok_or_else(|| StorageError::TableNotFound(table_ref.to_string()))
        .at(backtrace)?;
    env.ns_repo.access(&metadata.id).at(backtrace)
}

/// Evaluate a view-typed term: a table, a view-preserving builtin applied
/// to a view, a bound view, or a conditional over views.
pub fn eval_view(
    term: &Term,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<View> {
    env.interruptor.check(backtrace)?;

    match term {
        Term::Table { table } => {
            let access = eval_table_ref(table, env, backtrace)?;
            let stream = table_stream(access.as_ref(), KeyRange::all(), env, backtrace)?;
            Ok(View { access, stream })
        }
        Term::Call { builtin, args } if builtin.preserves_view() => {
            if let Some(view) = pushdown_range(builtin, args, env, backtrace)? {
                return Ok(view);
            }
            let View { access, stream } =
                eval_view(first_arg(args, backtrace)?, env, &backtrace.with(Frame::Arg(0)))?;
            let stream = transform_stream(builtin, stream, args, env, backtrace)?;
            Ok(View { access, stream })
        }
        Term::Var { name } => match env.stream_scope.get(name) {
            Some(bound) => match &bound.access {
                Some(access) => Ok(View {
                    access: access.clone(),
                    stream: Box::new(bound.shared.cursor()),
                }),
                None => Err(RuntimeError::new(
                    format!("'{}' is a stream, not a view", name),
                    backtrace,
                )),
            },
            None => Err(RuntimeError::new(
                format!("view '{}' is not in scope", name),
                backtrace,
            )),
        },
        Term::Let { binds, expr } => {
            let mut env = env.new_scope();
            bind_all(binds, &mut env, backtrace)?;
            eval_view(expr, &mut env, &backtrace.with(Frame::Expr))
        }
        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            if eval_test(test, env, backtrace)? {
                eval_view(true_branch, env, &backtrace.with(Frame::TrueBranch))
            } else {
                eval_view(false_branch, env, &backtrace.with(Frame::FalseBranch))
            }
        }
        Term::Error { message } => Err(RuntimeError::new(message.clone(), backtrace)),
        other => Err(RuntimeError::new(
            format!("expected a view but found a {} term", other.kind()),
            backtrace,
        )),
    }
}

/// Read `range` of a table as an interruptible stream.
fn table_stream(
    access: &dyn NamespaceAccess,
    range: KeyRange,
    env: &RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<BoxedStream> {
    let cursor = access.read(range, &env.interruptor).at(backtrace)?;
    let stream = StorageStream {
        cursor,
        backtrace: backtrace.clone(),
    };
    Ok(Box::new(InterruptibleStream::new(
        Box::new(stream),
        env.interruptor.clone(),
        backtrace.clone(),
    )))
}

/// Adapts a storage cursor, attaching the reading term's backtrace to
/// storage failures.
struct StorageStream {
    cursor: Box<dyn DocumentCursor>,
    backtrace: Backtrace,
}

impl JsonStream for StorageStream {
    fn next(&mut self) -> RuntimeResult<Option<Value>> {
        match self.cursor.next() {
            Ok(doc) => Ok(doc),
            Err(StorageError::Interrupted) => {
                Err(RuntimeError::new("query interrupted", &self.backtrace))
            }
            Err(e) => Err(RuntimeError::new(e.to_string(), &self.backtrace)),
        }
    }
}

/// Filter predicate evaluated against a snapshot of the environment it was
/// created in.
struct RowPredicate {
    predicate: Predicate,
    env: RuntimeEnvironment,
    backtrace: Backtrace,
}

impl RowPredicate {
    fn new(predicate: &Predicate, env: &RuntimeEnvironment, backtrace: Backtrace) -> Self {
        Self {
            predicate: predicate.clone(),
            env: env.clone(),
            backtrace,
        }
    }
}

impl DocPredicate for RowPredicate {
    fn test(&mut self, doc: &Value) -> RuntimeResult<bool> {
        apply_predicate(&self.predicate, doc.clone(), &mut self.env, &self.backtrace)
    }
}

struct RowMapping {
    mapping: Mapping,
    env: RuntimeEnvironment,
    backtrace: Backtrace,
}

impl RowMapping {
    fn new(mapping: &Mapping, env: &RuntimeEnvironment, backtrace: Backtrace) -> Self {
        Self {
            mapping: mapping.clone(),
            env: env.clone(),
            backtrace,
        }
    }
}

impl DocMapping for RowMapping {
    fn apply(&mut self, doc: Value) -> RuntimeResult<Value> {
        apply_mapping(&self.mapping, doc, &mut self.env, &self.backtrace)
    }
}

/// Concat-map body: evaluated as a stream for each row.
struct RowStreamMapping {
    mapping: Mapping,
    env: RuntimeEnvironment,
    backtrace: Backtrace,
}

impl RowStreamMapping {
    fn new(mapping: &Mapping, env: &RuntimeEnvironment, backtrace: Backtrace) -> Self {
        Self {
            mapping: mapping.clone(),
            env: env.clone(),
            backtrace,
        }
    }
}

impl DocStreamMapping for RowStreamMapping {
    fn apply(&mut self, doc: Value) -> RuntimeResult<BoxedStream> {
        let mut env = self.env.row_scope(&self.mapping.arg, doc);
        eval_stream(&self.mapping.body, &mut env, &self.backtrace.with(Frame::Body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Comparison;
    use crate::executor::testing::users_env;
    use crate::stream::drain;
    use serde_json::json;

    fn users() -> Term {
        Term::table("test", "users")
    }

    fn seeded() -> (RuntimeEnvironment, Arc<crate::namespace::MemoryNamespace>) {
        users_env(
            (1..=5)
                .map(|i| json!({"id": i, "age": 20 + (i % 3) * 5, "tags": vec![i; i as usize]}))
                .collect(),
        )
    }

    fn ids(docs: Vec<Value>) -> Vec<i64> {
        docs.iter().filter_map(|d| d["id"].as_i64()).collect()
    }

    fn collect(term: &Term) -> RuntimeResult<Vec<Value>> {
        let (mut env, _) = seeded();
        let mut stream = eval_stream(term, &mut env, &Backtrace::root())?;
        drain(&mut stream)
    }

    fn by_id(term: Term) -> Term {
        Term::call(
            Builtin::OrderBy {
                keys: vec![OrderKey::asc("id")],
            },
            vec![term],
        )
    }

    #[test]
    fn test_table_scan() {
        let mut all = ids(collect(&users()).unwrap());
        all.sort();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_filter_with_implicit_row() {
        let term = by_id(Term::call(
            Builtin::Filter {
                predicate: Predicate::new(
                    "u",
                    Term::call(
                        Builtin::Compare {
                            comparison: Comparison::Gt,
                        },
                        vec![
                            Term::call(Builtin::ImplicitGetAttr { attr: "id".into() }, vec![]),
                            Term::number(3.0),
                        ],
                    ),
                ),
            },
            vec![users()],
        ));
        assert_eq!(ids(collect(&term).unwrap()), vec![4, 5]);
    }

    #[test]
    fn test_filter_requires_boolean() {
        let term = Term::call(
            Builtin::Filter {
                predicate: Predicate::new("u", Term::number(1.0)),
            },
            vec![users()],
        );
        let err = collect(&term).unwrap_err();
        assert_eq!(err.message, "predicate must return a boolean, got number");
        assert_eq!(
            err.backtrace,
            Backtrace::root().with(Frame::Predicate).with(Frame::Body)
        );
    }

    #[test]
    fn test_order_by_keys() {
        let term = Term::call(
            Builtin::OrderBy {
                keys: vec![OrderKey::desc("age"), OrderKey::asc("id")],
            },
            vec![users()],
        );
        // ages: 1 -> 25, 2 -> 30, 3 -> 20, 4 -> 25, 5 -> 30
        assert_eq!(ids(collect(&term).unwrap()), vec![2, 5, 1, 4, 3]);

        let missing = Term::call(
            Builtin::OrderBy {
                keys: vec![OrderKey::asc("nope")],
            },
            vec![users()],
        );
        assert!(collect(&missing).is_err());
    }

    #[test]
    fn test_concat_map_order() {
        let term = Term::call(
            Builtin::ConcatMap {
                mapping: Mapping::new(
                    "u",
                    Term::call(
                        Builtin::ArrayToStream,
                        vec![Term::call(
                            Builtin::GetAttr { attr: "tags".into() },
                            vec![Term::var("u")],
                        )],
                    ),
                ),
            },
            vec![by_id(users())],
        );
        assert_eq!(
            collect(&term).unwrap(),
            vec![
                json!(1),
                json!(2),
                json!(2),
                json!(3),
                json!(3),
                json!(3),
                json!(4),
                json!(4),
                json!(4),
                json!(4),
                json!(5),
                json!(5),
                json!(5),
                json!(5),
                json!(5)
            ]
        );
    }

    #[test]
    fn test_limit_skip_union_distinct() {
        let limited = Term::call(Builtin::Limit, vec![by_id(users()), Term::number(2.0)]);
        assert_eq!(ids(collect(&limited).unwrap()), vec![1, 2]);

        let skipped = Term::call(Builtin::Skip, vec![by_id(users()), Term::number(3.0)]);
        assert_eq!(ids(collect(&skipped).unwrap()), vec![4, 5]);

        let negative = Term::call(Builtin::Limit, vec![users(), Term::number(-1.0)]);
        let err = collect(&negative).unwrap_err();
        assert_eq!(err.backtrace, Backtrace::root().with(Frame::Arg(1)));

        let union = Term::call(Builtin::Union, vec![limited.clone(), limited]);
        assert_eq!(ids(collect(&union).unwrap()), vec![1, 2, 1, 2]);

        let ages = Term::call(
            Builtin::Distinct,
            vec![Term::call(
                Builtin::Map {
                    mapping: Mapping::new(
                        "u",
                        Term::call(Builtin::GetAttr { attr: "age".into() }, vec![Term::var("u")]),
                    ),
                },
                vec![by_id(users())],
            )],
        );
        assert_eq!(collect(&ages).unwrap(), vec![json!(25), json!(30), json!(20)]);
    }

    #[test]
    fn test_range() {
        let range = |attr: &str, lower: f64, upper: f64| {
            by_id(Term::call(
                Builtin::Range {
                    attr: attr.to_string(),
                    lower: Some(Box::new(Term::number(lower))),
                    upper: Some(Box::new(Term::number(upper))),
                },
                vec![users()],
            ))
        };
        assert_eq!(ids(collect(&range("id", 2.0, 4.0)).unwrap()), vec![2, 3, 4]);
        assert_eq!(ids(collect(&range("age", 25.0, 25.0)).unwrap()), vec![1, 4]);
        assert!(collect(&range("missing", 0.0, 100.0)).unwrap().is_empty());
    }

    #[test]
    fn test_stream_variable_reads_storage_once() {
        let (mut env, table) = seeded();
        let term = Term::let_in(
            vec![("s", users())],
            Term::call(Builtin::Union, vec![Term::var("s"), Term::var("s")]),
        );
        let mut stream = eval_stream(&term, &mut env, &Backtrace::root()).unwrap();
        assert_eq!(drain(&mut stream).unwrap().len(), 10);
        assert_eq!(table.read_count(), 1);
    }

    #[test]
    fn test_view_through_filter_and_let() {
        let (mut env, _) = seeded();
        let term = Term::let_in(
            vec![("t", users())],
            Term::call(
                Builtin::Limit,
                vec![Term::var("t"), Term::number(1.0)],
            ),
        );
        let mut view = eval_view(&term, &mut env, &Backtrace::root()).unwrap();
        assert_eq!(view.access.primary_key(), "id");
        assert_eq!(drain(&mut view.stream).unwrap().len(), 1);

        let mapped = Term::call(
            Builtin::Map {
                mapping: Mapping::new("u", Term::var("u")),
            },
            vec![users()],
        );
        assert!(eval_view(&mapped, &mut env, &Backtrace::root()).is_err());
    }

    #[test]
    fn test_mapping_captures_bindings() {
        let term = Term::let_in(
            vec![("offset", Term::number(100.0))],
            Term::call(
                Builtin::Map {
                    mapping: Mapping::new(
                        "u",
                        Term::call(
                            Builtin::Add,
                            vec![
                                Term::var("offset"),
                                Term::call(Builtin::GetAttr { attr: "id".into() }, vec![Term::var("u")]),
                            ],
                        ),
                    ),
                },
                vec![by_id(users())],
            ),
        );
        assert_eq!(
            collect(&term).unwrap(),
            vec![json!(101), json!(102), json!(103), json!(104), json!(105)]
        );
    }

    #[test]
    fn test_unavailable_shard_is_runtime_error() {
        let (mut env, table) = seeded();
        table.set_shard_available(0, false);
        let mut stream = eval_stream(&users(), &mut env, &Backtrace::root()).unwrap();
        let err = stream.next().unwrap_err();
        assert!(err.message.starts_with("Shard unavailable"));
    }
}
