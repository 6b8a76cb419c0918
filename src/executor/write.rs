//! Write query execution.

use std::sync::Arc;

use serde_json::Value;

use super::eval::{apply_mapping, eval, merge_objects};
use super::eval_stream::{eval_stream, eval_table_ref, eval_view, View};
use super::helpers::{json_type_name, key_string};
use super::{RuntimeEnvironment, WriteSummary};
use crate::ast::{Mapping, TableRef, Term, WriteQuery};
use crate::backtrace::{Backtrace, Frame};
use crate::error::{RuntimeError, RuntimeResult, StorageError, WithBacktrace};
use crate::namespace::{NamespaceAccess, WriteMode, WriteOutcome};
use crate::stream::{drain, JsonStream};

/// Run a write query. Per-document failures are counted in the summary;
/// anything else aborts the query.
pub fn execute_write(
    write: &WriteQuery,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<WriteSummary> {
    tracing::debug!("[QUERY] Executing {} write", write.kind());
    let mut summary = WriteSummary::default();

    match write {
        WriteQuery::Update { view, mapping } => {
            let View { access, mut stream } = eval_view(view, env, &backtrace.with(Frame::View))?;
            let bt = backtrace.with(Frame::Mapping);
            while let Some(doc) = stream.next()? {
                update_doc(access.as_ref(), mapping, doc, env, &bt, &mut summary)?;
            }
        }
        WriteQuery::Mutate { view, mapping } => {
            let View { access, mut stream } = eval_view(view, env, &backtrace.with(Frame::View))?;
            let bt = backtrace.with(Frame::Mapping);
            while let Some(doc) = stream.next()? {
                mutate_doc(access.as_ref(), mapping, doc, env, &bt, &mut summary)?;
            }
        }
        WriteQuery::Delete { view } => {
            let bt = backtrace.with(Frame::View);
            let View { access, mut stream } = eval_view(view, env, &bt)?;
            while let Some(doc) = stream.next()? {
                delete_doc(access.as_ref(), doc, &bt, &mut summary)?;
            }
        }
        WriteQuery::Insert { table, terms } => {
            let access = eval_table_ref(table, env, backtrace)?;
            for (i, term) in terms.iter().enumerate() {
                let bt = backtrace.with(Frame::Element(i));
                let doc = eval(term, env, &bt)?;
                insert_doc(access.as_ref(), doc, &bt, &mut summary)?;
            }
        }
        WriteQuery::ForEach {
            stream,
            var,
            queries,
        } => {
            // Drained up front so documents written by the nested queries
            // are not visited again.
            let bt = backtrace.with(Frame::Stream);
            let mut source = eval_stream(stream, env, &bt)?;
            let docs = drain(&mut source)?;
            for doc in docs {
                env.interruptor.check(&bt)?;
                let mut env = env.new_scope();
                env.bind_value(var, doc);
                for (i, query) in queries.iter().enumerate() {
                    let nested = execute_write(query, &mut env, &backtrace.with(Frame::Query(i)))?;
                    summary.merge(nested);
                }
            }
        }
        WriteQuery::PointUpdate {
            table,
            attr,
            key,
            mapping,
        } => {
            let (access, doc) = point_lookup(write.kind(), table, attr, key, env, backtrace)?;
            if let Some(doc) = doc {
                let bt = backtrace.with(Frame::Mapping);
                update_doc(access.as_ref(), mapping, doc, env, &bt, &mut summary)?;
            }
        }
        WriteQuery::PointMutate {
            table,
            attr,
            key,
            mapping,
        } => {
            let (access, doc) = point_lookup(write.kind(), table, attr, key, env, backtrace)?;
            if let Some(doc) = doc {
                let bt = backtrace.with(Frame::Mapping);
                mutate_doc(access.as_ref(), mapping, doc, env, &bt, &mut summary)?;
            }
        }
        WriteQuery::PointDelete { table, attr, key } => {
            let (access, doc) = point_lookup(write.kind(), table, attr, key, env, backtrace)?;
            if let Some(doc) = doc {
                delete_doc(access.as_ref(), doc, backtrace, &mut summary)?;
            }
        }
    }

    tracing::debug!(
        "[QUERY] {} wrote {} inserted, {} updated, {} deleted, {} errors",
        write.kind(),
        summary.inserted,
        summary.updated,
        summary.deleted,
        summary.errors
    );
    Ok(summary)
}

/// Resolve the table of a point write and read the addressed document.
fn point_lookup(
    kind: &str,
    table: &TableRef,
    attr: &str,
    key: &Term,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<(Arc<dyn NamespaceAccess>, Option<Value>)> {
    let access = eval_table_ref(table, env, backtrace)?;
    if access.primary_key() != attr {
        return Err(RuntimeError::new(
            format!(
                "{} must address the primary key '{}', not '{}'",
                kind,
                access.primary_key(),
                attr
            ),
            backtrace,
        ));
    }
    let key = eval(key, env, &backtrace.with(Frame::Key))?;
    let doc = access.point_read(&key).at(backtrace)?;
    Ok((access, doc))
}

fn insert_doc(
    access: &dyn NamespaceAccess,
    doc: Value,
    backtrace: &Backtrace,
    summary: &mut WriteSummary,
) -> RuntimeResult<()> {
    let mut object = match doc {
        Value::Object(object) => object,
        other => {
            summary.record_error(format!(
                "Insert expects an object, got {}",
                json_type_name(&other)
            ));
            return Ok(());
        }
    };

    let primary_key = access.primary_key().to_string();
    let generated = if object.contains_key(&primary_key) {
        None
    } else {
        let key = uuid::Uuid::new_v4().to_string();
        object.insert(primary_key.clone(), Value::String(key.clone()));
        Some(key)
    };
    let key = object.get(&primary_key).map(key_string).unwrap_or_default();

    match access.write(Value::Object(object), WriteMode::Insert).at(backtrace)? {
        WriteOutcome::Inserted => {
            summary.inserted += 1;
            summary.generated_keys.extend(generated);
        }
        WriteOutcome::Conflict => {
            summary.record_error(StorageError::DocumentConflict(key).to_string());
        }
        _ => {}
    }
    Ok(())
}

fn update_doc(
    access: &dyn NamespaceAccess,
    mapping: &Mapping,
    doc: Value,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
    summary: &mut WriteSummary,
) -> RuntimeResult<()> {
    let patch = apply_mapping(mapping, doc.clone(), env, backtrace)?;
    if !patch.is_object() {
        summary.record_error(format!(
            "Update mapping must return an object, got {}",
            json_type_name(&patch)
        ));
        return Ok(());
    }
    let merged = merge_objects(&doc, &patch, backtrace)?;
    if !same_key(access, &doc, &merged) {
        summary.record_error(format!(
            "Update may not change the primary key '{}'",
            access.primary_key()
        ));
        return Ok(());
    }
    if let WriteOutcome::Replaced | WriteOutcome::Inserted =
        access.write(merged, WriteMode::Upsert).at(backtrace)?
    {
        summary.updated += 1;
    }
    Ok(())
}

fn mutate_doc(
    access: &dyn NamespaceAccess,
    mapping: &Mapping,
    doc: Value,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
    summary: &mut WriteSummary,
) -> RuntimeResult<()> {
    let replacement = apply_mapping(mapping, doc.clone(), env, backtrace)?;
    match replacement {
        Value::Null => delete_doc(access, doc, backtrace, summary),
        Value::Object(_) => {
            if !same_key(access, &doc, &replacement) {
                summary.record_error(format!(
                    "Mutate may not change the primary key '{}'",
                    access.primary_key()
                ));
                return Ok(());
            }
            if let WriteOutcome::Replaced | WriteOutcome::Inserted =
                access.write(replacement, WriteMode::Upsert).at(backtrace)?
            {
                summary.updated += 1;
            }
            Ok(())
        }
        other => {
            summary.record_error(format!(
                "Mutate mapping must return an object or null, got {}",
                json_type_name(&other)
            ));
            Ok(())
        }
    }
}

fn delete_doc(
    access: &dyn NamespaceAccess,
    doc: Value,
    backtrace: &Backtrace,
    summary: &mut WriteSummary,
) -> RuntimeResult<()> {
    if let WriteOutcome::Deleted = access.write(doc, WriteMode::Delete).at(backtrace)? {
        summary.deleted += 1;
    }
    Ok(())
}

fn same_key(access: &dyn NamespaceAccess, before: &Value, after: &Value) -> bool {
    let pk = access.primary_key();
    before.get(pk) == after.get(pk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Builtin, Comparison, Predicate};
    use crate::executor::testing::users_env;
    use serde_json::json;

    fn users() -> Term {
        Term::table("test", "users")
    }

    fn users_ref() -> TableRef {
        TableRef::new("test", "users")
    }

    fn seeded() -> (RuntimeEnvironment, Arc<crate::namespace::MemoryNamespace>) {
        users_env((1..=4).map(|i| json!({"id": i, "name": format!("u{}", i)})).collect())
    }

    fn run(write: &WriteQuery, env: &mut RuntimeEnvironment) -> RuntimeResult<WriteSummary> {
        execute_write(write, env, &Backtrace::root())
    }

    fn get(table: &crate::namespace::MemoryNamespace, id: i64) -> Option<Value> {
        table.point_read(&json!(id)).unwrap()
    }

    #[test]
    fn test_insert() {
        let (mut env, table) = seeded();
        let write = WriteQuery::Insert {
            table: users_ref(),
            terms: vec![
                Term::object(vec![("id", Term::number(10.0))]),
                Term::object(vec![("name", Term::string("anon"))]),
                Term::object(vec![("id", Term::number(1.0))]),
                Term::number(5.0),
            ],
        };
        let summary = run(&write, &mut env).unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.errors, 2);
        assert_eq!(
            summary.first_error.as_deref(),
            Some("Document with key 1 already exists")
        );
        assert_eq!(summary.generated_keys.len(), 1);
        assert_eq!(table.len(), 6);

        let generated = json!(summary.generated_keys[0]);
        let doc = table.point_read(&generated).unwrap().unwrap();
        assert_eq!(doc["name"], json!("anon"));
    }

    #[test]
    fn test_insert_unknown_table() {
        let (mut env, _) = seeded();
        let write = WriteQuery::Insert {
            table: TableRef::new("test", "nope"),
            terms: vec![],
        };
        let err = run(&write, &mut env).unwrap_err();
        assert_eq!(err.message, "Table 'test.nope' not found");
    }

    #[test]
    fn test_update_filtered_view() {
        let (mut env, table) = seeded();
        let write = WriteQuery::Update {
            view: Term::call(
                Builtin::Filter {
                    predicate: Predicate::new(
                        "u",
                        Term::call(
                            Builtin::Compare {
                                comparison: Comparison::Ge,
                            },
                            vec![
                                Term::call(Builtin::GetAttr { attr: "id".into() }, vec![Term::var("u")]),
                                Term::number(3.0),
                            ],
                        ),
                    ),
                },
                vec![users()],
            ),
            mapping: Mapping::new("u", Term::object(vec![("active", Term::boolean(true))])),
        };
        let summary = run(&write, &mut env).unwrap();
        assert_eq!(summary.updated, 2);
        assert_eq!(
            get(&table, 3),
            Some(json!({"id": 3, "name": "u3", "active": true}))
        );
        assert_eq!(get(&table, 1), Some(json!({"id": 1, "name": "u1"})));
    }

    #[test]
    fn test_update_rejects_key_change_and_non_objects() {
        let (mut env, table) = seeded();
        let write = WriteQuery::Update {
            view: users(),
            mapping: Mapping::new("u", Term::object(vec![("id", Term::number(99.0))])),
        };
        let summary = run(&write, &mut env).unwrap();
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.errors, 4);
        assert_eq!(table.len(), 4);

        let write = WriteQuery::Update {
            view: users(),
            mapping: Mapping::new("u", Term::number(1.0)),
        };
        let summary = run(&write, &mut env).unwrap();
        assert_eq!(summary.errors, 4);
        assert_eq!(
            summary.first_error.as_deref(),
            Some("Update mapping must return an object, got number")
        );
    }

    #[test]
    fn test_mutate_replaces_and_deletes() {
        let (mut env, table) = seeded();
        // Documents with an even id are deleted, the rest replaced.
        let id = Term::call(Builtin::GetAttr { attr: "id".into() }, vec![Term::var("u")]);
        let write = WriteQuery::Mutate {
            view: users(),
            mapping: Mapping::new(
                "u",
                Term::if_then_else(
                    Term::call(
                        Builtin::Compare {
                            comparison: Comparison::Eq,
                        },
                        vec![
                            Term::call(Builtin::Modulo, vec![id.clone(), Term::number(2.0)]),
                            Term::number(0.0),
                        ],
                    ),
                    Term::json("null"),
                    Term::object(vec![("id", id)]),
                ),
            ),
        };
        let summary = run(&write, &mut env).unwrap();
        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.updated, 2);
        assert_eq!(get(&table, 1), Some(json!({"id": 1})));
        assert_eq!(get(&table, 2), None);
    }

    #[test]
    fn test_delete_limited_view() {
        let (mut env, table) = seeded();
        let write = WriteQuery::Delete {
            view: Term::call(Builtin::Limit, vec![users(), Term::number(3.0)]),
        };
        assert_eq!(run(&write, &mut env).unwrap().deleted, 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_for_each_does_not_revisit_inserts() {
        let (mut env, table) = seeded();
        let write = WriteQuery::ForEach {
            stream: users(),
            var: "row".to_string(),
            queries: vec![WriteQuery::Insert {
                table: users_ref(),
                terms: vec![Term::object(vec![(
                    "id",
                    Term::call(
                        Builtin::Add,
                        vec![
                            Term::call(Builtin::GetAttr { attr: "id".into() }, vec![Term::var("row")]),
                            Term::number(100.0),
                        ],
                    ),
                )])],
            }],
        };
        let summary = run(&write, &mut env).unwrap();
        assert_eq!(summary.inserted, 4);
        assert_eq!(table.len(), 8);
        assert!(!env.scope.is_in_scope("row"));
    }

    #[test]
    fn test_point_writes() {
        let (mut env, table) = seeded();
        let update = WriteQuery::PointUpdate {
            table: users_ref(),
            attr: "id".to_string(),
            key: Term::number(2.0),
            mapping: Mapping::new("u", Term::object(vec![("name", Term::string("two"))])),
        };
        assert_eq!(run(&update, &mut env).unwrap().updated, 1);
        assert_eq!(get(&table, 2).unwrap()["name"], json!("two"));

        let missing = WriteQuery::PointDelete {
            table: users_ref(),
            attr: "id".to_string(),
            key: Term::number(42.0),
        };
        assert_eq!(run(&missing, &mut env).unwrap(), WriteSummary::default());

        let delete = WriteQuery::PointDelete {
            table: users_ref(),
            attr: "id".to_string(),
            key: Term::number(2.0),
        };
        assert_eq!(run(&delete, &mut env).unwrap().deleted, 1);

        let mutate = WriteQuery::PointMutate {
            table: users_ref(),
            attr: "id".to_string(),
            key: Term::number(3.0),
            mapping: Mapping::new("u", Term::json("null")),
        };
        assert_eq!(run(&mutate, &mut env).unwrap().deleted, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_point_write_requires_primary_key() {
        let (mut env, _) = seeded();
        let write = WriteQuery::PointDelete {
            table: users_ref(),
            attr: "name".to_string(),
            key: Term::string("u1"),
        };
        let err = run(&write, &mut env).unwrap_err();
        assert_eq!(
            err.message,
            "point_delete must address the primary key 'id', not 'name'"
        );
    }
}
