//! Eager evaluation of JSON-typed terms.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::eval_stream::{eval_stream, eval_table_ref};
use super::helpers::{
    clamp_bound, compare_values, expect_array, expect_bool, expect_integer, expect_number,
    expect_object, get_attr, number_value, resolve_index, OrderedValue,
};
use super::{BoundStream, RuntimeEnvironment};
use crate::ast::{Builtin, Comparison, Mapping, Predicate, Reduction, Term};
use crate::backtrace::{Backtrace, Frame};
use crate::error::{RuntimeError, RuntimeResult, ScriptError, WithBacktrace};
use crate::stream::{JsonStream, SharedStream};
use crate::typecheck::TermType;

/// Evaluate a JSON-typed term.
pub fn eval(
    term: &Term,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Value> {
    env.interruptor.check(backtrace)?;

    match term {
        Term::Var { name } => env.scope.get(name).cloned().ok_or_else(|| {
            RuntimeError::new(format!("symbol '{}' is not in scope", name), backtrace)
        }),
        Term::Let { binds, expr } => {
            let mut env = env.new_scope();
            bind_all(binds, &mut env, backtrace)?;
            eval(expr, &mut env, &backtrace.with(Frame::Expr))
        }
        Term::Call { builtin, args } => eval_call(builtin, args, env, backtrace),
        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            if eval_test(test, env, backtrace)? {
                eval(true_branch, env, &backtrace.with(Frame::TrueBranch))
            } else {
                eval(false_branch, env, &backtrace.with(Frame::FalseBranch))
            }
        }
        Term::Error { message } => Err(RuntimeError::new(message.clone(), backtrace)),
        Term::Number { value } => number(*value, backtrace),
        Term::String { value } => Ok(Value::String(value.clone())),
        Term::Json { raw } => serde_json::from_str::<Value>(raw).at(backtrace),
        Term::Bool { value } => Ok(Value::Bool(*value)),
        Term::Null => Ok(Value::Null),
        Term::Array { elements } => {
            let mut values = Vec::with_capacity(elements.len());
            for (i, element) in elements.iter().enumerate() {
                values.push(eval(element, env, &backtrace.with(Frame::Element(i)))?);
            }
            Ok(Value::Array(values))
        }
        Term::Object { fields } => {
            let mut object = Map::new();
            for field in fields {
                let bt = backtrace.with(Frame::Attr(field.name.clone()));
                object.insert(field.name.clone(), eval(&field.term, env, &bt)?);
            }
            Ok(Value::Object(object))
        }
        Term::GetByKey { table, attr, key } => {
            let access = eval_table_ref(table, env, backtrace)?;
            if access.primary_key() != attr.as_str() {
                return Err(RuntimeError::new(
                    format!(
                        "get_by_key on {} must use the primary key '{}', not '{}'",
                        table,
                        access.primary_key(),
                        attr
                    ),
                    backtrace,
                ));
            }
            let key = eval(key, env, &backtrace.with(Frame::Key))?;
            Ok(access.point_read(&key).at(backtrace)?.unwrap_or(Value::Null))
        }
        Term::Script { source } => {
            let mut globals = env.scope.dump();
            if let Some(row) = env.implicit_value.get_value() {
                globals.insert("row".to_string(), row.clone());
            }
            env.script_pool
                .invoke(source, &globals, &env.interruptor)
                .map_err(|e| match e {
                    ScriptError::Interrupted => RuntimeError::new("query interrupted", backtrace),
                    other => RuntimeError::new(other.to_string(), backtrace),
                })
        }
        Term::ImplicitVar => env
            .implicit_value
            .get_value()
            .cloned()
            .ok_or_else(|| RuntimeError::new("no implicit variable in scope", backtrace)),
        Term::Table { table } => Err(RuntimeError::new(
            format!("table {} used where a value was expected", table),
            backtrace,
        )),
    }
}

fn number(value: f64, backtrace: &Backtrace) -> RuntimeResult<Value> {
    number_value(value)
        .ok_or_else(|| RuntimeError::new(format!("{} is not a finite number", value), backtrace))
}

pub(super) fn eval_test(
    test: &Term,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<bool> {
    let bt = backtrace.with(Frame::Test);
    let value = eval(test, env, &bt)?;
    expect_bool(&value, &bt)
}

/// Bind each `let` binding in order. Stream and view bindings go through a
/// multiplexer so the variable can be read more than once.
pub(super) fn bind_all(
    binds: &[crate::ast::Binding],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<()> {
    for bind in binds {
        let bt = backtrace.with(Frame::Bind(bind.name.clone()));
        match env.type_of(&bind.term, &bt)? {
            TermType::View => {
                let view = super::eval_view(&bind.term, env, &bt)?;
                let bound = BoundStream {
                    shared: SharedStream::new(view.stream),
                    access: Some(view.access),
                };
                env.bind_stream(&bind.name, bound);
            }
            TermType::Stream => {
                let stream = eval_stream(&bind.term, env, &bt)?;
                let bound = BoundStream {
                    shared: SharedStream::new(stream),
                    access: None,
                };
                env.bind_stream(&bind.name, bound);
            }
            TermType::Json | TermType::Arbitrary => {
                let value = eval(&bind.term, env, &bt)?;
                env.bind_value(&bind.name, value);
            }
        }
    }
    Ok(())
}

fn arg<'a>(args: &'a [Term], n: usize, backtrace: &Backtrace) -> RuntimeResult<&'a Term> {
    args.get(n)
        .ok_or_else(|| RuntimeError::new(format!("missing argument {}", n), backtrace))
}

fn eval_arg(
    args: &[Term],
    n: usize,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Value> {
    eval(arg(args, n, backtrace)?, env, &backtrace.with(Frame::Arg(n)))
}

fn stream_arg(
    args: &[Term],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<crate::stream::BoxedStream> {
    eval_stream(arg(args, 0, backtrace)?, env, &backtrace.with(Frame::Arg(0)))
}

fn eval_numbers(
    args: &[Term],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Vec<f64>> {
    let mut numbers = Vec::with_capacity(args.len());
    for (i, term) in args.iter().enumerate() {
        let bt = backtrace.with(Frame::Arg(i));
        numbers.push(expect_number(&eval(term, env, &bt)?, &bt)?);
    }
    Ok(numbers)
}

fn implicit_row(env: &RuntimeEnvironment, backtrace: &Backtrace) -> RuntimeResult<Value> {
    env.implicit_value
        .get_value()
        .cloned()
        .ok_or_else(|| RuntimeError::new("no implicit variable in scope", backtrace))
}

fn pick_attrs(doc: &Value, attrs: &[String], backtrace: &Backtrace) -> RuntimeResult<Value> {
    let mut picked = Map::new();
    for attr in attrs {
        picked.insert(attr.clone(), get_attr(doc, attr, backtrace)?.clone());
    }
    Ok(Value::Object(picked))
}

fn without(doc: &Value, attrs: &[String], backtrace: &Backtrace) -> RuntimeResult<Value> {
    let mut object = expect_object(doc, backtrace)?.clone();
    for attr in attrs {
        object.remove(attr);
    }
    Ok(Value::Object(object))
}

fn has_attr(doc: &Value, attr: &str, backtrace: &Backtrace) -> RuntimeResult<Value> {
    Ok(Value::Bool(expect_object(doc, backtrace)?.contains_key(attr)))
}

/// Right-hand attributes win.
pub(super) fn merge_objects(
    left: &Value,
    right: &Value,
    backtrace: &Backtrace,
) -> RuntimeResult<Value> {
    let mut merged = expect_object(left, backtrace)?.clone();
    for (k, v) in expect_object(right, backtrace)? {
        merged.insert(k.clone(), v.clone());
    }
    Ok(Value::Object(merged))
}

/// Evaluate a builtin call whose result is a single JSON value.
pub fn eval_call(
    builtin: &Builtin,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Value> {
    match builtin {
        Builtin::Not => {
            let bt = backtrace.with(Frame::Arg(0));
            let value = eval_arg(args, 0, env, backtrace)?;
            Ok(Value::Bool(!expect_bool(&value, &bt)?))
        }
        Builtin::GetAttr { attr } => {
            let doc = eval_arg(args, 0, env, backtrace)?;
            Ok(get_attr(&doc, attr, backtrace)?.clone())
        }
        Builtin::ImplicitGetAttr { attr } => {
            let row = implicit_row(env, backtrace)?;
            Ok(get_attr(&row, attr, backtrace)?.clone())
        }
        Builtin::HasAttr { attr } => {
            has_attr(&eval_arg(args, 0, env, backtrace)?, attr, backtrace)
        }
        Builtin::ImplicitHasAttr { attr } => {
            has_attr(&implicit_row(env, backtrace)?, attr, backtrace)
        }
        Builtin::PickAttrs { attrs } => {
            pick_attrs(&eval_arg(args, 0, env, backtrace)?, attrs, backtrace)
        }
        Builtin::ImplicitPickAttrs { attrs } => {
            pick_attrs(&implicit_row(env, backtrace)?, attrs, backtrace)
        }
        Builtin::Without { attrs } => {
            without(&eval_arg(args, 0, env, backtrace)?, attrs, backtrace)
        }
        Builtin::ImplicitWithout { attrs } => {
            without(&implicit_row(env, backtrace)?, attrs, backtrace)
        }
        Builtin::MapMerge => {
            let left = eval_arg(args, 0, env, backtrace)?;
            let right = eval_arg(args, 1, env, backtrace)?;
            merge_objects(&left, &right, backtrace)
        }
        Builtin::ArrayAppend => {
            let array = eval_arg(args, 0, env, backtrace)?;
            let mut array = expect_array(&array, &backtrace.with(Frame::Arg(0)))?.clone();
            array.push(eval_arg(args, 1, env, backtrace)?);
            Ok(Value::Array(array))
        }
        Builtin::ArrayConcat => {
            let left = eval_arg(args, 0, env, backtrace)?;
            let right = eval_arg(args, 1, env, backtrace)?;
            let mut joined = expect_array(&left, &backtrace.with(Frame::Arg(0)))?.clone();
            joined.extend(
                expect_array(&right, &backtrace.with(Frame::Arg(1)))?
                    .iter()
                    .cloned(),
            );
            Ok(Value::Array(joined))
        }
        Builtin::ArraySlice => {
            let array = eval_arg(args, 0, env, backtrace)?;
            let array = expect_array(&array, &backtrace.with(Frame::Arg(0)))?;
            let lower = slice_bound(args, 1, 0, array.len(), env, backtrace)?;
            let upper = slice_bound(args, 2, array.len(), array.len(), env, backtrace)?;
            let slice = if lower < upper {
                array[lower..upper].to_vec()
            } else {
                Vec::new()
            };
            Ok(Value::Array(slice))
        }
        Builtin::ArrayNth => {
            let array = eval_arg(args, 0, env, backtrace)?;
            let array = expect_array(&array, &backtrace.with(Frame::Arg(0)))?;
            let index = eval_arg(args, 1, env, backtrace)?;
            let index = expect_integer(&index, &backtrace.with(Frame::Arg(1)))?;
            resolve_index(index, array.len())
                .map(|i| array[i].clone())
                .ok_or_else(|| {
                    RuntimeError::new(
                        format!(
                            "index {} out of bounds for array of length {}",
                            index,
                            array.len()
                        ),
                        backtrace,
                    )
                })
        }
        Builtin::ArrayLength => {
            let array = eval_arg(args, 0, env, backtrace)?;
            let len = expect_array(&array, &backtrace.with(Frame::Arg(0)))?.len();
            Ok(Value::from(len))
        }
        Builtin::Add => {
            let numbers = eval_numbers(args, env, backtrace)?;
            number(numbers.iter().sum(), backtrace)
        }
        Builtin::Subtract => {
            let numbers = eval_numbers(args, env, backtrace)?;
            match numbers.split_first() {
                None => Err(RuntimeError::new(
                    "subtract requires at least one argument",
                    backtrace,
                )),
                Some((first, [])) => number(-first, backtrace),
                Some((first, rest)) => {
                    number(rest.iter().fold(*first, |acc, n| acc - n), backtrace)
                }
            }
        }
        Builtin::Multiply => {
            let numbers = eval_numbers(args, env, backtrace)?;
            number(numbers.iter().product(), backtrace)
        }
        Builtin::Divide => {
            let numbers = eval_numbers(args, env, backtrace)?;
            let (first, rest) = numbers.split_first().ok_or_else(|| {
                RuntimeError::new("divide requires at least one argument", backtrace)
            })?;
            let (mut acc, divisors) = if rest.is_empty() {
                (1.0, std::slice::from_ref(first))
            } else {
                (*first, rest)
            };
            for divisor in divisors {
                if *divisor == 0.0 {
                    return Err(RuntimeError::new("division by zero", backtrace));
                }
                acc /= divisor;
            }
            number(acc, backtrace)
        }
        Builtin::Modulo => {
            let left = eval_arg(args, 0, env, backtrace)?;
            let left = expect_integer(&left, &backtrace.with(Frame::Arg(0)))?;
            let right = eval_arg(args, 1, env, backtrace)?;
            let right = expect_integer(&right, &backtrace.with(Frame::Arg(1)))?;
            if right == 0 {
                return Err(RuntimeError::new("modulo by zero", backtrace));
            }
            Ok(Value::from(left.wrapping_rem(right)))
        }
        Builtin::Compare { comparison } => eval_cmp(*comparison, args, env, backtrace),
        Builtin::Any | Builtin::All => {
            let short_circuit = matches!(builtin, Builtin::Any);
            for (i, term) in args.iter().enumerate() {
                let bt = backtrace.with(Frame::Arg(i));
                if expect_bool(&eval(term, env, &bt)?, &bt)? == short_circuit {
                    return Ok(Value::Bool(short_circuit));
                }
            }
            Ok(Value::Bool(!short_circuit))
        }

        Builtin::Length => {
            let mut stream = stream_arg(args, env, backtrace)?;
            let mut count = 0usize;
            while stream.next()?.is_some() {
                count += 1;
            }
            Ok(Value::from(count))
        }
        Builtin::Nth => {
            let mut stream = stream_arg(args, env, backtrace)?;
            let index = eval_arg(args, 1, env, backtrace)?;
            let index = expect_integer(&index, &backtrace.with(Frame::Arg(1)))?;
            let out_of_bounds = || {
                RuntimeError::new(format!("index {} out of bounds for stream", index), backtrace)
            };
            if index < 0 {
                let docs = crate::stream::drain(&mut stream)?;
                return resolve_index(index, docs.len())
                    .map(|i| docs[i].clone())
                    .ok_or_else(out_of_bounds);
            }
            let mut remaining = index;
            while let Some(doc) = stream.next()? {
                if remaining == 0 {
                    return Ok(doc);
                }
                remaining -= 1;
            }
            Err(out_of_bounds())
        }
        Builtin::StreamToArray => {
            let mut stream = stream_arg(args, env, backtrace)?;
            Ok(Value::Array(crate::stream::drain(&mut stream)?))
        }
        Builtin::Reduce { reduction } => {
            let mut stream = stream_arg(args, env, backtrace)?;
            let bt = backtrace.with(Frame::Reduction);
            let mut acc = eval(&reduction.base, env, &bt.with(Frame::Base))?;
            while let Some(doc) = stream.next()? {
                acc = apply_reduction(reduction, acc, doc, env, &bt)?;
            }
            Ok(acc)
        }
        Builtin::GroupedMapReduce {
            group_mapping,
            value_mapping,
            reduction,
        } => {
            let mut stream = stream_arg(args, env, backtrace)?;
            let group_bt = backtrace.with(Frame::Group);
            let value_bt = backtrace.with(Frame::Value);
            let reduction_bt = backtrace.with(Frame::Reduction);
            let base = eval(&reduction.base, env, &reduction_bt.with(Frame::Base))?;

            let mut groups: BTreeMap<OrderedValue, Value> = BTreeMap::new();
            while let Some(doc) = stream.next()? {
                let group = apply_mapping(group_mapping, doc.clone(), env, &group_bt)?;
                let value = apply_mapping(value_mapping, doc, env, &value_bt)?;
                let acc = groups
                    .remove(&OrderedValue(group.clone()))
                    .unwrap_or_else(|| base.clone());
                let acc = apply_reduction(reduction, acc, value, env, &reduction_bt)?;
                groups.insert(OrderedValue(group), acc);
            }

            let result = groups
                .into_iter()
                .map(|(group, reduction)| {
                    let mut entry = Map::new();
                    entry.insert("group".to_string(), group.0);
                    entry.insert("reduction".to_string(), reduction);
                    Value::Object(entry)
                })
                .collect();
            Ok(Value::Array(result))
        }

        Builtin::Filter { .. }
        | Builtin::Map { .. }
        | Builtin::ConcatMap { .. }
        | Builtin::OrderBy { .. }
        | Builtin::Distinct
        | Builtin::Limit
        | Builtin::Skip
        | Builtin::Union
        | Builtin::ArrayToStream
        | Builtin::Range { .. } => Err(RuntimeError::new(
            format!("{} produces a stream where a value was expected", builtin.name()),
            backtrace,
        )),
    }
}

fn slice_bound(
    args: &[Term],
    n: usize,
    open: usize,
    len: usize,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<usize> {
    let value = eval_arg(args, n, env, backtrace)?;
    if value.is_null() {
        return Ok(open);
    }
    let bound = expect_integer(&value, &backtrace.with(Frame::Arg(n)))?;
    Ok(clamp_bound(bound, len))
}

/// Evaluate a chained comparison over adjacent arguments, left to right,
/// stopping at the first pair that fails.
pub fn eval_cmp(
    comparison: Comparison,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Value> {
    let mut terms = args.iter().enumerate();
    let mut prev = match terms.next() {
        Some((i, term)) => eval(term, env, &backtrace.with(Frame::Arg(i)))?,
        None => return Ok(Value::Bool(true)),
    };
    for (i, term) in terms {
        let current = eval(term, env, &backtrace.with(Frame::Arg(i)))?;
        let ordering = compare_values(&prev, &current);
        let holds = match comparison {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Le => ordering != Ordering::Greater,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Ge => ordering != Ordering::Less,
        };
        if !holds {
            return Ok(Value::Bool(false));
        }
        prev = current;
    }
    Ok(Value::Bool(true))
}

/// Run a mapping body with `row` bound to its argument and as the implicit
/// value. `backtrace` names the mapping.
pub(super) fn apply_mapping(
    mapping: &Mapping,
    row: Value,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Value> {
    let mut env = env.row_scope(&mapping.arg, row);
    eval(&mapping.body, &mut env, &backtrace.with(Frame::Body))
}

pub(super) fn apply_predicate(
    predicate: &Predicate,
    row: Value,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<bool> {
    let bt = backtrace.with(Frame::Body);
    let mut env = env.row_scope(&predicate.arg, row);
    let result = eval(&predicate.body, &mut env, &bt)?;
    result.as_bool().ok_or_else(|| {
        RuntimeError::new(
            format!(
                "predicate must return a boolean, got {}",
                super::helpers::json_type_name(&result)
            ),
            &bt,
        )
    })
}

pub(super) fn apply_reduction(
    reduction: &Reduction,
    acc: Value,
    element: Value,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Value> {
    let mut env = env.opaque_scope();
    env.bind_value(&reduction.var1, acc);
    env.bind_value(&reduction.var2, element);
    eval(&reduction.body, &mut env, &backtrace.with(Frame::Body))
}
