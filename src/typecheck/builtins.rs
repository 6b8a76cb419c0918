//! Builtin signatures and checking of the functions builtins carry.

use crate::ast::{Builtin, Mapping, Predicate, Reduction};
use crate::backtrace::{Backtrace, Frame};
use crate::error::{BadQueryError, CheckResult, MalformedQuery};

use super::{check_term_type, FunctionType, TermType, TypeEnvironment};

use TermType::{Json, Stream};

/// Resolve the signature of `builtin`, checking any predicate, mapping or
/// reduction it carries along the way.
pub fn get_function_type(
    builtin: &Builtin,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<FunctionType> {
    let fn_type = match builtin {
        Builtin::Not
        | Builtin::GetAttr { .. }
        | Builtin::HasAttr { .. }
        | Builtin::PickAttrs { .. }
        | Builtin::Without { .. }
        | Builtin::ArrayLength => FunctionType::unary(Json, Json),

        Builtin::ImplicitGetAttr { .. }
        | Builtin::ImplicitHasAttr { .. }
        | Builtin::ImplicitPickAttrs { .. }
        | Builtin::ImplicitWithout { .. } => {
            if env.implicit_type.get_value() != Some(&Json) {
                return Err(BadQueryError::new(
                    format!("{} used with no implicit variable in scope", builtin.name()),
                    backtrace,
                )
                .into());
            }
            FunctionType::fixed(vec![], Json)
        }

        Builtin::MapMerge
        | Builtin::ArrayAppend
        | Builtin::ArrayConcat
        | Builtin::ArrayNth
        | Builtin::Modulo => FunctionType::binary(Json, Json, Json),

        Builtin::ArraySlice => FunctionType::fixed(vec![Json, Json, Json], Json),

        Builtin::Add
        | Builtin::Subtract
        | Builtin::Multiply
        | Builtin::Divide
        | Builtin::Compare { .. }
        | Builtin::Any
        | Builtin::All => FunctionType::variadic(Json, Json),

        Builtin::Filter { predicate } => {
            check_predicate_type(predicate, env, &backtrace.with(Frame::Predicate))?;
            FunctionType::unary(Stream, Stream)
        }
        Builtin::Map { mapping } => {
            check_mapping_type(mapping, Json, env, &backtrace.with(Frame::Mapping))?;
            FunctionType::unary(Stream, Stream)
        }
        Builtin::ConcatMap { mapping } => {
            check_mapping_type(mapping, Stream, env, &backtrace.with(Frame::Mapping))?;
            FunctionType::unary(Stream, Stream)
        }
        Builtin::OrderBy { keys } => {
            if keys.is_empty() {
                return Err(MalformedQuery::new(format!(
                    "order_by at '{}' has no keys",
                    backtrace
                ))
                .into());
            }
            FunctionType::unary(Stream, Stream)
        }
        Builtin::Distinct => FunctionType::unary(Stream, Stream),
        Builtin::Range { lower, upper, .. } => {
            if let Some(lower) = lower {
                check_term_type(lower, Json, env, &backtrace.with(Frame::Lower))?;
            }
            if let Some(upper) = upper {
                check_term_type(upper, Json, env, &backtrace.with(Frame::Upper))?;
            }
            FunctionType::unary(Stream, Stream)
        }

        Builtin::Limit | Builtin::Skip => FunctionType::binary(Stream, Json, Stream),
        Builtin::Nth => FunctionType::binary(Stream, Json, Json),
        Builtin::Union => FunctionType::variadic(Stream, Stream),

        Builtin::Length | Builtin::StreamToArray => FunctionType::unary(Stream, Json),
        Builtin::ArrayToStream => FunctionType::unary(Json, Stream),

        Builtin::Reduce { reduction } => {
            check_reduction_type(reduction, env, &backtrace.with(Frame::Reduction))?;
            FunctionType::unary(Stream, Json)
        }
        Builtin::GroupedMapReduce {
            group_mapping,
            value_mapping,
            reduction,
        } => {
            check_mapping_type(group_mapping, Json, env, &backtrace.with(Frame::Group))?;
            check_mapping_type(value_mapping, Json, env, &backtrace.with(Frame::Value))?;
            check_reduction_type(reduction, env, &backtrace.with(Frame::Reduction))?;
            FunctionType::unary(Stream, Json)
        }
    };
    Ok(fn_type)
}

/// The base must be JSON; the body sees both variables bound to JSON and no
/// implicit row.
pub fn check_reduction_type(
    reduction: &Reduction,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<()> {
    check_term_type(&reduction.base, Json, env, &backtrace.with(Frame::Base))?;

    let mut env = env.opaque_scope();
    env.scope.put_in_scope(reduction.var1.as_str(), Json);
    env.scope.put_in_scope(reduction.var2.as_str(), Json);
    check_term_type(&reduction.body, Json, &mut env, &backtrace.with(Frame::Body))?;
    Ok(())
}

pub fn check_mapping_type(
    mapping: &Mapping,
    return_type: TermType,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<()> {
    let mut env = env.row_scope(&mapping.arg, Json);
    check_term_type(&mapping.body, return_type, &mut env, &backtrace.with(Frame::Body))?;
    Ok(())
}

pub fn check_predicate_type(
    predicate: &Predicate,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<()> {
    let mut env = env.row_scope(&predicate.arg, Json);
    check_term_type(&predicate.body, Json, &mut env, &backtrace.with(Frame::Body))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{OrderKey, Term};
    use crate::error::ErrorCategory;
    use crate::typecheck::get_term_type;

    fn infer(term: &Term) -> CheckResult<TermType> {
        get_term_type(term, &mut TypeEnvironment::new(), &Backtrace::root())
    }

    fn users() -> Term {
        Term::table("test", "users")
    }

    #[test]
    fn test_stream_builtins() {
        let map = Term::call(
            Builtin::Map {
                mapping: Mapping::new("u", Term::var("u")),
            },
            vec![users()],
        );
        assert_eq!(infer(&map).unwrap(), Stream);

        let length = Term::call(Builtin::Length, vec![map]);
        assert_eq!(infer(&length).unwrap(), Json);
    }

    #[test]
    fn test_view_preserving_builtins() {
        let filtered = Term::call(
            Builtin::Filter {
                predicate: Predicate::new("u", Term::boolean(true)),
            },
            vec![users()],
        );
        assert_eq!(infer(&filtered).unwrap(), TermType::View);

        let limited = Term::call(Builtin::Limit, vec![filtered, Term::number(2.0)]);
        assert_eq!(infer(&limited).unwrap(), TermType::View);

        let from_array = Term::call(Builtin::ArrayToStream, vec![Term::array(vec![])]);
        let filtered = Term::call(
            Builtin::Filter {
                predicate: Predicate::new("u", Term::boolean(true)),
            },
            vec![from_array],
        );
        assert_eq!(infer(&filtered).unwrap(), Stream);
    }

    #[test]
    fn test_predicate_binds_row() {
        let term = Term::call(
            Builtin::Filter {
                predicate: Predicate::new(
                    "u",
                    Term::call(
                        Builtin::ImplicitHasAttr {
                            attr: "age".to_string(),
                        },
                        vec![],
                    ),
                ),
            },
            vec![users()],
        );
        assert!(infer(&term).is_ok());
    }

    #[test]
    fn test_implicit_builtin_outside_row() {
        let term = Term::call(
            Builtin::ImplicitGetAttr {
                attr: "age".to_string(),
            },
            vec![],
        );
        let err = infer(&term).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BadQuery);
    }

    #[test]
    fn test_concat_map_requires_stream_body() {
        let term = Term::call(
            Builtin::ConcatMap {
                mapping: Mapping::new("u", Term::var("u")),
            },
            vec![users()],
        );
        let err = infer(&term).unwrap_err();
        assert_eq!(
            err.backtrace().unwrap(),
            &Backtrace::root().with(Frame::Mapping).with(Frame::Body)
        );
    }

    #[test]
    fn test_reduction_hides_row() {
        let reduction = Reduction::new(
            Term::number(0.0),
            "acc",
            "x",
            Term::call(Builtin::Add, vec![Term::var("acc"), Term::ImplicitVar]),
        );
        let term = Term::call(
            Builtin::Map {
                mapping: Mapping::new(
                    "u",
                    Term::call(
                        Builtin::Reduce { reduction },
                        vec![Term::call(Builtin::ArrayToStream, vec![Term::var("u")])],
                    ),
                ),
            },
            vec![users()],
        );
        let err = infer(&term).unwrap_err();
        assert_eq!(err.message(), "no implicit variable in scope");
    }

    #[test]
    fn test_empty_order_by_is_malformed() {
        let term = Term::call(Builtin::OrderBy { keys: vec![] }, vec![users()]);
        assert_eq!(
            infer(&term).unwrap_err().category(),
            ErrorCategory::MalformedInput
        );

        let term = Term::call(
            Builtin::OrderBy {
                keys: vec![OrderKey::desc("age")],
            },
            vec![users()],
        );
        assert_eq!(infer(&term).unwrap(), TermType::View);
    }

    #[test]
    fn test_range_bounds_must_be_json() {
        let term = Term::call(
            Builtin::Range {
                attr: "age".to_string(),
                lower: Some(Box::new(users())),
                upper: None,
            },
            vec![users()],
        );
        let err = infer(&term).unwrap_err();
        assert_eq!(
            err.backtrace().unwrap(),
            &Backtrace::root().with(Frame::Lower)
        );
    }
}
