//! Whole-query checking.

use crate::ast::{Query, ReadQuery, WriteQuery};
use crate::backtrace::{Backtrace, Frame};
use crate::error::CheckResult;

use super::{check_mapping_type, check_term_type, get_term_type, TermType, TypeEnvironment};

/// A read query may produce any type; the inferred type decides how the
/// executor renders the response.
pub fn check_read_query_type(
    read: &ReadQuery,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<TermType> {
    get_term_type(&read.term, env, backtrace)
}

pub fn check_write_query_type(
    write: &WriteQuery,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<()> {
    match write {
        WriteQuery::Update { view, mapping } | WriteQuery::Mutate { view, mapping } => {
            check_term_type(view, TermType::View, env, &backtrace.with(Frame::View))?;
            check_mapping_type(mapping, TermType::Json, env, &backtrace.with(Frame::Mapping))?;
        }
        WriteQuery::Delete { view } => {
            check_term_type(view, TermType::View, env, &backtrace.with(Frame::View))?;
        }
        WriteQuery::Insert { terms, .. } => {
            for (i, term) in terms.iter().enumerate() {
                check_term_type(term, TermType::Json, env, &backtrace.with(Frame::Element(i)))?;
            }
        }
        WriteQuery::ForEach {
            stream,
            var,
            queries,
        } => {
            check_term_type(stream, TermType::Stream, env, &backtrace.with(Frame::Stream))?;

            let mut env = env.new_scope();
            env.scope.put_in_scope(var.as_str(), TermType::Json);
            for (i, query) in queries.iter().enumerate() {
                check_write_query_type(query, &mut env, &backtrace.with(Frame::Query(i)))?;
            }
        }
        WriteQuery::PointUpdate { key, mapping, .. }
        | WriteQuery::PointMutate { key, mapping, .. } => {
            check_term_type(key, TermType::Json, env, &backtrace.with(Frame::Key))?;
            check_mapping_type(mapping, TermType::Json, env, &backtrace.with(Frame::Mapping))?;
        }
        WriteQuery::PointDelete { key, .. } => {
            check_term_type(key, TermType::Json, env, &backtrace.with(Frame::Key))?;
        }
    }
    Ok(())
}

pub fn check_query_type(
    query: &Query,
    env: &mut TypeEnvironment,
    backtrace: &Backtrace,
) -> CheckResult<()> {
    match query {
        Query::Read(read) => check_read_query_type(read, env, backtrace).map(|_| ()),
        Query::Write(write) => check_write_query_type(write, env, backtrace),
    }
}
