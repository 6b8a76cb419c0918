//! Query execution entry points.

use std::time::Instant;

use serde_json::Value;

use super::eval::eval;
use super::eval_stream::eval_stream;
use super::write::execute_write;
use super::{Response, ResponseEnvelope, RuntimeEnvironment};
use crate::ast::{Query, ReadQuery};
use crate::backtrace::Backtrace;
use crate::error::{QueryResult, RuntimeError, RuntimeResult};
use crate::stream::JsonStream;
use crate::typecheck::{check_query_type, TermType};

/// Type check `query` against the environment's bindings, then execute it.
pub fn run_query(query: &Query, env: &mut RuntimeEnvironment) -> QueryResult<Response> {
    let start = Instant::now();
    let backtrace = Backtrace::root();
    tracing::debug!("[QUERY] Running {} query", query_kind(query));

    if let Err(e) = check_query_type(query, &mut env.type_env, &backtrace) {
        let location = e.backtrace().map(|bt| bt.to_string()).unwrap_or_default();
        tracing::debug!("[QUERY] Rejected at {}: {}", location, e);
        return Err(e);
    }

    match execute(query, env, &backtrace) {
        Ok(response) => {
            tracing::debug!("[QUERY] Completed in {:?}", start.elapsed());
            Ok(response)
        }
        Err(e) => {
            tracing::warn!("[QUERY] Failed at {}: {}", e.backtrace, e.message);
            Err(e.into())
        }
    }
}

fn query_kind(query: &Query) -> &'static str {
    match query {
        Query::Read(_) => "read",
        Query::Write(write) => write.kind(),
    }
}

/// Decode a query from its JSON form, run it, and wrap the outcome for the
/// wire.
pub fn run_query_str(input: &str, env: &mut RuntimeEnvironment) -> ResponseEnvelope {
    let result = Query::from_json_str(input)
        .map_err(Into::into)
        .and_then(|query| run_query(&query, env));
    ResponseEnvelope::from_result(&result)
}

/// Execute an already checked query.
pub fn execute(
    query: &Query,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Response> {
    match query {
        Query::Read(read) => execute_read(read, env, backtrace),
        Query::Write(write) => execute_write(write, env, backtrace).map(Response::Write),
    }
}

/// A value-typed read answers with one JSON value; a stream-typed read is
/// drained into the response, up to `max_response_documents`.
pub fn execute_read(
    read: &ReadQuery,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> RuntimeResult<Response> {
    match env.type_of(&read.term, backtrace)? {
        TermType::Json | TermType::Arbitrary => {
            eval(&read.term, env, backtrace).map(Response::Json)
        }
        TermType::Stream | TermType::View => {
            let mut stream = eval_stream(&read.term, env, backtrace)?;
            let limit = env.config.max_response_documents;
            let mut docs: Vec<Value> = Vec::new();
            while let Some(doc) = stream.next()? {
                if docs.len() >= limit {
                    return Err(RuntimeError::new(
                        format!("response exceeds the limit of {} documents", limit),
                        backtrace,
                    ));
                }
                docs.push(doc);
            }
            tracing::trace!("[QUERY] Streamed {} documents", docs.len());
            Ok(Response::Stream(docs))
        }
    }
}
