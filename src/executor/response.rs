//! Query results and their protocol envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueryError, QueryResult};

/// Result of a successful query.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A read producing a single JSON value.
    Json(Value),
    /// A read producing a stream, drained in order.
    Stream(Vec<Value>),
    Write(WriteSummary),
}

/// Counts of what a write query did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub generated_keys: Vec<String>,
}

impl WriteSummary {
    /// Count one failed document, keeping the first message seen.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message.into());
        }
    }

    /// Fold `other` into this summary.
    pub fn merge(&mut self, other: WriteSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.errors += other.errors;
        if self.first_error.is_none() {
            self.first_error = other.first_error;
        }
        self.generated_keys.extend(other.generated_keys);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    SuccessJson,
    SuccessStream,
    SuccessEmpty,
    BrokenClient,
    BadQuery,
    RuntimeError,
}

/// What goes back over the wire. Every result value is a JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: StatusCode,
    pub response: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub backtrace: Vec<String>,
}

impl ResponseEnvelope {
    pub fn from_result(result: &QueryResult<Response>) -> Self {
        match result {
            Ok(response) => Self::success(response),
            Err(error) => Self::failure(error),
        }
    }

    fn success(response: &Response) -> Self {
        let (status, response) = match response {
            Response::Json(value) => (StatusCode::SuccessJson, vec![value.to_string()]),
            Response::Stream(docs) if docs.is_empty() => (StatusCode::SuccessEmpty, Vec::new()),
            Response::Stream(docs) => (
                StatusCode::SuccessStream,
                docs.iter().map(|d| d.to_string()).collect(),
            ),
            Response::Write(summary) => (
                StatusCode::SuccessJson,
                vec![serde_json::to_value(summary)
                    .unwrap_or(Value::Null)
                    .to_string()],
            ),
        };
        Self {
            status,
            response,
            error_message: None,
            backtrace: Vec::new(),
        }
    }

    fn failure(error: &QueryError) -> Self {
        let status = match error {
            QueryError::Malformed(_) => StatusCode::BrokenClient,
            QueryError::BadQuery(_) => StatusCode::BadQuery,
            QueryError::Runtime(_) => StatusCode::RuntimeError,
        };
        let backtrace = error
            .backtrace()
            .map(|bt| bt.frames().iter().map(|f| f.to_string()).collect())
            .unwrap_or_default();
        Self {
            status,
            response: Vec::new(),
            error_message: Some(error.message().to_string()),
            backtrace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtrace::{Backtrace, Frame};
    use crate::error::{BadQueryError, MalformedQuery, RuntimeError};
    use serde_json::json;

    #[test]
    fn test_success_envelopes() {
        let env = ResponseEnvelope::from_result(&Ok(Response::Json(json!({"a": 1}))));
        assert_eq!(env.status, StatusCode::SuccessJson);
        assert_eq!(env.response, vec![r#"{"a":1}"#.to_string()]);

        let env = ResponseEnvelope::from_result(&Ok(Response::Stream(vec![json!(1), json!("x")])));
        assert_eq!(env.status, StatusCode::SuccessStream);
        assert_eq!(env.response, vec!["1".to_string(), "\"x\"".to_string()]);

        let env = ResponseEnvelope::from_result(&Ok(Response::Stream(vec![])));
        assert_eq!(env.status, StatusCode::SuccessEmpty);
        assert!(env.response.is_empty());
    }

    #[test]
    fn test_write_summary_envelope() {
        let summary = WriteSummary {
            inserted: 2,
            ..Default::default()
        };
        let env = ResponseEnvelope::from_result(&Ok(Response::Write(summary)));
        let body: Value = serde_json::from_str(&env.response[0]).unwrap();
        assert_eq!(
            body,
            json!({"inserted": 2, "updated": 0, "deleted": 0, "errors": 0})
        );
    }

    #[test]
    fn test_error_envelopes() {
        let bt = Backtrace::root().with(Frame::Arg(1)).with(Frame::Body);

        let env = ResponseEnvelope::from_result(&Err(RuntimeError::new("boom", &bt).into()));
        assert_eq!(env.status, StatusCode::RuntimeError);
        assert_eq!(env.error_message.as_deref(), Some("boom"));
        assert_eq!(env.backtrace, vec!["arg:1".to_string(), "body".to_string()]);

        let env = ResponseEnvelope::from_result(&Err(BadQueryError::new("bad", &bt).into()));
        assert_eq!(env.status, StatusCode::BadQuery);

        let env = ResponseEnvelope::from_result(&Err(MalformedQuery::new("junk").into()));
        assert_eq!(env.status, StatusCode::BrokenClient);
        assert!(env.backtrace.is_empty());
    }

    #[test]
    fn test_summary_merge() {
        let mut total = WriteSummary::default();
        let mut first = WriteSummary {
            inserted: 1,
            generated_keys: vec!["k1".to_string()],
            ..Default::default()
        };
        first.record_error("first");
        let mut second = WriteSummary {
            deleted: 3,
            ..Default::default()
        };
        second.record_error("second");

        total.merge(first);
        total.merge(second);
        assert_eq!(total.inserted, 1);
        assert_eq!(total.deleted, 3);
        assert_eq!(total.errors, 2);
        assert_eq!(total.first_error.as_deref(), Some("first"));
        assert_eq!(total.generated_keys, vec!["k1".to_string()]);
    }
}
