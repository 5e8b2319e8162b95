use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Field name carrying the correlation id on both streams.
pub const CORRELATION_ID_FIELD: &str = "correlation_id";

const REQUEST_TYPE_FIELD: &str = "request_type";
const SHOP_ID_FIELD: &str = "shop_id";
const PARAMETERS_FIELD: &str = "parameters";
const TIMESTAMP_FIELD: &str = "timestamp";
const STATUS_FIELD: &str = "status";
const DATA_FIELD: &str = "data";
const ERROR_FIELD: &str = "error";
const INIT_FIELD: &str = "init";

/// The closed set of request tags the bridge routes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Search customers of a shop by name.
    CustomerSearch,
    /// Detail record for a single customer.
    CustomerDetail,
    /// Visit history for a single customer.
    VisitHistory,
    /// Customers with a reservation today.
    TodayReservations,
    /// Update the memo attached to a customer.
    MemoUpdate,
    /// Free-form chat message answered by the conversational worker.
    CustomerMessage,
}

impl RequestKind {
    /// The wire tag for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CustomerSearch => "customer_search",
            Self::CustomerDetail => "customer_detail",
            Self::VisitHistory => "visit_history",
            Self::TodayReservations => "today_reservations",
            Self::MemoUpdate => "memo_update",
            Self::CustomerMessage => "customer_message",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer_search" => Ok(Self::CustomerSearch),
            "customer_detail" => Ok(Self::CustomerDetail),
            "visit_history" => Ok(Self::VisitHistory),
            "today_reservations" => Ok(Self::TodayReservations),
            "memo_update" => Ok(Self::MemoUpdate),
            "customer_message" => Ok(Self::CustomerMessage),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A request tag outside the supported set.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unsupported request type `{0}`")]
pub struct UnknownKind(pub String);

/// A request message as appended to the request stream.
#[derive(Clone, Debug, PartialEq)]
pub struct DataRequest {
    /// Unique token matching the eventual result to this request.
    pub correlation_id: String,
    /// Which handler the request selects.
    pub kind: RequestKind,
    /// The shop the request is scoped to.
    pub shop_id: i64,
    /// Handler-specific parameters, opaque to the broker.
    pub parameters: Map<String, Value>,
    /// Producer wall-clock milliseconds, diagnostic only.
    pub timestamp_ms: u64,
}

impl DataRequest {
    /// Creates a request with a fresh correlation id.
    #[must_use]
    pub fn new(kind: RequestKind, shop_id: i64, parameters: Map<String, Value>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            kind,
            shop_id,
            parameters,
            timestamp_ms: now_ms(),
        }
    }

    /// Flattens the request into stream-entry fields.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (CORRELATION_ID_FIELD.to_string(), self.correlation_id.clone()),
            (REQUEST_TYPE_FIELD.to_string(), self.kind.to_string()),
            (SHOP_ID_FIELD.to_string(), self.shop_id.to_string()),
            (
                PARAMETERS_FIELD.to_string(),
                Value::Object(self.parameters.clone()).to_string(),
            ),
            (TIMESTAMP_FIELD.to_string(), self.timestamp_ms.to_string()),
        ]
    }

    /// Parses a request out of stream-entry fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let correlation_id = fields.get(CORRELATION_ID_FIELD).cloned();

        let Some(correlation_id) = correlation_id else {
            return Err(DecodeError::MissingField {
                field: CORRELATION_ID_FIELD,
                correlation_id: None,
            });
        };

        let Some(tag) = fields.get(REQUEST_TYPE_FIELD) else {
            return Err(DecodeError::MissingField {
                field: REQUEST_TYPE_FIELD,
                correlation_id: Some(correlation_id),
            });
        };

        let kind = match tag.parse::<RequestKind>() {
            Ok(kind) => kind,
            Err(err) => {
                return Err(DecodeError::UnknownKind {
                    source: err,
                    correlation_id: Some(correlation_id),
                });
            }
        };

        let Some(shop_id) = fields.get(SHOP_ID_FIELD) else {
            return Err(DecodeError::MissingField {
                field: SHOP_ID_FIELD,
                correlation_id: Some(correlation_id),
            });
        };

        let shop_id = match shop_id.parse::<i64>() {
            Ok(shop_id) => shop_id,
            Err(err) => {
                return Err(DecodeError::InvalidField {
                    field: SHOP_ID_FIELD,
                    message: err.to_string(),
                    correlation_id: Some(correlation_id),
                });
            }
        };

        let parameters = match fields.get(PARAMETERS_FIELD).filter(|p| !p.is_empty()) {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(DecodeError::InvalidField {
                        field: PARAMETERS_FIELD,
                        message: "not a JSON object".to_string(),
                        correlation_id: Some(correlation_id),
                    });
                }
                Err(err) => {
                    return Err(DecodeError::InvalidField {
                        field: PARAMETERS_FIELD,
                        message: err.to_string(),
                        correlation_id: Some(correlation_id),
                    });
                }
            },
        };

        let timestamp_ms = fields
            .get(TIMESTAMP_FIELD)
            .and_then(|t| t.parse().ok())
            .unwrap_or_default();

        Ok(Self {
            correlation_id,
            kind,
            shop_id,
            parameters,
            timestamp_ms,
        })
    }
}

/// The outcome a worker reports for a request.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The handler produced a payload.
    Success(Value),
    /// The handler failed; carries the failure description.
    Error(String),
}

/// A result message as appended to the result stream.
#[derive(Clone, Debug, PartialEq)]
pub struct DataResult {
    /// Copied from the originating request.
    pub correlation_id: String,
    /// Success payload or failure description.
    pub outcome: Outcome,
    /// Worker wall-clock milliseconds, diagnostic only.
    pub timestamp_ms: u64,
}

impl DataResult {
    /// A successful result carrying `data`.
    #[must_use]
    pub fn success(correlation_id: String, data: Value) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Success(data),
            timestamp_ms: now_ms(),
        }
    }

    /// A failed result carrying `message`.
    #[must_use]
    pub fn error(correlation_id: String, message: String) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Error(message),
            timestamp_ms: now_ms(),
        }
    }

    /// Flattens the result into stream-entry fields.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let (status, data, error) = match &self.outcome {
            Outcome::Success(data) => ("success", data.to_string(), String::new()),
            Outcome::Error(message) => ("error", "{}".to_string(), message.clone()),
        };

        vec![
            (CORRELATION_ID_FIELD.to_string(), self.correlation_id.clone()),
            (STATUS_FIELD.to_string(), status.to_string()),
            (DATA_FIELD.to_string(), data),
            (ERROR_FIELD.to_string(), error),
            (TIMESTAMP_FIELD.to_string(), self.timestamp_ms.to_string()),
        ]
    }

    /// Parses a result out of stream-entry fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let Some(correlation_id) = fields.get(CORRELATION_ID_FIELD).cloned() else {
            return Err(DecodeError::MissingField {
                field: CORRELATION_ID_FIELD,
                correlation_id: None,
            });
        };

        let Some(status) = fields.get(STATUS_FIELD) else {
            return Err(DecodeError::MissingField {
                field: STATUS_FIELD,
                correlation_id: Some(correlation_id),
            });
        };

        let outcome = match status.as_str() {
            "success" => {
                let data = match fields.get(DATA_FIELD).filter(|d| !d.is_empty()) {
                    None => Value::Object(Map::new()),
                    Some(raw) => match serde_json::from_str(raw) {
                        Ok(value) => value,
                        Err(err) => {
                            return Err(DecodeError::InvalidField {
                                field: DATA_FIELD,
                                message: err.to_string(),
                                correlation_id: Some(correlation_id),
                            });
                        }
                    },
                };
                Outcome::Success(data)
            }
            "error" => Outcome::Error(fields.get(ERROR_FIELD).cloned().unwrap_or_default()),
            other => {
                return Err(DecodeError::InvalidField {
                    field: STATUS_FIELD,
                    message: format!("unknown status `{other}`"),
                    correlation_id: Some(correlation_id),
                });
            }
        };

        let timestamp_ms = fields
            .get(TIMESTAMP_FIELD)
            .and_then(|t| t.parse().ok())
            .unwrap_or_default();

        Ok(Self {
            correlation_id,
            outcome,
            timestamp_ms,
        })
    }
}

/// A message that failed to parse. Preserves any correlation id that could
/// be recovered so the worker can still answer the producer.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A required field is absent.
    #[error("missing field `{field}`")]
    MissingField {
        /// The absent field.
        field: &'static str,
        /// Correlation id recovered before the failure, if any.
        correlation_id: Option<String>,
    },

    /// A field is present but unusable.
    #[error("invalid field `{field}`: {message}")]
    InvalidField {
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
        /// Correlation id recovered before the failure, if any.
        correlation_id: Option<String>,
    },

    /// The request tag is outside the supported set.
    #[error("{source}")]
    UnknownKind {
        /// The rejected tag.
        #[source]
        source: UnknownKind,
        /// Correlation id recovered before the failure, if any.
        correlation_id: Option<String>,
    },
}

impl DecodeError {
    /// The correlation id recovered from the malformed message, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::MissingField { correlation_id, .. }
            | Self::InvalidField { correlation_id, .. }
            | Self::UnknownKind { correlation_id, .. } => correlation_id.as_deref(),
        }
    }
}

/// The entry appended to materialize an absent stream.
#[must_use]
pub fn placeholder_fields() -> Vec<(String, String)> {
    vec![
        (INIT_FIELD.to_string(), "stream_created".to_string()),
        (TIMESTAMP_FIELD.to_string(), now_ms().to_string()),
    ]
}

/// Whether the fields belong to a placeholder entry rather than a message.
#[must_use]
pub fn is_placeholder(fields: &HashMap<String, String>) -> bool {
    fields.contains_key(INIT_FIELD) && !fields.contains_key(CORRELATION_ID_FIELD)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn fields_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn request_round_trips_through_fields() {
        let mut parameters = Map::new();
        parameters.insert("customer_name".to_string(), json!("Kim"));

        let request = DataRequest::new(RequestKind::CustomerSearch, 7, parameters);
        let decoded = DataRequest::from_fields(&fields_map(request.to_fields())).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn request_without_parameters_decodes_to_empty_map() {
        let fields = fields_map(vec![
            ("correlation_id".to_string(), "abc".to_string()),
            ("request_type".to_string(), "today_reservations".to_string()),
            ("shop_id".to_string(), "3".to_string()),
        ]);

        let decoded = DataRequest::from_fields(&fields).unwrap();
        assert_eq!(decoded.kind, RequestKind::TodayReservations);
        assert!(decoded.parameters.is_empty());
        assert_eq!(decoded.timestamp_ms, 0);
    }

    #[test]
    fn request_missing_correlation_id_recovers_nothing() {
        let fields = fields_map(vec![(
            "request_type".to_string(),
            "customer_search".to_string(),
        )]);

        let err = DataRequest::from_fields(&fields).unwrap_err();
        assert!(err.correlation_id().is_none());
    }

    #[test]
    fn request_missing_type_recovers_correlation_id() {
        let fields = fields_map(vec![("correlation_id".to_string(), "abc".to_string())]);

        let err = DataRequest::from_fields(&fields).unwrap_err();
        assert_eq!(err.correlation_id(), Some("abc"));
    }

    #[test]
    fn unknown_tag_is_rejected_with_correlation_id() {
        let fields = fields_map(vec![
            ("correlation_id".to_string(), "abc".to_string()),
            ("request_type".to_string(), "mystery".to_string()),
            ("shop_id".to_string(), "1".to_string()),
        ]);

        let err = DataRequest::from_fields(&fields).unwrap_err();
        assert_eq!(err.correlation_id(), Some("abc"));
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn bad_shop_id_is_invalid() {
        let fields = fields_map(vec![
            ("correlation_id".to_string(), "abc".to_string()),
            ("request_type".to_string(), "memo_update".to_string()),
            ("shop_id".to_string(), "soon".to_string()),
        ]);

        let err = DataRequest::from_fields(&fields).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidField {
                field: "shop_id",
                ..
            }
        ));
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            RequestKind::CustomerSearch,
            RequestKind::CustomerDetail,
            RequestKind::VisitHistory,
            RequestKind::TodayReservations,
            RequestKind::MemoUpdate,
            RequestKind::CustomerMessage,
        ] {
            assert_eq!(kind.as_str().parse::<RequestKind>().unwrap(), kind);
        }

        assert!("anything_else".parse::<RequestKind>().is_err());
    }

    #[test]
    fn success_result_round_trips() {
        let result = DataResult::success("abc".to_string(), json!([{"id": 1}]));
        let decoded = DataResult::from_fields(&fields_map(result.to_fields())).unwrap();

        assert_eq!(decoded, result);
    }

    #[test]
    fn error_result_round_trips() {
        let result = DataResult::error("abc".to_string(), "boom".to_string());
        let fields = fields_map(result.to_fields());

        assert_eq!(fields.get("data").map(String::as_str), Some("{}"));

        let decoded = DataResult::from_fields(&fields).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let fields = fields_map(vec![
            ("correlation_id".to_string(), "abc".to_string()),
            ("status".to_string(), "not_quite".to_string()),
        ]);

        let err = DataResult::from_fields(&fields).unwrap_err();
        assert_eq!(err.correlation_id(), Some("abc"));
    }

    #[test]
    fn placeholder_entries_are_recognized() {
        assert!(is_placeholder(&fields_map(placeholder_fields())));

        let request = DataRequest::new(RequestKind::CustomerSearch, 1, Map::new());
        assert!(!is_placeholder(&fields_map(request.to_fields())));
    }
}
