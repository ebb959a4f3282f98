//! The log's view of a task: typed record, partial updates, and the
//! field codec used on the batch protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::hasher;

pub const FIELD_KEY_HASH: &str = "key_hash";
pub const FIELD_NAMESPACE: &str = "namespace";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_START_TIME: &str = "start_time";
pub const FIELD_END_TIME: &str = "end_time";
pub const FIELD_KEY_DATA: &str = "key_data";
pub const FIELD_USER_DATA: &str = "user_data";
pub const FIELD_LOG: &str = "log";
/// Maintained by the log itself; never written by sak.
pub const FIELD_LAST_CHANGED: &str = "lastchanged";

/// Fields sak reads and writes, in wire order.
pub const RECORD_FIELDS: [&str; 8] = [
    FIELD_KEY_HASH,
    FIELD_NAMESPACE,
    FIELD_STATUS,
    FIELD_START_TIME,
    FIELD_END_TIME,
    FIELD_KEY_DATA,
    FIELD_USER_DATA,
    FIELD_LOG,
];

/// Field name -> single-element value list, as carried by the protocol.
pub type FieldMap = BTreeMap<String, Vec<String>>;

/// Persisted task states. `Running` is never written: a task is running
/// exactly while its lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Aborted,
    Fail,
    Success,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Aborted => "ABORTED",
            TaskStatus::Fail => "FAIL",
            TaskStatus::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "ABORTED" => Ok(TaskStatus::Aborted),
            "FAIL" => Ok(TaskStatus::Fail),
            "SUCCESS" => Ok(TaskStatus::Success),
            other => Err(Error::InvalidArgument(format!("unknown task status '{other}'"))),
        }
    }
}

/// Full field set of one key, decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskRecord {
    pub fingerprint: Option<String>,
    pub namespace: Option<String>,
    pub status: Option<TaskStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub key_data: Option<Map<String, Value>>,
    pub user_data: Option<Map<String, Value>>,
    pub log_text: Option<String>,
    /// Revision marker the log attaches to the latest change.
    pub last_changed: Option<String>,
}

impl TaskRecord {
    /// Decode a protocol field map. Unknown fields are ignored.
    pub fn from_fields(fingerprint: &str, fields: &FieldMap) -> Result<Self> {
        let bad = |field: &str, err: &dyn fmt::Display| {
            Error::corrupt(fingerprint, format!("field '{field}': {err}"))
        };

        let mut record = TaskRecord::default();

        if let Some(raw) = first(fields, FIELD_KEY_HASH) {
            record.fingerprint = decode_json(raw).map_err(|e| bad(FIELD_KEY_HASH, &e))?;
        }
        if let Some(raw) = first(fields, FIELD_NAMESPACE) {
            record.namespace = decode_json(raw).map_err(|e| bad(FIELD_NAMESPACE, &e))?;
        }
        if let Some(raw) = first(fields, FIELD_STATUS) {
            let name: Option<String> = decode_json(raw).map_err(|e| bad(FIELD_STATUS, &e))?;
            record.status = match name {
                Some(name) => Some(name.parse().map_err(|e| bad(FIELD_STATUS, &e))?),
                None => None,
            };
        }
        if let Some(raw) = first(fields, FIELD_START_TIME) {
            record.start_time = Some(parse_time(raw).map_err(|e| bad(FIELD_START_TIME, &e))?);
        }
        if let Some(raw) = first(fields, FIELD_END_TIME) {
            record.end_time = Some(parse_time(raw).map_err(|e| bad(FIELD_END_TIME, &e))?);
        }
        if let Some(raw) = first(fields, FIELD_KEY_DATA) {
            record.key_data = decode_json(raw).map_err(|e| bad(FIELD_KEY_DATA, &e))?;
        }
        if let Some(raw) = first(fields, FIELD_USER_DATA) {
            record.user_data = decode_json(raw).map_err(|e| bad(FIELD_USER_DATA, &e))?;
        }
        if let Some(raw) = first(fields, FIELD_LOG) {
            record.log_text = decode_json(raw).map_err(|e| bad(FIELD_LOG, &e))?;
        }
        record.last_changed = first(fields, FIELD_LAST_CHANGED).map(str::to_string);

        Ok(record)
    }

    /// No sak field is set: the key was never written, or was removed.
    pub fn is_empty(&self) -> bool {
        self.fingerprint.is_none()
            && self.namespace.is_none()
            && self.status.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.key_data.is_none()
            && self.user_data.is_none()
            && self.log_text.is_none()
    }

    /// Status with the implicit default for records that never set one.
    pub fn effective_status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Pending)
    }

    /// Per-field change-detection digests. Absent fields have no digest.
    pub fn field_digests(&self) -> Result<BTreeMap<&'static str, String>> {
        let mut digests = BTreeMap::new();
        for (name, value) in self.field_values() {
            if let Some(value) = value {
                digests.insert(name, hasher::content_digest(&value)?);
            }
        }
        Ok(digests)
    }

    fn field_values(&self) -> [(&'static str, Option<Value>); 8] {
        [
            (FIELD_KEY_HASH, self.fingerprint.clone().map(Value::String)),
            (FIELD_NAMESPACE, self.namespace.clone().map(Value::String)),
            (
                FIELD_STATUS,
                self.status.map(|status| Value::String(status.as_str().to_string())),
            ),
            (FIELD_START_TIME, self.start_time.map(|t| Value::String(format_time(&t)))),
            (FIELD_END_TIME, self.end_time.map(|t| Value::String(format_time(&t)))),
            (FIELD_KEY_DATA, self.key_data.clone().map(Value::Object)),
            (FIELD_USER_DATA, self.user_data.clone().map(Value::Object)),
            (FIELD_LOG, self.log_text.clone().map(Value::String)),
        ]
    }
}

/// A partial write: only `Some` fields are sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub fingerprint: Option<String>,
    pub namespace: Option<String>,
    pub status: Option<TaskStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub key_data: Option<Map<String, Value>>,
    pub user_data: Option<Map<String, Value>>,
    pub log_text: Option<String>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprint(mut self, value: impl Into<String>) -> Self {
        self.fingerprint = Some(value.into());
        self
    }

    pub fn namespace(mut self, value: impl Into<String>) -> Self {
        self.namespace = Some(value.into());
        self
    }

    pub fn status(mut self, value: TaskStatus) -> Self {
        self.status = Some(value);
        self
    }

    pub fn start_time(mut self, value: DateTime<Utc>) -> Self {
        self.start_time = Some(value);
        self
    }

    pub fn end_time(mut self, value: DateTime<Utc>) -> Self {
        self.end_time = Some(value);
        self
    }

    pub fn key_data(mut self, value: Map<String, Value>) -> Self {
        self.key_data = Some(value);
        self
    }

    pub fn user_data(mut self, value: Map<String, Value>) -> Self {
        self.user_data = Some(value);
        self
    }

    pub fn log_text(mut self, value: impl Into<String>) -> Self {
        self.log_text = Some(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.to_fields().map(|f| f.is_empty()).unwrap_or(true)
    }

    /// Encode into protocol fields. Structured values are JSON strings,
    /// timestamps are bare ISO-8601.
    pub fn to_fields(&self) -> Result<FieldMap> {
        let mut fields = FieldMap::new();
        let mut put = |name: &str, raw: String| {
            fields.insert(name.to_string(), vec![raw]);
        };

        if let Some(value) = &self.fingerprint {
            put(FIELD_KEY_HASH, serde_json::to_string(value)?);
        }
        if let Some(value) = &self.namespace {
            put(FIELD_NAMESPACE, serde_json::to_string(value)?);
        }
        if let Some(value) = &self.status {
            put(FIELD_STATUS, serde_json::to_string(value.as_str())?);
        }
        if let Some(value) = &self.start_time {
            put(FIELD_START_TIME, format_time(value));
        }
        if let Some(value) = &self.end_time {
            put(FIELD_END_TIME, format_time(value));
        }
        if let Some(value) = &self.key_data {
            put(FIELD_KEY_DATA, encode_object(value));
        }
        if let Some(value) = &self.user_data {
            put(FIELD_USER_DATA, encode_object(value));
        }
        if let Some(value) = &self.log_text {
            put(FIELD_LOG, serde_json::to_string(value)?);
        }

        Ok(fields)
    }
}

fn encode_object(map: &Map<String, Value>) -> String {
    String::from_utf8(hasher::canonical_bytes(&Value::Object(map.clone()))).unwrap_or_default()
}

fn first<'a>(fields: &'a FieldMap, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> serde_json::Result<Option<T>> {
    serde_json::from_str::<Option<T>>(raw)
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an ISO-8601 timestamp; values without an offset are taken as UTC.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| Error::InvalidArgument(format!("invalid timestamp '{raw}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn update_encodes_wire_shapes() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let update = RecordUpdate::new()
            .status(TaskStatus::Success)
            .start_time(start)
            .log_text("hi\n");
        let fields = update.to_fields().unwrap();

        assert_eq!(fields[FIELD_STATUS], vec!["\"SUCCESS\"".to_string()]);
        assert_eq!(
            fields[FIELD_START_TIME],
            vec!["2024-01-02T03:04:05.000000000Z".to_string()]
        );
        assert_eq!(fields[FIELD_LOG], vec!["\"hi\\n\"".to_string()]);
        assert!(!fields.contains_key(FIELD_KEY_DATA));
    }

    #[test]
    fn record_round_trips_through_fields() {
        let key_data = json!({"b": "x", "a": 1}).as_object().cloned().unwrap();
        let update = RecordUpdate::new()
            .fingerprint("abc")
            .namespace("resize")
            .key_data(key_data.clone())
            .status(TaskStatus::Fail);
        let mut fields = update.to_fields().unwrap();
        fields.insert(FIELD_LAST_CHANGED.to_string(), vec!["2024-01-01@00-00-00".into()]);

        let record = TaskRecord::from_fields("abc", &fields).unwrap();
        assert_eq!(record.fingerprint.as_deref(), Some("abc"));
        assert_eq!(record.namespace.as_deref(), Some("resize"));
        assert_eq!(record.key_data, Some(key_data));
        assert_eq!(record.status, Some(TaskStatus::Fail));
        assert_eq!(record.last_changed.as_deref(), Some("2024-01-01@00-00-00"));
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let parsed = parse_time("2023-05-06T07:08:09.123456").unwrap();
        assert_eq!(format_time(&parsed), "2023-05-06T07:08:09.123456000Z");
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let mut fields = FieldMap::new();
        fields.insert(FIELD_STATUS.to_string(), vec!["\"RUNNING\"".to_string()]);
        let err = TaskRecord::from_fields("abc", &fields).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
    }

    #[test]
    fn equal_values_produce_equal_digests() {
        let a = TaskRecord {
            user_data: json!({"x": 1, "y": [1, 2]}).as_object().cloned(),
            ..TaskRecord::default()
        };
        let b = TaskRecord {
            user_data: json!({"y": [1, 2], "x": 1}).as_object().cloned(),
            ..TaskRecord::default()
        };
        assert_eq!(a.field_digests().unwrap(), b.field_digests().unwrap());
        assert!(TaskRecord::default().field_digests().unwrap().is_empty());
    }
}
