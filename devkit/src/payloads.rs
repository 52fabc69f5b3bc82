/*!
Builders for what field units publish on the LAN broker.

`heartbeat`: `{"name": ..., "timestamp": "YYYY-MM-DDTHH:MM:SS[.ffffff]", "cam_on": 0|1}`
`alerts`:    free-form JSON, usually `{"name": ..., "error": ...}`
*/

use chrono::{Duration, Local, NaiveDateTime};
use serde_json::{Map, Value};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn format_unit_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct HeartbeatBuilder {
    fields: Map<String, Value>,
}

impl HeartbeatBuilder {
    /// Heartbeat stamped with the local clock, camera on.
    pub fn new<S: Into<String>>(name: S) -> Self {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String(name.into()));
        fields.insert("timestamp".into(), Value::String(format_unit_timestamp(&Local::now().naive_local())));
        fields.insert("cam_on".into(), Value::from(1));
        Self { fields }
    }

    /// Raw timestamp text, used verbatim (also for malformed values).
    pub fn timestamp<S: Into<String>>(mut self, raw: S) -> Self {
        self.fields.insert("timestamp".into(), Value::String(raw.into()));
        self
    }

    pub fn at(self, ts: NaiveDateTime) -> Self {
        self.timestamp(format_unit_timestamp(&ts))
    }

    /// A unit whose clock runs `secs` ahead (negative: behind) of `reference`.
    pub fn skewed_by_secs(self, reference: NaiveDateTime, secs: i64) -> Self {
        self.at(reference + Duration::seconds(secs))
    }

    pub fn cam_on(mut self, on: bool) -> Self {
        self.fields.insert("cam_on".into(), Value::from(u8::from(on)));
        self
    }

    pub fn set_field<S: Into<String>>(mut self, field: S, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn without(mut self, field: &str) -> Self {
        self.fields.remove(field);
        self
    }

    pub fn build(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.build().to_string().into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct FieldAlertBuilder {
    name: String,
    error: String,
}

impl FieldAlertBuilder {
    pub fn new<S: Into<String>, E: Into<String>>(name: S, error: E) -> Self {
        Self { name: name.into(), error: error.into() }
    }

    pub fn build(&self) -> Value {
        serde_json::json!({ "name": self.name, "error": self.error })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.build().to_string().into_bytes()
    }
}
