use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::broker::{BrokerResult, Error};

/// Header and argument tables share the option map representation.
pub type Table = Map<String, Value>;

/// Open-ended, per-call option map such as `{"durable": true}`.
///
/// Keys the broker does not know are ignored. Known keys holding a value of
/// the wrong type fail with [`Error::OptionTypeMismatch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(Table);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_table(&self) -> &Table {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Absent flags read as `false`.
    pub fn flag(&self, key: &str) -> BrokerResult<bool> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(mismatch(key, "a boolean")),
        }
    }

    pub fn string(&self, key: &str) -> BrokerResult<Option<&str>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(mismatch(key, "a string")),
        }
    }

    pub fn u8(&self, key: &str) -> BrokerResult<Option<u8>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| mismatch(key, "an integer in 0..=255")),
            Some(_) => Err(mismatch(key, "an integer in 0..=255")),
        }
    }

    pub fn table(&self, key: &str) -> BrokerResult<Option<&Table>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(t)) => Ok(Some(t)),
            Some(_) => Err(mismatch(key, "a table")),
        }
    }
}

impl From<Table> for Options {
    fn from(table: Table) -> Self {
        Options(table)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Options(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn mismatch(key: &str, expected: &'static str) -> Error {
    Error::OptionTypeMismatch {
        key: key.to_owned(),
        expected,
    }
}

pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Publishing properties carried from `publish` options to every delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub headers: Table,
    pub content_type: String,
    pub content_encoding: String,
    pub reply_to: String,
    pub correlation_id: String,
    pub delivery_mode: u8,
    pub priority: u8,
    pub message_id: Option<String>,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            headers: Table::new(),
            content_type: "text/plain".to_owned(),
            content_encoding: String::new(),
            reply_to: String::new(),
            correlation_id: String::new(),
            delivery_mode: DELIVERY_MODE_TRANSIENT,
            priority: 0,
            message_id: None,
        }
    }
}

impl Properties {
    pub fn from_options(opts: &Options) -> BrokerResult<Self> {
        let mut props = Properties::default();

        if let Some(headers) = opts.table("headers")? {
            props.headers = headers.clone();
        }
        if let Some(v) = opts.string("contentType")? {
            props.content_type = v.to_owned();
        }
        if let Some(v) = opts.string("contentEncoding")? {
            props.content_encoding = v.to_owned();
        }
        if let Some(v) = opts.string("replyTo")? {
            props.reply_to = v.to_owned();
        }
        if let Some(v) = opts.string("correlationId")? {
            props.correlation_id = v.to_owned();
        }
        if let Some(v) = opts.u8("deliveryMode")? {
            props.delivery_mode = v;
        }
        if let Some(v) = opts.u8("priority")? {
            props.priority = v;
        }
        props.message_id = opts.string("messageId")?.map(str::to_owned);

        Ok(props)
    }
}
