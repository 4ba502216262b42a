//! Named structured logger.
//!
//! A [`Logger`] is bound to a service name at construction and emits one
//! `tracing` event per call. The event carries the service, the message and a
//! JSON-encoded context map; the process-wide subscriber (see
//! [`crate::tracing::init`]) adds timestamp and level.
//!
//! Logging never fails: context values are sanitised so the JSON encoding is
//! always representable by downstream consumers, and emission cannot panic.

use std::sync::Arc;

use serde_json::{Map, Value};

/// Largest integer a JSON consumer using IEEE-754 doubles can hold exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Log severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name (case-insensitive). `warning` is accepted for `warn`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Level from `LOG_LEVEL`, defaulting to `Info` when unset or invalid.
    pub fn from_env() -> Self {
        std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(Self::Info)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// Context map attached to a log record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogContext(Map<String, Value>);

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sanitised JSON object.
    pub fn into_value(self) -> Value {
        sanitize(Value::Object(self.0))
    }
}

impl From<()> for LogContext {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<Map<String, Value>> for LogContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Value> for LogContext {
    /// Objects are used as-is; `null` is empty; anything else is kept under `value`.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::default(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self(map)
            }
        }
    }
}

/// Error folded into an `error` record's context.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetail {
    /// A structured error: display message, short type name, source chain.
    Structured {
        message: String,
        name: Option<String>,
        chain: Vec<String>,
    },
    /// A plain message.
    Message(String),
}

impl ErrorDetail {
    /// Capture a `std::error::Error`, walking its `source()` chain.
    pub fn of<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(s) = source {
            chain.push(s.to_string());
            source = s.source();
        }

        Self::Structured {
            message: err.to_string(),
            name: short_type_name(std::any::type_name::<E>()),
            chain,
        }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    fn into_value(self) -> Value {
        match self {
            Self::Structured {
                message,
                name,
                chain,
            } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message));
                if let Some(name) = name {
                    map.insert("name".to_string(), Value::String(name));
                }
                map.insert(
                    "chain".to_string(),
                    Value::Array(chain.into_iter().map(Value::String).collect()),
                );
                Value::Object(map)
            }
            Self::Message(msg) => Value::String(msg),
        }
    }
}

// Trait objects carry no useful name; concrete types keep the last path segment.
fn short_type_name(full: &str) -> Option<String> {
    if full.starts_with("dyn ") || full.starts_with('&') {
        return None;
    }
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().map(str::to_string)
}

/// Coerce values that would lose precision in a double-based JSON consumer.
///
/// Integers beyond ±(2^53 − 1) become decimal strings; arrays and objects are
/// walked recursively. serde_json already maps non-finite floats to `null`.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.unsigned_abs() > MAX_SAFE_INTEGER {
                    return Value::String(i.to_string());
                }
            } else if let Some(u) = n.as_u64() {
                if u > MAX_SAFE_INTEGER {
                    return Value::String(u.to_string());
                }
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, sanitize(v))).collect()),
        other => other,
    }
}

/// Process-wide, named, leveled logging sink.
#[derive(Debug, Clone)]
pub struct Logger {
    service: Arc<str>,
    min_level: LogLevel,
}

impl Logger {
    /// Logger for `service`, with the minimum level taken from `LOG_LEVEL`.
    pub fn new(service: impl AsRef<str>) -> Self {
        Self {
            service: Arc::from(service.as_ref()),
            min_level: LogLevel::from_env(),
        }
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    pub fn debug(&self, message: &str, context: impl Into<LogContext>) {
        self.log(LogLevel::Debug, message, context.into());
    }

    pub fn info(&self, message: &str, context: impl Into<LogContext>) {
        self.log(LogLevel::Info, message, context.into());
    }

    pub fn warn(&self, message: &str, context: impl Into<LogContext>) {
        self.log(LogLevel::Warn, message, context.into());
    }

    /// Error record; `error`, when present, lands in the context under `error`.
    pub fn error(
        &self,
        message: &str,
        error: impl Into<Option<ErrorDetail>>,
        context: impl Into<LogContext>,
    ) {
        if !self.enabled(LogLevel::Error) {
            return;
        }
        let mut context = context.into();
        if let Some(detail) = error.into() {
            context.insert("error", detail.into_value());
        }
        self.emit(LogLevel::Error, message, context);
    }

    fn log(&self, level: LogLevel, message: &str, context: LogContext) {
        if self.enabled(level) {
            self.emit(level, message, context);
        }
    }

    fn emit(&self, level: LogLevel, message: &str, context: LogContext) {
        let service = &*self.service;
        let context = context.into_value().to_string();

        match level {
            LogLevel::Debug => ::tracing::debug!(service, context = %context, "{message}"),
            LogLevel::Info => ::tracing::info!(service, context = %context, "{message}"),
            LogLevel::Warn => ::tracing::warn!(service, context = %context, "{message}"),
            LogLevel::Error => ::tracing::error!(service, context = %context, "{message}"),
        }
    }
}
