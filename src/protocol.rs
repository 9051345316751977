// MIT License - Copyright (c) 2026 Peter Wright
// Protocol message model and the compiled message catalog

use std::collections::{HashMap, HashSet};
use std::fmt;

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::MessageDef;
use crate::constants::SEQUENCE_PARAM;
use crate::error::{BridgeError, FrameError, Result};

/// Role of a message in the request/response exchange.
///
/// - `Command`: sent to the panel, answered by one response.
/// - `Response`: the panel's answer to the single in-flight command.
/// - `Event`: unsolicited panel message (zone change, arming state, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    Command,
    Response,
    Event,
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageClass::Command => "command",
            MessageClass::Response => "response",
            MessageClass::Event => "event",
        })
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// One decoded or to-be-encoded panel message.
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    pub class: MessageClass,
    pub kind: String,
    /// Parameters in wire order.
    pub params: Vec<(String, Value)>,
    /// Frame bytes as received (empty for locally built messages).
    pub raw: Bytes,
    pub correlation: Option<u32>,
}

impl PartialEq for ProtocolMessage {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class
            && self.kind == other.kind
            && self.params == other.params
            && self.correlation == other.correlation
    }
}

impl ProtocolMessage {
    pub fn new(class: MessageClass, kind: impl Into<String>) -> Self {
        Self {
            class,
            kind: kind.into(),
            params: Vec::new(),
            raw: Bytes::new(),
            correlation: None,
        }
    }

    pub fn command(kind: impl Into<String>) -> Self {
        Self::new(MessageClass::Command, kind)
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_correlation(mut self, id: u32) -> Self {
        self.correlation = Some(id);
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

// ---------------------------------------------------------------------------
// Parameter types
// ---------------------------------------------------------------------------

/// Wire type of a format placeholder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamType {
    /// Decimal integer with optional inclusive bounds.
    Int {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    /// Boolean written as one of two literals.
    Bool {
        #[serde(rename = "true", default = "default_true_literal")]
        on: String,
        #[serde(rename = "false", default = "default_false_literal")]
        off: String,
    },
    /// One of a fixed set of tokens.
    Enum { values: Vec<String> },
    /// A single whitespace-free token.
    #[default]
    Text,
    /// Remainder of the line. Only valid as the final placeholder.
    Rest,
}

fn default_true_literal() -> String {
    "1".to_string()
}
fn default_false_literal() -> String {
    "0".to_string()
}

impl ParamType {
    /// Regular expression fragment recognising the wire form.
    fn pattern(&self) -> String {
        match self {
            ParamType::Int { .. } => r"-?\d+".to_string(),
            ParamType::Bool { on, off } => {
                format!("{}|{}", regex::escape(on), regex::escape(off))
            }
            ParamType::Enum { values } => values
                .iter()
                .map(|v| regex::escape(v))
                .collect::<Vec<_>>()
                .join("|"),
            ParamType::Text => r"\S+".to_string(),
            ParamType::Rest => ".*".to_string(),
        }
    }

    /// Parse a wire token captured by [`pattern`](Self::pattern).
    fn parse(&self, raw: &str) -> std::result::Result<Value, String> {
        match self {
            ParamType::Int { min, max } => {
                let v: i64 = raw.parse().map_err(|_| format!("'{raw}' is not an integer"))?;
                check_range(v, *min, *max)?;
                Ok(Value::Int(v))
            }
            ParamType::Bool { on, .. } => Ok(Value::Bool(raw == on)),
            ParamType::Enum { values } => {
                if values.iter().any(|v| v == raw) {
                    Ok(Value::Text(raw.to_string()))
                } else {
                    Err(format!("'{raw}' is not one of {values:?}"))
                }
            }
            ParamType::Text | ParamType::Rest => Ok(Value::Text(raw.to_string())),
        }
    }

    /// Convert a string produced by a mapping template into a typed value.
    pub fn coerce(&self, raw: &str) -> std::result::Result<Value, String> {
        match self {
            ParamType::Int { .. } => raw
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("'{raw}' is not an integer")),
            ParamType::Bool { on, off } => match raw.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                s if s == on => Ok(Value::Bool(true)),
                s if s == off => Ok(Value::Bool(false)),
                s => Err(format!("'{s}' is not a boolean")),
            },
            ParamType::Enum { .. } | ParamType::Text | ParamType::Rest => {
                Ok(Value::Text(raw.to_string()))
            }
        }
    }

    /// Produce the wire token for `value`, enforcing the type's constraints.
    fn render(&self, value: &Value) -> std::result::Result<String, String> {
        match (self, value) {
            (ParamType::Int { min, max }, Value::Int(v)) => {
                check_range(*v, *min, *max)?;
                Ok(v.to_string())
            }
            (ParamType::Bool { on, off }, Value::Bool(b)) => {
                Ok(if *b { on.clone() } else { off.clone() })
            }
            (ParamType::Enum { values }, Value::Text(s)) => {
                if values.contains(s) {
                    Ok(s.clone())
                } else {
                    Err(format!("'{s}' is not one of {values:?}"))
                }
            }
            (ParamType::Text, Value::Text(s)) => {
                if s.is_empty() || s.chars().any(char::is_whitespace) {
                    Err(format!("'{s}' must be a single non-empty token"))
                } else {
                    Ok(s.clone())
                }
            }
            (ParamType::Rest, v) => {
                let s = v.to_string();
                if s.contains(['\r', '\n']) {
                    Err("value contains a line break".to_string())
                } else {
                    Ok(s)
                }
            }
            (ty, v) => Err(format!("{v:?} does not fit {}", ty.name())),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ParamType::Int { .. } => "int",
            ParamType::Bool { .. } => "bool",
            ParamType::Enum { .. } => "enum",
            ParamType::Text => "text",
            ParamType::Rest => "rest",
        }
    }
}

fn check_range(v: i64, min: Option<i64>, max: Option<i64>) -> std::result::Result<(), String> {
    if let Some(min) = min
        && v < min
    {
        return Err(format!("{v} is below minimum {min}"));
    }
    if let Some(max) = max
        && v > max
    {
        return Err(format!("{v} is above maximum {max}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Message specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(usize),
    Sequence,
}

/// A catalog entry compiled from its format string.
#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub kind: String,
    pub class: MessageClass,
    /// Kinds that complete this command.
    pub responses: Vec<String>,
    params: Vec<(String, ParamType)>,
    segments: Vec<Segment>,
    regex: Regex,
}

impl MessageSpec {
    pub fn compile(def: &MessageDef) -> Result<Self> {
        let kind = def.kind.clone();
        if def.params.contains_key(SEQUENCE_PARAM) {
            return Err(BridgeError::config(format!(
                "{kind}: '{SEQUENCE_PARAM}' is reserved for the correlation id"
            )));
        }

        let mut segments = Vec::new();
        let mut params: Vec<(String, ParamType)> = Vec::new();
        let mut literal = String::new();
        let mut chars = def.format.chars();
        while let Some(c) = chars.next() {
            if c != '{' {
                if c == '}' {
                    return Err(BridgeError::config(format!("{kind}: unmatched '}}' in format")));
                }
                literal.push(c);
                continue;
            }
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(ch) => name.push(ch),
                    None => {
                        return Err(BridgeError::config(format!(
                            "{kind}: unterminated placeholder in format"
                        )));
                    }
                }
            }
            if !is_identifier(&name) {
                return Err(BridgeError::config(format!(
                    "{kind}: invalid placeholder name '{name}'"
                )));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            if name == SEQUENCE_PARAM {
                if segments.iter().any(|s| matches!(s, Segment::Sequence)) {
                    return Err(BridgeError::config(format!("{kind}: duplicate {{seq}}")));
                }
                segments.push(Segment::Sequence);
                continue;
            }
            if params.iter().any(|(n, _)| *n == name) {
                return Err(BridgeError::config(format!(
                    "{kind}: duplicate placeholder '{name}'"
                )));
            }
            let ty = def.params.get(&name).cloned().unwrap_or_default();
            params.push((name, ty));
            segments.push(Segment::Param(params.len() - 1));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        for name in def.params.keys() {
            if !params.iter().any(|(n, _)| n == name) {
                return Err(BridgeError::config(format!(
                    "{kind}: parameter '{name}' does not appear in format"
                )));
            }
        }
        let rest_count = params.iter().filter(|(_, t)| *t == ParamType::Rest).count();
        let rest_last = matches!(
            segments.last(),
            Some(Segment::Param(i)) if params[*i].1 == ParamType::Rest
        );
        if rest_count > 1 || (rest_count == 1 && !rest_last) {
            return Err(BridgeError::config(format!(
                "{kind}: rest parameter must be the final placeholder"
            )));
        }
        if def.class != MessageClass::Command && !def.responses.is_empty() {
            return Err(BridgeError::config(format!(
                "{kind}: only commands may list responses"
            )));
        }

        let mut pattern = String::from("^");
        for segment in &segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Param(i) => {
                    let (name, ty) = &params[*i];
                    pattern.push_str(&format!("(?P<{name}>{})", ty.pattern()));
                }
                Segment::Sequence => {
                    pattern.push_str(&format!(r"(?P<{SEQUENCE_PARAM}>\d+)"));
                }
            }
        }
        pattern.push('$');
        let regex = Regex::new(&pattern)
            .map_err(|e| BridgeError::config(format!("{kind}: format does not compile: {e}")))?;

        Ok(Self {
            kind,
            class: def.class,
            responses: def.responses.clone(),
            params,
            segments,
            regex,
        })
    }

    /// Parameter names and types in wire order (excluding `{seq}`).
    pub fn params(&self) -> &[(String, ParamType)] {
        &self.params
    }

    pub fn param_type(&self, name: &str) -> Option<&ParamType> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Try to parse a frame body. `None` when the body has a different shape.
    pub fn parse(&self, body: &str) -> Option<std::result::Result<ProtocolMessage, FrameError>> {
        let caps = self.regex.captures(body)?;
        let mut msg = ProtocolMessage::new(self.class, self.kind.clone());
        for (name, ty) in &self.params {
            let raw = caps.name(name).map(|m| m.as_str()).unwrap_or_default();
            match ty.parse(raw) {
                Ok(value) => msg.params.push((name.clone(), value)),
                Err(reason) => return Some(Err(self.invalid(name, reason))),
            }
        }
        if let Some(seq) = caps.name(SEQUENCE_PARAM) {
            match seq.as_str().parse::<u32>() {
                Ok(id) => msg.correlation = Some(id),
                Err(_) => {
                    return Some(Err(self.invalid(SEQUENCE_PARAM, "out of range".to_string())));
                }
            }
        }
        Some(Ok(msg))
    }

    /// Render the frame body for `msg`.
    pub fn render(&self, msg: &ProtocolMessage) -> Result<String> {
        if let Some((name, _)) = msg
            .params
            .iter()
            .find(|(name, _)| self.param_type(name).is_none())
        {
            return Err(BridgeError::payload(
                &self.kind,
                format!("unknown parameter '{name}'"),
            ));
        }
        let mut body = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => body.push_str(text),
                Segment::Param(i) => {
                    let (name, ty) = &self.params[*i];
                    let value = msg.param(name).ok_or_else(|| {
                        BridgeError::payload(&self.kind, format!("missing parameter '{name}'"))
                    })?;
                    let token = ty
                        .render(value)
                        .map_err(|reason| BridgeError::payload(&self.kind, format!("{name}: {reason}")))?;
                    body.push_str(&token);
                }
                Segment::Sequence => {
                    let id = msg.correlation.ok_or_else(|| {
                        BridgeError::payload(&self.kind, "no correlation id for {seq}")
                    })?;
                    body.push_str(&id.to_string());
                }
            }
        }
        // A value that swallows the next literal would not decode back to itself.
        if !self.regex.is_match(&body) {
            return Err(BridgeError::payload(
                &self.kind,
                format!("rendered body {body:?} does not match its own format"),
            ));
        }
        Ok(body)
    }

    fn invalid(&self, param: &str, reason: String) -> FrameError {
        FrameError::InvalidParameter {
            kind: self.kind.clone(),
            param: param.to_string(),
            reason,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The configured set of message kinds, tried in declaration order.
#[derive(Debug, Clone)]
pub struct Catalog {
    specs: Vec<MessageSpec>,
    by_kind: HashMap<String, usize>,
}

impl Catalog {
    pub fn compile(defs: &[MessageDef]) -> Result<Self> {
        let mut specs = Vec::with_capacity(defs.len());
        let mut by_kind = HashMap::new();
        for def in defs {
            if by_kind.insert(def.kind.clone(), specs.len()).is_some() {
                return Err(BridgeError::config(format!(
                    "message kind '{}' is defined twice",
                    def.kind
                )));
            }
            specs.push(MessageSpec::compile(def)?);
        }

        let known: HashSet<&str> = specs.iter().map(|s| s.kind.as_str()).collect();
        for spec in &specs {
            for response in &spec.responses {
                if !known.contains(response.as_str()) {
                    return Err(BridgeError::config(format!(
                        "{}: unknown response kind '{response}'",
                        spec.kind
                    )));
                }
                let target = &specs[by_kind[response]];
                if target.class == MessageClass::Command {
                    return Err(BridgeError::config(format!(
                        "{}: response kind '{response}' is a command",
                        spec.kind
                    )));
                }
            }
        }
        Ok(Self { specs, by_kind })
    }

    pub fn get(&self, kind: &str) -> Option<&MessageSpec> {
        self.by_kind.get(kind).map(|&i| &self.specs[i])
    }

    pub fn specs(&self) -> impl Iterator<Item = &MessageSpec> {
        self.specs.iter()
    }

    /// Parse a frame body against the catalog; the first matching spec wins.
    pub fn parse_body(&self, body: &str) -> std::result::Result<ProtocolMessage, FrameError> {
        self.specs
            .iter()
            .find_map(|spec| spec.parse(body))
            .unwrap_or_else(|| {
                Err(FrameError::Unrecognized {
                    body: body.to_string(),
                })
            })
    }
}
