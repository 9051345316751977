// MIT License - Copyright (c) 2026 Peter Wright
// Declarative mapping between protocol messages and MQTT topics/payloads

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::config::{
    InboundRuleDef, MappingConfig, OutboundRuleDef, PayloadFormat, PayloadTemplateDef,
    TransformDef,
};
use crate::constants::SEQUENCE_PARAM;
use crate::error::{BridgeError, Result};
use crate::protocol::{Catalog, MessageClass, MessageSpec, ProtocolMessage};

/// Names bound for every inbound message besides its parameters.
const INBOUND_BUILTINS: &[&str] = &["kind", "class", "correlation"];
/// Names bound for every outbound MQTT message besides JSON fields.
const OUTBOUND_BUILTINS: &[&str] = &["topic", "segments", "payload"];

/// A message to publish on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// A command produced from an MQTT message, with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub message: ProtocolMessage,
    /// Topic the triggering MQTT message arrived on.
    pub topic: String,
    /// Where to publish the correlated response, if anywhere.
    pub reply_to: Option<String>,
    /// Name of the rule that produced the request.
    pub rule: String,
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Var(String),
}

/// A string with `{name}` placeholders; `{a.b}` walks into objects and arrays.
/// `{{` and `}}` are literal braces.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => return Err(format!("unterminated placeholder in {text:?}")),
                        }
                    }
                    if !is_path(&name) {
                        return Err(format!("invalid placeholder '{{{name}}}' in {text:?}"));
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Var(name));
                }
                '}' => return Err(format!("unmatched '}}' in {text:?}")),
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Placeholder paths in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Var(name) => Some(name.as_str()),
            Part::Literal(_) => None,
        })
    }

    pub fn render(&self, scope: &Scope) -> std::result::Result<String, String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Var(name) => {
                    let value = scope.lookup(name).ok_or_else(|| format!("'{name}' is not bound"))?;
                    out.push_str(&to_text(value));
                }
            }
        }
        Ok(out)
    }

    /// The placeholder when the template is exactly one placeholder.
    fn single(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [Part::Var(name)] => Some(name),
            _ => None,
        }
    }
}

fn is_path(name: &str) -> bool {
    let mut segments = name.split('.');
    let head_ok = segments.next().is_some_and(|head| {
        let mut chars = head.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    head_ok
        && segments.all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

fn root(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// JSON payload template. Strings are templates; a string that is exactly one
/// placeholder keeps the bound value's JSON type.
#[derive(Debug, Clone)]
enum JsonTemplate {
    Text(Template),
    Array(Vec<JsonTemplate>),
    Object(Vec<(String, JsonTemplate)>),
    Literal(JsonValue),
}

impl JsonTemplate {
    fn compile(value: &JsonValue) -> std::result::Result<Self, String> {
        Ok(match value {
            JsonValue::String(s) => JsonTemplate::Text(Template::parse(s)?),
            JsonValue::Array(items) => JsonTemplate::Array(
                items.iter().map(Self::compile).collect::<std::result::Result<_, _>>()?,
            ),
            JsonValue::Object(fields) => JsonTemplate::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Self::compile(v)?)))
                    .collect::<std::result::Result<_, String>>()?,
            ),
            other => JsonTemplate::Literal(other.clone()),
        })
    }

    fn placeholders<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            JsonTemplate::Text(t) => out.extend(t.placeholders()),
            JsonTemplate::Array(items) => items.iter().for_each(|i| i.placeholders(out)),
            JsonTemplate::Object(fields) => fields.iter().for_each(|(_, v)| v.placeholders(out)),
            JsonTemplate::Literal(_) => {}
        }
    }

    fn render(&self, scope: &Scope) -> std::result::Result<JsonValue, String> {
        Ok(match self {
            JsonTemplate::Text(t) => match t.single() {
                Some(name) => scope
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| format!("'{name}' is not bound"))?,
                None => JsonValue::String(t.render(scope)?),
            },
            JsonTemplate::Array(items) => JsonValue::Array(
                items.iter().map(|i| i.render(scope)).collect::<std::result::Result<_, _>>()?,
            ),
            JsonTemplate::Object(fields) => {
                let mut map = Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.render(scope)?);
                }
                JsonValue::Object(map)
            }
            JsonTemplate::Literal(v) => v.clone(),
        })
    }
}

#[derive(Debug, Clone)]
enum PayloadTemplate {
    Text(Template),
    Json(JsonTemplate),
}

impl PayloadTemplate {
    fn compile(def: &PayloadTemplateDef) -> std::result::Result<Self, String> {
        match def {
            PayloadTemplateDef::Text(s) => Ok(PayloadTemplate::Text(Template::parse(s)?)),
            PayloadTemplateDef::Json(v) => Ok(PayloadTemplate::Json(JsonTemplate::compile(v)?)),
        }
    }

    fn placeholders(&self) -> Vec<&str> {
        match self {
            PayloadTemplate::Text(t) => t.placeholders().collect(),
            PayloadTemplate::Json(j) => {
                let mut out = Vec::new();
                j.placeholders(&mut out);
                out
            }
        }
    }

    fn render(&self, scope: &Scope) -> std::result::Result<String, String> {
        match self {
            PayloadTemplate::Text(t) => t.render(scope),
            PayloadTemplate::Json(j) => {
                let value = j.render(scope)?;
                serde_json::to_string(&value).map_err(|e| e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scope and transforms
// ---------------------------------------------------------------------------

/// Names bound while rendering one rule.
#[derive(Debug, Clone, Default)]
pub struct Scope(Map<String, JsonValue>);

impl Scope {
    pub fn set(&mut self, name: impl Into<String>, value: JsonValue) {
        self.0.insert(name.into(), value);
    }

    pub fn lookup(&self, path: &str) -> Option<&JsonValue> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            JsonValue::Null => None,
            v => Some(v),
        }
    }
}

fn to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Transform {
    scale: Option<f64>,
    offset: Option<f64>,
    map: BTreeMap<String, String>,
    default: Option<String>,
}

impl From<&TransformDef> for Transform {
    fn from(def: &TransformDef) -> Self {
        Self {
            scale: def.scale,
            offset: def.offset,
            map: def.map.clone(),
            default: def.default.clone(),
        }
    }
}

impl Transform {
    /// Linear scaling first, then the value map.
    fn apply(&self, value: &JsonValue) -> std::result::Result<JsonValue, String> {
        let mut value = value.clone();
        if self.scale.is_some() || self.offset.is_some() {
            let n = match &value {
                JsonValue::Number(n) => n.as_f64(),
                JsonValue::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("'{}' is not numeric", to_text(&value)))?;
            value = number(n * self.scale.unwrap_or(1.0) + self.offset.unwrap_or(0.0));
        }
        if !self.map.is_empty() || self.default.is_some() {
            let key = to_text(&value);
            value = match self.map.get(&key).or(self.default.as_ref()) {
                Some(mapped) => JsonValue::String(mapped.clone()),
                None => return Err(format!("no mapping for '{key}'")),
            };
        }
        Ok(value)
    }
}

fn number(v: f64) -> JsonValue {
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        JsonValue::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

fn compile_when(
    rule: &str,
    when: &BTreeMap<String, String>,
) -> Result<Vec<(String, Regex)>> {
    when.iter()
        .map(|(name, pattern)| {
            if !is_path(name) {
                return Err(BridgeError::config(format!(
                    "{rule}: invalid 'when' name '{name}'"
                )));
            }
            let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                BridgeError::config(format!("{rule}: 'when.{name}' does not compile: {e}"))
            })?;
            Ok((name.clone(), regex))
        })
        .collect()
}

fn when_holds(when: &[(String, Regex)], scope: &Scope) -> bool {
    when.iter().all(|(name, regex)| {
        scope
            .lookup(name)
            .is_some_and(|value| regex.is_match(&to_text(value)))
    })
}

fn template(rule: &str, field: &str, text: &str) -> Result<Template> {
    Template::parse(text).map_err(|e| BridgeError::config(format!("{rule}: {field}: {e}")))
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct InboundRule {
    name: String,
    kind: Regex,
    when: Vec<(String, Regex)>,
    topic: Template,
    payload: PayloadTemplate,
    transforms: Vec<(String, Transform)>,
    retain: bool,
}

#[derive(Debug, Clone)]
struct OutboundRule {
    name: String,
    filter: String,
    format: PayloadFormat,
    when: Vec<(String, Regex)>,
    spec: MessageSpec,
    params: Vec<(String, Template)>,
    transforms: BTreeMap<String, Transform>,
    reply_topic: Option<Template>,
}

/// The compiled, immutable rule set.
#[derive(Debug, Clone)]
pub struct MappingTable {
    vars: Map<String, JsonValue>,
    inbound: Vec<InboundRule>,
    outbound: Vec<OutboundRule>,
}

impl MappingTable {
    /// Compile all enabled rules, checking every reference against the catalog.
    pub fn compile(config: &MappingConfig, catalog: &Catalog) -> Result<Self> {
        let vars: Map<String, JsonValue> = config
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect();

        let mut inbound = Vec::new();
        for (i, def) in config.inbound.iter().enumerate() {
            let name = def.name.clone().unwrap_or_else(|| format!("inbound[{i}]"));
            if def.disabled {
                debug!("Rule {name} is disabled");
                continue;
            }
            inbound.push(compile_inbound(name, def, catalog, &vars)?);
        }

        let mut outbound = Vec::new();
        for (i, def) in config.outbound.iter().enumerate() {
            let name = def.name.clone().unwrap_or_else(|| format!("outbound[{i}]"));
            if def.disabled {
                debug!("Rule {name} is disabled");
                continue;
            }
            outbound.push(compile_outbound(name, def, catalog, &vars)?);
        }

        debug!(
            "Mapping table compiled: {} inbound, {} outbound rules",
            inbound.len(),
            outbound.len()
        );
        Ok(Self {
            vars,
            inbound,
            outbound,
        })
    }

    /// Topic filters to subscribe to, deduplicated, in rule order.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.outbound
            .iter()
            .filter(|r| seen.insert(r.filter.as_str()))
            .map(|r| r.filter.clone())
            .collect()
    }

    /// Translate an MQTT message into a command. The first rule whose topic
    /// filter and `when` constraints match, and which resolves, wins. A rule
    /// that fails does not stop later rules; its error is returned only when
    /// no rule resolves. `Ok(None)` when no rule matches at all.
    pub fn resolve_outbound(&self, topic: &str, payload: &[u8]) -> Result<Option<OutboundRequest>> {
        let mut first_error = None;
        for rule in &self.outbound {
            if !topic_matches(&rule.filter, topic) {
                continue;
            }
            let resolved = self
                .outbound_scope(rule, topic, payload)
                .and_then(|scope| {
                    if when_holds(&rule.when, &scope) {
                        rule.resolve(topic, &scope).map(Some)
                    } else {
                        Ok(None)
                    }
                });
            match resolved {
                Ok(Some(request)) => return Ok(Some(request)),
                Ok(None) => {}
                Err(e) => {
                    debug!("Rule {} does not apply to {topic}: {e}", rule.name);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(None), Err)
    }

    /// Bind the payload for one rule. Configured vars and the topic bindings
    /// are set last so JSON fields cannot shadow them.
    fn outbound_scope(&self, rule: &OutboundRule, topic: &str, payload: &[u8]) -> Result<Scope> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| BridgeError::payload(&rule.spec.kind, "payload is not UTF-8"))?
            .trim();
        let mut scope = Scope::default();
        let payload = match rule.format {
            PayloadFormat::Text => JsonValue::String(text.to_string()),
            PayloadFormat::Json => {
                let json: JsonValue = serde_json::from_str(text).map_err(|e| {
                    BridgeError::payload(&rule.spec.kind, format!("invalid JSON payload: {e}"))
                })?;
                if let JsonValue::Object(fields) = &json {
                    for (k, v) in fields {
                        scope.set(k.clone(), v.clone());
                    }
                }
                json
            }
        };
        for (k, v) in &self.vars {
            scope.set(k.clone(), v.clone());
        }
        scope.set("topic", JsonValue::String(topic.to_string()));
        scope.set(
            "segments",
            JsonValue::Array(topic.split('/').map(|s| JsonValue::String(s.into())).collect()),
        );
        scope.set("payload", payload);
        Ok(scope)
    }

    /// Translate a panel message into publications, one per matching rule.
    /// A rule that cannot be rendered yields an error for that rule only.
    pub fn resolve_inbound(&self, msg: &ProtocolMessage) -> Vec<Result<Publication>> {
        let mut base = Scope(self.vars.clone());
        base.set("kind", JsonValue::String(msg.kind.clone()));
        base.set("class", JsonValue::String(msg.class.to_string()));
        if let Some(id) = msg.correlation {
            base.set("correlation", JsonValue::from(id));
        }
        for (name, value) in &msg.params {
            base.set(name.clone(), value.to_json());
        }

        self.inbound
            .iter()
            .filter(|rule| rule.kind.is_match(&msg.kind) && when_holds(&rule.when, &base))
            .map(|rule| rule.resolve(&base))
            .collect()
    }
}

impl InboundRule {
    fn resolve(&self, base: &Scope) -> Result<Publication> {
        let fail = |reason: String| BridgeError::resolution(&self.name, reason);
        let mut scope = base.clone();
        for (name, transform) in &self.transforms {
            let value = scope
                .lookup(name)
                .ok_or_else(|| fail(format!("'{name}' is not bound")))?;
            let transformed = transform.apply(value).map_err(|e| fail(format!("{name}: {e}")))?;
            scope.set(name.clone(), transformed);
        }
        let topic = self.topic.render(&scope).map_err(fail)?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(fail(format!("rendered topic {topic:?} is not publishable")));
        }
        let payload = self.payload.render(&scope).map_err(fail)?;
        Ok(Publication {
            topic,
            payload,
            retain: self.retain,
        })
    }
}

impl OutboundRule {
    fn resolve(&self, topic: &str, scope: &Scope) -> Result<OutboundRequest> {
        let kind = &self.spec.kind;
        let mut message = ProtocolMessage::command(kind.clone());
        for (name, ty) in self.spec.params() {
            let Some(template) = self.params.iter().find(|(n, _)| n == name).map(|(_, t)| t) else {
                continue;
            };
            let rendered = template
                .render(scope)
                .map_err(|e| BridgeError::resolution(&self.name, e))?;
            let text = match self.transforms.get(name) {
                Some(t) => to_text(
                    &t.apply(&JsonValue::String(rendered))
                        .map_err(|e| BridgeError::payload(kind, format!("{name}: {e}")))?,
                ),
                None => rendered,
            };
            let value = ty
                .coerce(&text)
                .map_err(|e| BridgeError::payload(kind, format!("{name}: {e}")))?;
            message.params.push((name.clone(), value));
        }
        let reply_to = match &self.reply_topic {
            Some(t) => Some(t.render(scope).map_err(|e| BridgeError::resolution(&self.name, e))?),
            None => None,
        };
        debug!("Rule {} resolved {topic} to {kind}", self.name);
        Ok(OutboundRequest {
            message,
            topic: topic.to_string(),
            reply_to,
            rule: self.name.clone(),
        })
    }
}

fn compile_inbound(
    name: String,
    def: &InboundRuleDef,
    catalog: &Catalog,
    vars: &Map<String, JsonValue>,
) -> Result<InboundRule> {
    let kind = Regex::new(&format!("^(?:{})$", def.kind))
        .map_err(|e| BridgeError::config(format!("{name}: kind pattern does not compile: {e}")))?;
    let matched: Vec<&MessageSpec> = catalog.specs().filter(|s| kind.is_match(&s.kind)).collect();
    if matched.is_empty() {
        return Err(BridgeError::config(format!(
            "{name}: kind '{}' matches no message in the catalog",
            def.kind
        )));
    }

    let topic = template(&name, "topic", &def.topic)?;
    let payload = PayloadTemplate::compile(&def.payload)
        .map_err(|e| BridgeError::config(format!("{name}: payload: {e}")))?;
    let when = compile_when(&name, &def.when)?;

    // Every referenced name must be bound for every kind the rule can match.
    let is_param_everywhere = |param: &str| matched.iter().all(|s| s.param_type(param).is_some());
    let bound = |path: &str| {
        let r = root(path);
        vars.contains_key(r) || INBOUND_BUILTINS.contains(&r) || is_param_everywhere(r)
    };
    let mut referenced: Vec<&str> = topic.placeholders().collect();
    referenced.extend(payload.placeholders());
    referenced.extend(when.iter().map(|(n, _)| n.as_str()));
    if let Some(missing) = referenced.into_iter().find(|p| !bound(p)) {
        return Err(BridgeError::config(format!(
            "{name}: '{missing}' is not a parameter of every message matching '{}'",
            def.kind
        )));
    }
    for param in def.transforms.keys() {
        if !is_param_everywhere(param) {
            return Err(BridgeError::config(format!(
                "{name}: transform for unknown parameter '{param}'"
            )));
        }
    }

    Ok(InboundRule {
        name,
        kind,
        when,
        topic,
        payload,
        transforms: def
            .transforms
            .iter()
            .map(|(k, v)| (k.clone(), Transform::from(v)))
            .collect(),
        retain: def.retain,
    })
}

fn compile_outbound(
    name: String,
    def: &OutboundRuleDef,
    catalog: &Catalog,
    vars: &Map<String, JsonValue>,
) -> Result<OutboundRule> {
    validate_filter(&def.topic)
        .map_err(|e| BridgeError::config(format!("{name}: topic: {e}")))?;
    let spec = catalog
        .get(&def.kind)
        .ok_or_else(|| BridgeError::config(format!("{name}: unknown message kind '{}'", def.kind)))?;
    if spec.class != MessageClass::Command {
        return Err(BridgeError::config(format!(
            "{name}: '{}' is a {}, only commands can be sent",
            def.kind, spec.class
        )));
    }

    let mut params = Vec::new();
    for (param, text) in &def.params {
        if param == SEQUENCE_PARAM || spec.param_type(param).is_none() {
            return Err(BridgeError::config(format!(
                "{name}: '{}' has no parameter '{param}'",
                def.kind
            )));
        }
        params.push((param.clone(), template(&name, param, text)?));
    }
    if let Some((missing, _)) = spec
        .params()
        .iter()
        .find(|(p, _)| !def.params.contains_key(p))
    {
        return Err(BridgeError::config(format!(
            "{name}: parameter '{missing}' of '{}' is not provided",
            def.kind
        )));
    }
    for param in def.transforms.keys() {
        if !def.params.contains_key(param) {
            return Err(BridgeError::config(format!(
                "{name}: transform for unknown parameter '{param}'"
            )));
        }
    }

    let reply_topic = def
        .reply_topic
        .as_deref()
        .map(|t| template(&name, "reply_topic", t))
        .transpose()?;
    let when = compile_when(&name, &def.when)?;

    // JSON fields are only known at runtime; text payloads bind a fixed set.
    if def.format == PayloadFormat::Text {
        let bound = |path: &str| {
            let r = root(path);
            vars.contains_key(r) || OUTBOUND_BUILTINS.contains(&r)
        };
        let mut referenced: Vec<&str> = params.iter().flat_map(|(_, t)| t.placeholders()).collect();
        referenced.extend(reply_topic.iter().flat_map(|t| t.placeholders()));
        referenced.extend(when.iter().map(|(n, _)| n.as_str()));
        if let Some(missing) = referenced.into_iter().find(|p| !bound(p)) {
            return Err(BridgeError::config(format!(
                "{name}: '{missing}' is not bound for text payloads"
            )));
        }
    }

    Ok(OutboundRule {
        name,
        filter: def.topic.clone(),
        format: def.format,
        when,
        spec: spec.clone(),
        params,
        transforms: def
            .transforms
            .iter()
            .map(|(k, v)| (k.clone(), Transform::from(v)))
            .collect(),
        reply_topic,
    })
}

/// Check an MQTT topic filter: `+` and `#` occupy whole levels, `#` only last.
fn validate_filter(filter: &str) -> std::result::Result<(), String> {
    if filter.is_empty() {
        return Err("empty topic filter".to_string());
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(format!("'#' must be the whole last level in {filter:?}"));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must be a whole level in {filter:?}"));
        }
    }
    Ok(())
}

/// MQTT topic filter matching.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessageDef;
    use crate::protocol::Value;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Fixture {
        messages: Vec<MessageDef>,
        mapping: MappingConfig,
    }

    const CATALOG: &str = r#"
        [[messages]]
        kind = "Arm"
        class = "command"
        format = "ARM {mode}"
        params.mode = { type = "enum", values = ["AWAY", "HOME"] }

        [[messages]]
        kind = "Bypass"
        class = "command"
        format = "BYPASS {zone} {minutes}"
        params.zone = { type = "int", min = 1, max = 32 }
        params.minutes = { type = "int", min = 0 }

        [[messages]]
        kind = "Ok"
        class = "response"
        format = "OK"

        [[messages]]
        kind = "ZoneStatus"
        class = "event"
        format = "ZONE {zone} {open}"
        params.zone = { type = "int", min = 1, max = 32 }
        params.open = { type = "bool" }

        [[messages]]
        kind = "Temperature"
        class = "event"
        format = "TEMP {sensor} {raw}"
        params.sensor = { type = "int" }
        params.raw = { type = "int" }
    "#;

    fn table(mapping: &str) -> Result<MappingTable> {
        let fixture: Fixture = toml::from_str(&format!("{CATALOG}\n{mapping}")).unwrap();
        let catalog = Catalog::compile(&fixture.messages).unwrap();
        MappingTable::compile(&fixture.mapping, &catalog)
    }

    const RULES: &str = r#"
        [mapping.vars]
        site = "home"

        [[mapping.inbound]]
        name = "zone"
        kind = "ZoneStatus"
        topic = "alarm/zone/{zone}"
        payload = "{open}"
        transforms.open = { map = { "true" = "OPEN", "false" = "CLOSED" } }
        retain = true

        [[mapping.inbound]]
        name = "zone-json"
        kind = "Zone.*"
        topic = "{site}/zones"
        payload = { zone = "{zone}", label = "zone {zone}", kind = "{kind}" }

        [[mapping.inbound]]
        name = "temp"
        kind = "Temperature"
        when = { sensor = "1|2" }
        topic = "alarm/temp/{sensor}"
        payload = "{raw}"
        transforms.raw = { scale = 0.1, offset = -5 }

        [[mapping.outbound]]
        name = "arm"
        topic = "alarm/arm"
        kind = "Arm"
        params.mode = "{payload}"
        reply_topic = "alarm/arm/result"

        [[mapping.outbound]]
        name = "bypass"
        topic = "alarm/zone/+/bypass"
        format = "json"
        kind = "Bypass"
        params = { zone = "{segments.2}", minutes = "{minutes}" }

        [[mapping.outbound]]
        name = "arm-shortcut"
        topic = "alarm/#"
        when = { payload = "AWAY|HOME" }
        kind = "Arm"
        params.mode = "{payload}"
    "#;

    fn zone(zone: i64, open: bool) -> ProtocolMessage {
        ProtocolMessage::new(MessageClass::Event, "ZoneStatus")
            .with_param("zone", zone)
            .with_param("open", open)
    }

    #[test]
    fn test_zone_status_publishes_open() {
        let table = table(RULES).unwrap();
        let out = table.resolve_inbound(&zone(3, true));
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].as_ref().unwrap(),
            &Publication {
                topic: "alarm/zone/3".into(),
                payload: "OPEN".into(),
                retain: true,
            }
        );
        let json: JsonValue = serde_json::from_str(&out[1].as_ref().unwrap().payload).unwrap();
        assert_eq!(out[1].as_ref().unwrap().topic, "home/zones");
        assert_eq!(json["zone"], JsonValue::from(3));
        assert_eq!(json["label"], JsonValue::from("zone 3"));
        assert_eq!(json["kind"], JsonValue::from("ZoneStatus"));
    }

    #[test]
    fn test_when_and_scale() {
        let table = table(RULES).unwrap();
        let msg = ProtocolMessage::new(MessageClass::Event, "Temperature")
            .with_param("sensor", 2)
            .with_param("raw", 235);
        let out = table.resolve_inbound(&msg);
        assert_eq!(out.len(), 1);
        let publication = out[0].as_ref().unwrap();
        assert_eq!(publication.topic, "alarm/temp/2");
        assert_eq!(publication.payload, "18.5");

        let other = ProtocolMessage::new(MessageClass::Event, "Temperature")
            .with_param("sensor", 7)
            .with_param("raw", 235);
        assert!(table.resolve_inbound(&other).is_empty());
    }

    #[test]
    fn test_failing_rule_does_not_block_others() {
        let table = table(
            r#"
            [[mapping.inbound]]
            name = "strict"
            kind = "ZoneStatus"
            topic = "alarm/zone/{zone}"
            payload = "{open}"
            transforms.open = { map = { "true" = "OPEN" } }

            [[mapping.inbound]]
            name = "raw"
            kind = "ZoneStatus"
            topic = "alarm/raw/{zone}"
            payload = "{open}"
            "#,
        )
        .unwrap();
        let out = table.resolve_inbound(&zone(4, false));
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Err(BridgeError::Resolution { rule, .. }) if rule == "strict"));
        assert_eq!(out[1].as_ref().unwrap().payload, "false");
    }

    #[test]
    fn test_alarm_arm_away() {
        let table = table(RULES).unwrap();
        let request = table.resolve_outbound("alarm/arm", b"AWAY").unwrap().unwrap();
        assert_eq!(
            request.message,
            ProtocolMessage::command("Arm").with_param("mode", "AWAY")
        );
        assert_eq!(request.rule, "arm");
        assert_eq!(request.reply_to.as_deref(), Some("alarm/arm/result"));
    }

    #[test]
    fn test_outbound_json_and_segments() {
        let table = table(RULES).unwrap();
        let request = table
            .resolve_outbound("alarm/zone/7/bypass", br#"{"minutes": 30}"#)
            .unwrap()
            .unwrap();
        assert_eq!(request.message.param("zone"), Some(&Value::Int(7)));
        assert_eq!(request.message.param("minutes"), Some(&Value::Int(30)));
        assert_eq!(request.reply_to, None);
    }

    #[test]
    fn test_outbound_errors() {
        let table = table(RULES).unwrap();
        assert!(matches!(
            table.resolve_outbound("alarm/zone/7/bypass", b"not json"),
            Err(BridgeError::Payload { .. })
        ));
        assert!(matches!(
            table.resolve_outbound("alarm/zone/7/bypass", br#"{"hours": 1}"#),
            Err(BridgeError::Resolution { .. })
        ));
        assert!(matches!(
            table.resolve_outbound("alarm/zone/x/bypass", br#"{"minutes": 1}"#),
            Err(BridgeError::Payload { .. })
        ));
    }

    #[test]
    fn test_outbound_first_match_and_no_match() {
        let table = table(RULES).unwrap();
        let request = table.resolve_outbound("alarm/anything", b"HOME").unwrap().unwrap();
        assert_eq!(request.rule, "arm-shortcut");
        assert!(table.resolve_outbound("alarm/anything", b"PANIC").unwrap().is_none());
        assert!(table.resolve_outbound("other/topic", b"AWAY").unwrap().is_none());
    }

    #[test]
    fn test_failed_json_rule_falls_through() {
        let table = table(RULES).unwrap();
        // "bypass" cannot parse a text payload; "arm-shortcut" also matches the topic.
        let request = table
            .resolve_outbound("alarm/zone/7/bypass", b"AWAY")
            .unwrap()
            .unwrap();
        assert_eq!(request.rule, "arm-shortcut");
        assert_eq!(
            request.message,
            ProtocolMessage::command("Arm").with_param("mode", "AWAY")
        );
    }

    #[test]
    fn test_json_fields_do_not_shadow_bindings() {
        let table = table(
            r#"
            [mapping.vars]
            site = "home"

            [[mapping.outbound]]
            name = "bypass"
            topic = "alarm/zone/+/bypass"
            format = "json"
            kind = "Bypass"
            params = { zone = "{segments.2}", minutes = "{minutes}" }
            reply_topic = "{site}/{topic}/result"
            "#,
        )
        .unwrap();
        let payload = br#"{"minutes": 1, "segments": ["a", "b", "9"], "topic": "x", "site": "away"}"#;
        let request = table
            .resolve_outbound("alarm/zone/7/bypass", payload)
            .unwrap()
            .unwrap();
        assert_eq!(request.message.param("zone"), Some(&Value::Int(7)));
        assert_eq!(request.message.param("minutes"), Some(&Value::Int(1)));
        assert_eq!(
            request.reply_to.as_deref(),
            Some("home/alarm/zone/7/bypass/result")
        );
    }

    #[test]
    fn test_subscriptions() {
        let table = table(RULES).unwrap();
        assert_eq!(
            table.subscriptions(),
            vec!["alarm/arm", "alarm/zone/+/bypass", "alarm/#"]
        );
    }

    #[test]
    fn test_unknown_parameter_rejected_at_load() {
        let err = table(
            r#"
            [[mapping.inbound]]
            kind = "ZoneStatus|Temperature"
            topic = "alarm/zone/{zone}"
            payload = "x"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(ref m) if m.contains("'zone'")));

        let err = table(
            r#"
            [[mapping.outbound]]
            topic = "alarm/bypass"
            kind = "Bypass"
            params.zone = "{payload}"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(ref m) if m.contains("minutes")));

        assert!(table("[[mapping.outbound]]\ntopic = \"a\"\nkind = \"Ok\"\n").is_err());
        assert!(table("[[mapping.outbound]]\ntopic = \"a/#/b\"\nkind = \"Arm\"\nparams.mode = \"{payload}\"\n").is_err());
        assert!(
            table("[[mapping.inbound]]\nkind = \"Nope\"\ntopic = \"a\"\npayload = \"b\"\n").is_err()
        );
    }

    #[test]
    fn test_disabled_rules_skipped() {
        let table = table(
            r#"
            [[mapping.inbound]]
            kind = "ZoneStatus"
            topic = "alarm/zone/{nonexistent}"
            payload = "x"
            disabled = true
            "#,
        )
        .unwrap();
        assert!(table.resolve_inbound(&zone(1, true)).is_empty());
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("alarm/#", "alarm/zone/1"));
        assert!(topic_matches("alarm/#", "alarm"));
        assert!(topic_matches("alarm/+/set", "alarm/1/set"));
        assert!(!topic_matches("alarm/+/set", "alarm/1/2/set"));
        assert!(!topic_matches("alarm/arm", "alarm/arm/x"));
        assert!(topic_matches("alarm/arm", "alarm/arm"));
    }

    #[test]
    fn test_template_parse() {
        let t = Template::parse("{{\"a\": {x.y}}}").unwrap();
        assert_eq!(t.placeholders().collect::<Vec<_>>(), vec!["x.y"]);
        let mut scope = Scope::default();
        scope.set("x", serde_json::json!({"y": 5}));
        assert_eq!(t.render(&scope).unwrap(), "{\"a\": 5}");
        assert!(Template::parse("{open").is_err());
        assert!(Template::parse("{a b}").is_err());
        assert!(Template::parse("}").is_err());
    }
}
