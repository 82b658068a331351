//! The module registry: named, platform-scoped operations with typed,
//! validated arguments and streamed results.
//!
//! A module declares its argument descriptors up front; the registry
//! coerces raw string arguments into typed values before dispatch, so
//! argument errors never reach the transport. During execution a module
//! emits [`Event`]s into a sink: `Status` events drive the progress
//! surface, `Result` events are collected and handed back to the caller.

use std::collections::{BTreeMap, HashMap};

use redcat_internal::error::Error;

use crate::platform::PlatformKind;
use crate::session::Session;

mod authorized_key;
mod uname;
mod users;

/// The type of one module argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Int,
    Bool,
    /// A remote or local path; coerced like a string but documented as a
    /// path.
    Path,
    /// One of a fixed set of choices.
    Enum(&'static [&'static str]),
}

/// A typed argument value after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Bool(bool),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Descriptor for one argument: kind, optional default, help text. An
/// argument without a default is required.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub default: Option<Value>,
    pub help: &'static str,
}

impl ArgSpec {
    pub fn required(name: &'static str, kind: ArgKind, help: &'static str) -> ArgSpec {
        ArgSpec {
            name,
            kind,
            default: None,
            help,
        }
    }

    pub fn optional(name: &'static str, kind: ArgKind, default: Value, help: &'static str) -> ArgSpec {
        ArgSpec {
            name,
            kind,
            default: Some(default),
            help,
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    /// Coerce a raw string according to the declared kind.
    fn coerce(&self, raw: &str) -> Result<Value, Error> {
        match &self.kind {
            ArgKind::String | ArgKind::Path => Ok(Value::String(raw.to_string())),
            ArgKind::Int => raw
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::Argument(format!("{}: expected an integer, got {:?}", self.name, raw))),
            ArgKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(Error::Argument(format!(
                    "{}: expected true/false, got {:?}",
                    self.name, raw
                ))),
            },
            ArgKind::Enum(choices) => {
                if choices.contains(&raw) {
                    Ok(Value::String(raw.to_string()))
                } else {
                    Err(Error::Argument(format!(
                        "{}: expected one of {:?}, got {:?}",
                        self.name, choices, raw
                    )))
                }
            }
        }
    }
}

/// Validated arguments passed to a module's `run`.
#[derive(Debug, Default)]
pub struct Args(HashMap<String, Value>);

impl Args {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }
}

/// A single result produced by a module.
pub trait ModuleResult: Send {
    /// Short, human readable title. This is what the user sees on failure
    /// or in the result listing.
    fn title(&self) -> String;

    /// Optional long-form description.
    fn description(&self) -> Option<String> {
        None
    }

    /// Grouping category for display.
    fn category(&self) -> Option<String> {
        None
    }
}

/// Stream of module output: results for the caller, status lines for the
/// progress surface.
pub enum Event {
    Result(Box<dyn ModuleResult>),
    Status(String),
}

/// Where a running module emits its events.
pub trait EventSink {
    fn emit(&mut self, event: Event);

    /// Emit a progress status line.
    fn status(&mut self, message: &str) {
        self.emit(Event::Status(message.to_string()));
    }

    /// Emit a result for the caller.
    fn result(&mut self, result: Box<dyn ModuleResult>) {
        self.emit(Event::Result(result));
    }
}

/// A named operation runnable against a session.
pub trait Module: Send + Sync {
    /// Dotted module name, e.g. `enumerate.uname`.
    fn name(&self) -> &'static str;

    /// Platforms this module supports; empty means any.
    fn platforms(&self) -> &'static [PlatformKind] {
        &[]
    }

    fn description(&self) -> &'static str {
        ""
    }

    fn args(&self) -> Vec<ArgSpec> {
        Vec::new()
    }

    /// Execute against the session, emitting events into the sink.
    fn run(&self, session: &mut Session, args: &Args, sink: &mut dyn EventSink)
        -> Result<(), Error>;
}

/// Name-keyed module lookup with glob search and argument validation.
pub struct Registry {
    modules: BTreeMap<&'static str, Box<dyn Module>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            modules: BTreeMap::new(),
        }
    }

    /// A registry populated with the built-in modules.
    pub fn with_builtins() -> Registry {
        let mut registry = Registry::new();
        registry.register(Box::new(uname::Uname));
        registry.register(Box::new(users::Users));
        registry.register(Box::new(authorized_key::AuthorizedKey));
        registry
    }

    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.insert(module.name(), module);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Module> {
        self.modules.get(name).map(|m| m.as_ref())
    }

    /// Names matching a glob pattern (`*` and `?` wildcards).
    pub fn search(&self, pattern: &str) -> Vec<&'static str> {
        let regex = glob_to_regex(pattern);
        self.modules
            .keys()
            .filter(|name| regex.is_match(name))
            .copied()
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }

    /// Validate and coerce raw string arguments against the module's
    /// descriptors. Unknown arguments, missing required arguments and
    /// type mismatches are all `Argument` errors.
    pub fn validate(&self, module: &dyn Module, raw: &HashMap<String, String>) -> Result<Args, Error> {
        let specs = module.args();
        let mut values = HashMap::new();

        for (key, value) in raw {
            let spec = specs
                .iter()
                .find(|s| s.name == key)
                .ok_or_else(|| Error::Argument(format!("{}: unknown argument", key)))?;
            values.insert(key.clone(), spec.coerce(value)?);
        }

        for spec in &specs {
            if values.contains_key(spec.name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    values.insert(spec.name.to_string(), default.clone());
                }
                None => {
                    return Err(Error::Argument(format!("{}: required argument missing", spec.name)));
                }
            }
        }

        Ok(Args(values))
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

/// Resolve, validate and execute a module against a session, draining its
/// event stream. Returns the collected results.
pub fn run_module(
    registry: &Registry,
    name: &str,
    session: &mut Session,
    raw_args: &HashMap<String, String>,
) -> Result<Vec<Box<dyn ModuleResult>>, Error> {
    let module = registry
        .find(name)
        .ok_or_else(|| Error::NotFound(format!("{}: no such module", name)))?;

    let platforms = module.platforms();
    if !platforms.is_empty() && !platforms.contains(&session.platform.kind()) {
        return Err(Error::Argument(format!(
            "{}: module does not support {}",
            name,
            session.platform.kind()
        )));
    }

    let args = registry.validate(module, raw_args)?;

    session.log.log(&format!("running {}", name));

    // The collector needs the log while the module needs the rest of the
    // session mutably, so the results are routed through a temporary sink.
    let mut events: Vec<Event> = Vec::new();
    struct VecSink<'a>(&'a mut Vec<Event>);
    impl EventSink for VecSink<'_> {
        fn emit(&mut self, event: Event) {
            self.0.push(event);
        }
    }

    module.run(session, &args, &mut VecSink(&mut events))?;

    let mut results = Vec::new();
    for event in events {
        match event {
            Event::Status(message) => session.log.log(&message),
            Event::Result(result) => results.push(result),
        }
    }
    Ok(results)
}

fn glob_to_regex(pattern: &str) -> regex::Regex {
    let mut escaped = String::with_capacity(pattern.len() + 8);
    escaped.push('^');
    for c in pattern.chars() {
        match c {
            '*' => escaped.push_str(".*"),
            '?' => escaped.push('.'),
            other => escaped.push_str(&regex::escape(&other.to_string())),
        }
    }
    escaped.push('$');

    // the pattern is fully escaped; compilation cannot fail
    regex::Regex::new(&escaped).unwrap_or_else(|_| regex::Regex::new("^$").unwrap())
}

/// A plain textual result, sufficient for most enumerations.
pub struct TextResult {
    pub title: String,
    pub category: Option<String>,
    pub description: Option<String>,
}

impl TextResult {
    pub fn new(title: impl Into<String>) -> TextResult {
        TextResult {
            title: title.into(),
            category: None,
            description: None,
        }
    }

    pub fn categorized(title: impl Into<String>, category: impl Into<String>) -> TextResult {
        TextResult {
            title: title.into(),
            category: Some(category.into()),
            description: None,
        }
    }
}

impl ModuleResult for TextResult {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    fn category(&self) -> Option<String> {
        self.category.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl Module for Probe {
        fn name(&self) -> &'static str {
            "test.probe"
        }

        fn args(&self) -> Vec<ArgSpec> {
            vec![
                ArgSpec::required("target", ArgKind::String, "target path"),
                ArgSpec::optional("depth", ArgKind::Int, Value::Int(1), "recursion depth"),
                ArgSpec::optional("follow", ArgKind::Bool, Value::Bool(false), "follow links"),
                ArgSpec::required("mode", ArgKind::Enum(&["fast", "slow"]), "scan mode"),
            ]
        }

        fn run(&self, _: &mut Session, _: &Args, _: &mut dyn EventSink) -> Result<(), Error> {
            Ok(())
        }
    }

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn validation_coerces_and_fills_defaults() {
        let registry = Registry::new();
        let args = registry
            .validate(&Probe, &raw(&[("target", "/etc"), ("depth", "3"), ("mode", "fast")]))
            .unwrap();

        assert_eq!(args.get_str("target"), Some("/etc"));
        assert_eq!(args.get_int("depth"), Some(3));
        assert_eq!(args.get_bool("follow"), Some(false)); // default
        assert_eq!(args.get_str("mode"), Some("fast"));
    }

    #[test]
    fn missing_required_argument_fails() {
        let registry = Registry::new();
        match registry.validate(&Probe, &raw(&[("mode", "fast")])) {
            Err(Error::Argument(msg)) => assert!(msg.contains("target")),
            other => panic!("expected Argument error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bad_int_and_bad_choice_fail() {
        let registry = Registry::new();
        assert!(matches!(
            registry.validate(&Probe, &raw(&[("target", "/"), ("mode", "fast"), ("depth", "x")])),
            Err(Error::Argument(_))
        ));
        assert!(matches!(
            registry.validate(&Probe, &raw(&[("target", "/"), ("mode", "warp")])),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn unknown_argument_fails() {
        let registry = Registry::new();
        assert!(matches!(
            registry.validate(&Probe, &raw(&[("target", "/"), ("mode", "fast"), ("nope", "1")])),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn glob_search_matches_dotted_names() {
        let registry = Registry::with_builtins();
        let hits = registry.search("enumerate.*");
        assert!(hits.contains(&"enumerate.uname"));
        assert!(hits.contains(&"enumerate.users"));
        assert!(!hits.contains(&"implant.authorized_key"));

        let hits = registry.search("*authorized*");
        assert_eq!(hits, vec!["implant.authorized_key"]);
    }

    #[test]
    fn builtins_are_registered() {
        let registry = Registry::with_builtins();
        assert!(registry.find("enumerate.uname").is_some());
        assert!(registry.find("enumerate.users").is_some());
        assert!(registry.find("implant.authorized_key").is_some());
        assert!(registry.find("no.such.module").is_none());
    }
}
