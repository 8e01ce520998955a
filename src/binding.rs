//! Binding and tie rules as delivered by the bootstrap call.
//!
//! The wire types ([`Trigger`], [`AspectRef`], [`Binding`], [`Tie`]) mirror
//! the server's JSON. Before dispatch they are compiled once into
//! [`CompiledTrigger`] / [`CompiledRef`], where every `regex` rule carries
//! ready-to-match [`Regex`] objects.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::transform::Transform;

/// Address of one aspect: `(identity, aspect)`, optionally as patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectRef {
    /// Component identity, or an identity pattern when `regex` is set.
    pub identity: String,
    /// Aspect name, or an aspect-name pattern when `regex` is set.
    pub aspect: String,
    /// Treat `identity` and `aspect` as regular expressions.
    #[serde(default)]
    pub regex: bool,
}

impl AspectRef {
    /// Exact reference to `identity.aspect`.
    pub fn new(identity: impl Into<String>, aspect: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            aspect: aspect.into(),
            regex: false,
        }
    }

    /// Pattern reference matched against live identities and aspect names.
    pub fn pattern(identity: impl Into<String>, aspect: impl Into<String>) -> Self {
        Self {
            regex: true,
            ..Self::new(identity, aspect)
        }
    }
}

/// The aspect whose change fires a binding or tie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Component identity (or pattern).
    pub identity: String,
    /// Aspect name (or pattern).
    pub aspect: String,
    /// Treat `identity` and `aspect` as regular expressions.
    #[serde(default)]
    pub regex: bool,
    /// Do not fire for the initial dispatch a store performs on mount.
    #[serde(default)]
    pub skip_initial: bool,
    /// Fire at most once per session.
    #[serde(default)]
    pub once: bool,
}

impl Trigger {
    /// Exact trigger on `identity.aspect`.
    pub fn new(identity: impl Into<String>, aspect: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            aspect: aspect.into(),
            regex: false,
            skip_initial: false,
            once: false,
        }
    }
}

/// A server round-trip rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// What fires the binding.
    pub trigger: Trigger,
    /// Aspects whose current values travel with the trigger value.
    #[serde(default)]
    pub states: Vec<AspectRef>,
    /// Opaque key the server uses to find its handler.
    #[serde(default)]
    pub key: String,
    /// Use an HTTP `PATCH` call instead of a websocket frame.
    #[serde(default)]
    pub call: bool,
}

/// A client-only rule: transform the trigger value and write it elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tie {
    /// What fires the tie.
    pub trigger: Trigger,
    /// Targets written on every firing.
    #[serde(default)]
    pub targets: Vec<AspectRef>,
    /// Targets whose identity and aspect are always patterns.
    #[serde(default, alias = "regexTargets")]
    pub regex_targets: Vec<AspectRef>,
    /// Chain applied to the trigger value before writing.
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

/// Bindings as sent by the server: a plain list, or lists grouped under
/// arbitrary keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindingTable {
    /// `[binding, ...]`
    List(Vec<Binding>),
    /// `{"any key": [binding, ...], ...}`; keys carry no meaning.
    Keyed(BTreeMap<String, Vec<Binding>>),
}

impl Default for BindingTable {
    fn default() -> Self {
        BindingTable::List(Vec::new())
    }
}

impl BindingTable {
    /// Flatten into a list, keyed groups in key order.
    pub fn into_bindings(self) -> Vec<Binding> {
        match self {
            BindingTable::List(bindings) => bindings,
            BindingTable::Keyed(groups) => groups.into_values().flatten().collect(),
        }
    }
}

/// One side of a rule address: a literal or a compiled pattern.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches exactly this string.
    Exact(String),
    /// Matches anything the regex finds a match in.
    Regex(Regex),
}

impl Pattern {
    /// Compile `text`, as a regex when `regex` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Pattern`] if `text` is not a valid regex.
    pub fn compile(text: &str, regex: bool) -> Result<Self, ProtocolError> {
        if !regex {
            return Ok(Pattern::Exact(text.to_owned()));
        }
        Regex::new(text)
            .map(Pattern::Regex)
            .map_err(|source| ProtocolError::Pattern {
                pattern: text.to_owned(),
                source,
            })
    }

    /// Whether `candidate` matches. Regexes use search semantics.
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Pattern::Exact(text) => text == candidate,
            Pattern::Regex(re) => re.is_match(candidate),
        }
    }

    /// The literal, if this is an exact pattern.
    pub fn as_exact(&self) -> Option<&str> {
        match self {
            Pattern::Exact(text) => Some(text),
            Pattern::Regex(_) => None,
        }
    }
}

/// A [`Trigger`] with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    /// Identity side.
    pub identity: Pattern,
    /// Aspect side.
    pub aspect: Pattern,
    /// Skip the initial dispatch on mount.
    pub skip_initial: bool,
    /// Fire at most once.
    pub once: bool,
}

impl CompiledTrigger {
    /// Compile a wire trigger.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Pattern`] if either side is an invalid regex.
    pub fn compile(trigger: &Trigger) -> Result<Self, ProtocolError> {
        Ok(Self {
            identity: Pattern::compile(&trigger.identity, trigger.regex)?,
            aspect: Pattern::compile(&trigger.aspect, trigger.regex)?,
            skip_initial: trigger.skip_initial,
            once: trigger.once,
        })
    }

    /// Whether this trigger is addressed by patterns.
    pub fn is_regex(&self) -> bool {
        self.identity.as_exact().is_none() || self.aspect.as_exact().is_none()
    }

    /// Whether a change of `identity.aspect` fires this trigger.
    pub fn matches(&self, identity: &str, aspect: &str) -> bool {
        self.identity.matches(identity) && self.aspect.matches(aspect)
    }

    /// Whether the trigger takes part in a dispatch pass.
    pub fn applies(&self, initial: bool) -> bool {
        !(initial && self.skip_initial)
    }
}

/// An [`AspectRef`] with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledRef {
    /// Identity side.
    pub identity: Pattern,
    /// Aspect side.
    pub aspect: Pattern,
}

impl CompiledRef {
    /// Compile a wire reference; `force_regex` treats it as a pattern even
    /// without the `regex` flag.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Pattern`] if either side is an invalid regex.
    pub fn compile(reference: &AspectRef, force_regex: bool) -> Result<Self, ProtocolError> {
        let regex = reference.regex || force_regex;
        Ok(Self {
            identity: Pattern::compile(&reference.identity, regex)?,
            aspect: Pattern::compile(&reference.aspect, regex)?,
        })
    }

    /// Both sides as literals, if this reference is exact.
    pub fn as_exact(&self) -> Option<(&str, &str)> {
        Some((self.identity.as_exact()?, self.aspect.as_exact()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_flags_default_to_false() {
        let trigger: Trigger =
            serde_json::from_value(json!({"identity": "btn", "aspect": "clicks"})).unwrap();
        assert_eq!(trigger, Trigger::new("btn", "clicks"));
    }

    #[test]
    fn binding_table_accepts_list_and_keyed_forms() {
        let binding = json!({
            "trigger": {"identity": "btn", "aspect": "clicks"},
            "states": [{"identity": "input", "aspect": "value"}],
            "key": "submit"
        });
        let list: BindingTable = serde_json::from_value(json!([binding.clone()])).unwrap();
        let keyed: BindingTable =
            serde_json::from_value(json!({"btn.clicks": [binding]})).unwrap();
        assert_eq!(list.clone().into_bindings(), keyed.into_bindings());
        let bindings = list.into_bindings();
        assert_eq!(bindings[0].states, vec![AspectRef::new("input", "value")]);
        assert!(!bindings[0].call);
    }

    #[test]
    fn tie_accepts_camel_case_regex_targets() {
        let tie: Tie = serde_json::from_value(json!({
            "trigger": {"identity": "slider", "aspect": "value"},
            "regexTargets": [{"identity": "^label-", "aspect": "text"}],
            "transforms": [{"transform": "ToString"}]
        }))
        .unwrap();
        assert_eq!(tie.regex_targets.len(), 1);
        assert_eq!(tie.transforms[0].transform, "ToString");
        assert!(tie.targets.is_empty());
    }

    #[test]
    fn regex_trigger_matches_with_search_semantics() {
        let trigger = CompiledTrigger::compile(&Trigger {
            regex: true,
            ..Trigger::new("row-\\d+", "value")
        })
        .unwrap();
        assert!(trigger.is_regex());
        assert!(trigger.matches("table.row-17", "value"));
        assert!(trigger.matches("row-1", "old_value"));
        assert!(!trigger.matches("row-x", "value"));
    }

    #[test]
    fn exact_trigger_requires_equality() {
        let trigger = CompiledTrigger::compile(&Trigger::new("row-1", "value")).unwrap();
        assert!(!trigger.is_regex());
        assert!(trigger.matches("row-1", "value"));
        assert!(!trigger.matches("row-10", "value"));
    }

    #[test]
    fn invalid_pattern_is_a_protocol_error() {
        let err = CompiledRef::compile(&AspectRef::pattern("(", "x"), false).unwrap_err();
        assert!(matches!(err, ProtocolError::Pattern { ref pattern, .. } if pattern == "("));
    }

    #[test]
    fn skip_initial_only_applies_to_initial_pass() {
        let trigger = CompiledTrigger::compile(&Trigger {
            skip_initial: true,
            ..Trigger::new("a", "b")
        })
        .unwrap();
        assert!(!trigger.applies(true));
        assert!(trigger.applies(false));
    }
}
