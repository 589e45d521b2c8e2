//! String matchers used by route rules and breaker rules.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PolarisError;

pub const WILDCARD: &str = "*";

/// How the matcher compares values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    #[default]
    Exact,
    Regex,
}

/// Where the expected value comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueType {
    /// Literal value in the rule.
    #[default]
    Text,
    /// Value supplied by the caller at request time.
    Parameter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MatchStringSpec {
    #[serde(rename = "type")]
    match_type: MatchType,
    value: String,
    value_type: ValueType,
}

/// A compiled matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "MatchStringSpec", into = "MatchStringSpec")]
pub struct MatchString {
    match_type: MatchType,
    value_type: ValueType,
    value: String,
    regex: Option<Regex>,
    match_all: bool,
}

impl TryFrom<MatchStringSpec> for MatchString {
    type Error = PolarisError;

    fn try_from(spec: MatchStringSpec) -> Result<Self, Self::Error> {
        let match_all = spec.value.is_empty() || spec.value == WILDCARD;
        let regex = if !match_all && spec.match_type == MatchType::Regex && spec.value_type == ValueType::Text {
            Some(Regex::new(&spec.value).map_err(|e| {
                PolarisError::InvalidConfig(format!("regex '{}' does not compile: {}", spec.value, e))
            })?)
        } else {
            None
        };
        Ok(Self {
            match_type: spec.match_type,
            value_type: spec.value_type,
            value: spec.value,
            regex,
            match_all,
        })
    }
}

impl From<MatchString> for MatchStringSpec {
    fn from(m: MatchString) -> Self {
        Self {
            match_type: m.match_type,
            value: m.value,
            value_type: m.value_type,
        }
    }
}

impl MatchString {
    pub fn exact(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            match_all: value.is_empty() || value == WILDCARD,
            match_type: MatchType::Exact,
            value_type: ValueType::Text,
            value,
            regex: None,
        }
    }

    pub fn regex(pattern: &str) -> Result<Self, PolarisError> {
        MatchString::try_from(MatchStringSpec {
            match_type: MatchType::Regex,
            value: pattern.to_string(),
            value_type: ValueType::Text,
        })
    }

    pub fn parameter(match_type: MatchType) -> Self {
        Self {
            match_type,
            value_type: ValueType::Parameter,
            value: String::new(),
            regex: None,
            match_all: true,
        }
    }

    pub fn is_parameter(&self) -> bool {
        self.value_type == ValueType::Parameter
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Match a literal value. Parameter matchers defer to [`Self::matches_parameter`].
    pub fn matches(&self, value: &str) -> bool {
        if self.is_parameter() || self.match_all {
            return true;
        }
        match self.match_type {
            MatchType::Exact => self.value == value,
            MatchType::Regex => self.regex.as_ref().map(|r| r.is_match(value)).unwrap_or(false),
        }
    }

    /// Match `value` against a caller-supplied expected parameter.
    pub fn matches_parameter(&self, parameter: &str, value: &str) -> bool {
        match self.match_type {
            MatchType::Exact => parameter == value,
            MatchType::Regex => Regex::new(parameter).map(|r| r.is_match(value)).unwrap_or(false),
        }
    }
}

/// Every rule key must be present in `metadata` and match.
pub fn map_match(rule: &BTreeMap<String, MatchString>, metadata: &BTreeMap<String, String>) -> bool {
    if rule.len() > metadata.len() {
        return false;
    }
    rule.iter().all(|(key, matcher)| {
        metadata
            .get(key)
            .map(|value| matcher.matches(value))
            .unwrap_or(false)
    })
}

/// Like [`map_match`] but collects the values bound to parameter matchers,
/// joined by `,`.
pub fn map_match_collect(
    rule: &BTreeMap<String, MatchString>,
    metadata: &BTreeMap<String, String>,
    parameters: &mut String,
) -> bool {
    parameters.clear();
    if rule.len() > metadata.len() {
        return false;
    }
    for (key, matcher) in rule {
        let value = match metadata.get(key) {
            Some(v) => v,
            None => return false,
        };
        if matcher.is_parameter() {
            if !parameters.is_empty() {
                parameters.push(',');
            }
            parameters.push_str(value);
        } else if !matcher.matches(value) {
            return false;
        }
    }
    true
}

/// Match instance metadata against a rule whose parameter matchers take their
/// expected value from the caller's `parameters`.
pub fn map_match_with_parameters(
    rule: &BTreeMap<String, MatchString>,
    metadata: &BTreeMap<String, String>,
    parameters: &BTreeMap<String, String>,
) -> bool {
    if rule.len() > metadata.len() {
        return false;
    }
    rule.iter().all(|(key, matcher)| {
        let value = match metadata.get(key) {
            Some(v) => v,
            None => return false,
        };
        if matcher.is_parameter() {
            parameters
                .get(key)
                .map(|p| matcher.matches_parameter(p, value))
                .unwrap_or(false)
        } else {
            matcher.matches(value)
        }
    })
}
