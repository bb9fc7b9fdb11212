//! Attribute configuration and the pluggable filter chain.
//!
//! The parser treats filters as black boxes: each one either returns a
//! (possibly rewritten) value or rejects it. Rejection falls back to the
//! attribute's default value when one is configured, otherwise the
//! attribute is dropped; a missing required attribute invalidates the tag.

use regex::Regex;
use serde::Serialize;
use std::fmt;

/// A single validation/transformation step for one attribute value.
pub trait AttributeFilter {
    /// Return the filtered value, or `None` to reject it.
    fn filter(&self, value: &str) -> Option<String>;
}

impl<F> AttributeFilter for F
where
    F: Fn(&str) -> Option<String>,
{
    fn filter(&self, value: &str) -> Option<String> {
        self(value)
    }
}

/// Accepts values fully matching a pattern, unchanged.
pub struct RegexFilter {
    regex: Regex,
}

impl RegexFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        // Anchor the pattern so partial matches don't slip through.
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(RegexFilter { regex })
    }
}

impl AttributeFilter for RegexFilter {
    fn filter(&self, value: &str) -> Option<String> {
        self.regex.is_match(value).then(|| value.to_string())
    }
}

/// Compiled configuration for one attribute of a tag.
#[derive(Serialize)]
pub struct AttrSchema {
    /// Whether the owning tag is invalid without this attribute.
    pub required: bool,
    /// Fallback used when the attribute is missing or rejected.
    pub default_value: Option<String>,
    #[serde(skip)]
    pub filter_chain: Vec<Box<dyn AttributeFilter>>,
}

impl AttrSchema {
    /// An optional attribute with no filtering.
    pub fn optional() -> Self {
        AttrSchema {
            required: false,
            default_value: None,
            filter_chain: Vec::new(),
        }
    }

    /// A required attribute with no filtering.
    pub fn required() -> Self {
        AttrSchema {
            required: true,
            default_value: None,
            filter_chain: Vec::new(),
        }
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }

    pub fn with_filter(mut self, filter: impl AttributeFilter + 'static) -> Self {
        self.filter_chain.push(Box::new(filter));
        self
    }

    /// Run the filter chain over a raw value.
    pub fn apply(&self, value: &str) -> Option<String> {
        let mut value = value.to_string();
        for filter in &self.filter_chain {
            value = filter.filter(&value)?;
        }
        Some(value)
    }
}

impl fmt::Debug for AttrSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttrSchema")
            .field("required", &self.required)
            .field("default_value", &self.default_value)
            .field("filter_chain", &self.filter_chain.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_filter_is_anchored() {
        let filter = RegexFilter::new(r"\d+").unwrap();
        assert_eq!(filter.filter("123"), Some("123".to_string()));
        assert_eq!(filter.filter("123abc"), None);
    }

    #[test]
    fn closures_are_filters() {
        let schema =
            AttrSchema::optional().with_filter(|v: &str| Some(v.to_ascii_lowercase()));
        assert_eq!(schema.apply("ABC"), Some("abc".to_string()));
    }

    #[test]
    fn chain_short_circuits_on_rejection() {
        let schema = AttrSchema::optional()
            .with_filter(|_: &str| None)
            .with_filter(|_: &str| panic!("must not run"));
        assert_eq!(schema.apply("x"), None);
    }
}
