//! Event selectors: literal names, compiled patterns, and the `"*"` wildcard.

use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};

/// Pattern source the `"*"` wildcard normalises to.
const MATCH_ALL: &str = ".*";

/// Selects events by exact name or by compiled pattern.
///
/// The wildcard literal `"*"` converts to a match-everything [`Selector::Pattern`].
/// Selectors are canonicalised by [`key`](Self::key): the literal string for
/// names, `Regex::as_str()` for patterns. The two key spaces index separate
/// registry maps; cross-matching happens at emit time.
#[derive(Clone, Debug)]
pub enum Selector {
	/// Exact event name.
	Name(String),
	/// Compiled pattern matched against event names.
	Pattern(Regex),
}

impl Selector {
	/// Returns the match-everything selector `"*"` normalises to.
	pub fn wildcard() -> Self {
		Selector::Pattern(Regex::new(MATCH_ALL).expect("match-all pattern is always valid"))
	}

	/// Canonical registry key for this selector.
	pub fn key(&self) -> &str {
		match self {
			Selector::Name(name) => name,
			Selector::Pattern(regex) => regex.as_str(),
		}
	}

	/// Returns true for pattern selectors.
	pub fn is_pattern(&self) -> bool {
		matches!(self, Selector::Pattern(_))
	}

	/// Returns true if this selector is the normalised wildcard.
	pub fn is_wildcard(&self) -> bool {
		matches!(self, Selector::Pattern(regex) if regex.as_str() == MATCH_ALL)
	}

	/// Returns true if this selector matches the given literal event name.
	pub fn matches(&self, name: &str) -> bool {
		match self {
			Selector::Name(own) => own == name,
			Selector::Pattern(regex) => regex.is_match(name),
		}
	}

	/// Validates the selector.
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidEvent`] for an empty literal name.
	pub fn validate(&self) -> Result<()> {
		match self {
			Selector::Name(name) if name.is_empty() => Err(Error::InvalidEvent {
				event: String::new(),
				reason: "event name must be a non-empty string".to_string(),
			}),
			_ => Ok(()),
		}
	}
}

impl From<&str> for Selector {
	fn from(value: &str) -> Self {
		if value == "*" {
			Selector::wildcard()
		} else {
			Selector::Name(value.to_string())
		}
	}
}

impl From<String> for Selector {
	fn from(value: String) -> Self {
		if value == "*" {
			Selector::wildcard()
		} else {
			Selector::Name(value)
		}
	}
}

impl From<Regex> for Selector {
	fn from(value: Regex) -> Self {
		Selector::Pattern(value)
	}
}

impl From<&Selector> for Selector {
	fn from(value: &Selector) -> Self {
		value.clone()
	}
}

impl fmt::Display for Selector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Selector::Name(name) => f.write_str(name),
			Selector::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_wildcard_normalises_to_pattern() {
		let selector = Selector::from("*");
		assert!(selector.is_pattern());
		assert!(selector.is_wildcard());
		assert!(selector.matches("anything"));
		assert!(selector.matches(""));
	}

	#[test]
	fn test_literal_matches_exact_name_only() {
		let selector = Selector::from("tick");
		assert!(selector.matches("tick"));
		assert!(!selector.matches("tick2"));
		assert_eq!(selector.key(), "tick");
	}

	#[test]
	fn test_pattern_canonical_key_is_source() {
		let selector = Selector::from(Regex::new("^foo.*$").unwrap());
		assert_eq!(selector.key(), "^foo.*$");
		assert!(selector.matches("foobar"));
		assert!(!selector.matches("barfoo"));
	}

	#[test]
	fn test_empty_name_is_invalid() {
		let err = Selector::from("").validate().unwrap_err();
		assert!(err.is_invalid());
	}
}
