//! Declarative value decoding for boundary payloads.
//!
//! The runtime consumes this engine at its edges: inbound port payloads and
//! program flags are externally supplied [`serde_json::Value`]s that must be
//! converted into typed values before they may enter the system. A
//! [`Decoder`] either produces the typed value or a [`DecodeError`] — a
//! structured trail of field names and array indices ending in a description
//! of what was expected.
//!
//! Decoders are cheap to clone and compose with [`Decoder::map`] and
//! [`Decoder::and_then`].

use core::fmt;
use serde_json::Value;
use std::rc::Rc;

/// A decoder from JSON values to `T`.
pub struct Decoder<T> {
    run: Rc<dyn Fn(&Value) -> Result<T, DecodeError>>,
}

impl<T> Clone for Decoder<T> {
    fn clone(&self) -> Self {
        Self {
            run: Rc::clone(&self.run),
        }
    }
}

impl<T> fmt::Debug for Decoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Decoder(..)")
    }
}

impl<T: 'static> Decoder<T> {
    fn new(run: impl Fn(&Value) -> Result<T, DecodeError> + 'static) -> Self {
        Self { run: Rc::new(run) }
    }

    /// Runs the decoder against a value.
    pub fn run(&self, value: &Value) -> Result<T, DecodeError> {
        (self.run)(value)
    }

    /// Transforms the decoded value.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + 'static) -> Decoder<U> {
        Decoder::new(move |value| self.run(value).map(&f))
    }

    /// Chains a decoder chosen from the decoded value.
    #[must_use]
    pub fn and_then<U: 'static>(self, f: impl Fn(T) -> Decoder<U> + 'static) -> Decoder<U> {
        Decoder::new(move |value| f(self.run(value)?).run(value))
    }
}

/// Decodes a JSON integer.
#[must_use]
pub fn int() -> Decoder<i64> {
    Decoder::new(|value| match value.as_i64() {
        Some(n) => Ok(n),
        None => Err(DecodeError::expecting("an INT", value)),
    })
}

/// Decodes a JSON number.
#[must_use]
pub fn float() -> Decoder<f64> {
    Decoder::new(|value| match value.as_f64() {
        Some(n) => Ok(n),
        None => Err(DecodeError::expecting("a FLOAT", value)),
    })
}

/// Decodes a JSON boolean.
#[must_use]
pub fn boolean() -> Decoder<bool> {
    Decoder::new(|value| match value.as_bool() {
        Some(b) => Ok(b),
        None => Err(DecodeError::expecting("a BOOL", value)),
    })
}

/// Decodes a JSON string.
#[must_use]
pub fn string() -> Decoder<String> {
    Decoder::new(|value| match value.as_str() {
        Some(s) => Ok(s.to_string()),
        None => Err(DecodeError::expecting("a STRING", value)),
    })
}

/// Accepts any JSON value unchanged.
#[must_use]
pub fn value() -> Decoder<Value> {
    Decoder::new(|value| Ok(value.clone()))
}

/// Always succeeds with a fixed value, ignoring the input.
#[must_use]
pub fn succeed<T: Clone + 'static>(value: T) -> Decoder<T> {
    Decoder::new(move |_| Ok(value.clone()))
}

/// Always fails with the given message.
#[must_use]
pub fn fail<T: 'static>(message: &str) -> Decoder<T> {
    let message = message.to_string();
    Decoder::new(move |value| {
        Err(DecodeError::Failure {
            message: message.clone(),
            found: value.clone(),
        })
    })
}

/// Decodes the named field of a JSON object.
#[must_use]
pub fn field<T: 'static>(name: &str, decoder: Decoder<T>) -> Decoder<T> {
    let name = name.to_string();
    Decoder::new(move |value| match value.get(&name) {
        Some(inner) => decoder
            .run(inner)
            .map_err(|err| DecodeError::Field(name.clone(), Box::new(err))),
        None => Err(DecodeError::expecting(
            &format!("an OBJECT with a field named `{name}`"),
            value,
        )),
    })
}

/// Decodes the element at `at` of a JSON array.
#[must_use]
pub fn index<T: 'static>(at: usize, decoder: Decoder<T>) -> Decoder<T> {
    Decoder::new(move |value| match value.as_array() {
        Some(items) => match items.get(at) {
            Some(inner) => decoder
                .run(inner)
                .map_err(|err| DecodeError::Index(at, Box::new(err))),
            None => Err(DecodeError::expecting(
                &format!(
                    "a LONGER array. Need index {at} but only see {} entries",
                    items.len()
                ),
                value,
            )),
        },
        None => Err(DecodeError::expecting("an ARRAY", value)),
    })
}

/// Decodes every element of a JSON array.
#[must_use]
pub fn list<T: 'static>(decoder: Decoder<T>) -> Decoder<Vec<T>> {
    Decoder::new(move |value| match value.as_array() {
        Some(items) => items
            .iter()
            .enumerate()
            .map(|(i, inner)| {
                decoder
                    .run(inner)
                    .map_err(|err| DecodeError::Index(i, Box::new(err)))
            })
            .collect(),
        None => Err(DecodeError::expecting("a LIST", value)),
    })
}

/// A structured decoding failure: the trail of fields and indices leading to
/// the value that did not match, ending in a description of what was
/// expected.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The failure happened inside the named object field.
    Field(String, Box<DecodeError>),
    /// The failure happened at the given array index.
    Index(usize, Box<DecodeError>),
    /// The value itself did not match.
    Failure {
        /// What the decoder was expecting, e.g. `"Expecting an INT"`.
        message: String,
        /// The offending value.
        found: Value,
    },
}

impl DecodeError {
    fn expecting(description: &str, found: &Value) -> Self {
        Self::Failure {
            message: format!("Expecting {description}"),
            found: found.clone(),
        }
    }

    /// The innermost failure message, without the field/index trail.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Field(_, inner) | Self::Index(_, inner) => inner.message(),
            Self::Failure { message, .. } => message,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name, inner) => write!(f, "field `{name}`: {inner}"),
            Self::Index(at, inner) => write!(f, "index {at}: {inner}"),
            Self::Failure { message, found } => write!(f, "{message}, found {found}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn int_accepts_integral_numbers_only() {
        assert_eq!(int().run(&json!(42)), Ok(42));
        let err = int().run(&json!("not a number")).unwrap_err();
        assert_eq!(err.message(), "Expecting an INT");
        let err = int().run(&json!(1.5)).unwrap_err();
        assert_eq!(err.message(), "Expecting an INT");
    }

    #[test]
    fn field_wraps_the_trail() {
        let decoder = field("count", int());
        let err = decoder.run(&json!({ "count": "three" })).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Field(
                "count".to_string(),
                Box::new(DecodeError::Failure {
                    message: "Expecting an INT".to_string(),
                    found: json!("three"),
                })
            )
        );
        assert!(err.to_string().contains("field `count`"));
    }

    #[test]
    fn missing_field_names_the_field() {
        let err = field("count", int()).run(&json!({})).unwrap_err();
        assert_eq!(
            err.message(),
            "Expecting an OBJECT with a field named `count`"
        );
    }

    #[test]
    fn list_reports_the_failing_index() {
        let err = list(int()).run(&json!([1, 2, "x"])).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Index(
                2,
                Box::new(DecodeError::Failure {
                    message: "Expecting an INT".to_string(),
                    found: json!("x"),
                })
            )
        );
    }

    #[test]
    fn index_out_of_range_mentions_the_length() {
        let err = index(3, int()).run(&json!([1])).unwrap_err();
        assert!(err.message().contains("Need index 3"));
    }

    #[test]
    fn map_and_then_compose() {
        let even = int().and_then(|n| {
            if n % 2 == 0 {
                succeed(n)
            } else {
                fail("Expecting an even INT")
            }
        });
        assert_eq!(even.run(&json!(4)), Ok(4));
        assert!(even.run(&json!(3)).is_err());
        assert_eq!(int().map(|n| n * 2).run(&json!(21)), Ok(42));
    }
}
