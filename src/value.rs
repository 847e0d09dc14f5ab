//! The primitive value set transferred between process isolates.
//!
//! A channel rendezvous (or a `newproc` argument list) only ever moves a
//! small, closed set of primitive types across the isolate boundary: nil,
//! booleans, integers, floats, and byte strings. Everything else -- tables,
//! functions, foreign pointers, closures over a non-global environment --
//! fails the copy and is reported to both sides of the rendezvous.

use crate::error::RuntimeError;

/// Maximum number of values a single send/broadcast payload may carry.
///
/// A destination isolate's value stack is bounded, and a payload that would
/// overflow it is rejected before any partial copy is made visible.
pub const MAX_CHANNEL_PAYLOAD: usize = 256;

/// A value that can cross an isolate boundary.
///
/// `Unsupported` stands in for whatever the embedding language's
/// non-primitive values are (tables, functions, foreign pointers, ...). It
/// exists purely so this crate's own tests can exercise the
/// `UnsupportedValue` error path without a real scripting front end; a real
/// embedder would never construct one directly, since its host values that
/// map to a `Value` variant are the only ones it would ever push onto a
/// process's argument/return list.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    /// A value of the named type that this runtime cannot transfer.
    Unsupported(&'static str),
}

impl Value {
    /// The type name used in diagnostics
    /// (e.g. `"failed to copy value: unsupported type 'table'"`).
    fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "number",
            Value::Bytes(_) => "string",
            Value::Unsupported(name) => name,
        }
    }

    fn is_supported(&self) -> bool {
        !matches!(self, Value::Unsupported(_))
    }
}

/// Deep-copy a payload for transfer between isolates.
///
/// Returns `UnsupportedValue` naming the first offending value if any
/// element cannot be represented on the other side, and `StackFull` if the
/// payload exceeds [`MAX_CHANNEL_PAYLOAD`]. Neither error leaves a partial
/// copy behind: the input is only cloned once every element has been
/// validated.
pub(crate) fn copy_values(values: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
    if values.len() > MAX_CHANNEL_PAYLOAD {
        return Err(RuntimeError::StackFull(values.len()));
    }
    if let Some(bad) = values.iter().find(|v| !v.is_supported()) {
        return Err(RuntimeError::UnsupportedValue(format!(
            "failed to copy value: unsupported type '{}'",
            bad.type_name()
        )));
    }
    // Every element is a plain owned Rust value (or an owned Vec<u8>), so
    // this clone already is a deep copy between two isolates' heaps.
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_supported_values() {
        let values = vec![
            Value::Nil,
            Value::Bool(true),
            Value::Int(42),
            Value::Float(1.5),
            Value::Bytes(b"hello".to_vec()),
        ];
        let copied = copy_values(values.clone()).unwrap();
        assert_eq!(copied, values);
    }

    #[test]
    fn unsupported_value_is_rejected() {
        let err = copy_values(vec![Value::Unsupported("table")]).unwrap_err();
        match err {
            RuntimeError::UnsupportedValue(msg) => {
                assert!(msg.contains("unsupported type 'table'"), "{msg}");
            }
            other => panic!("expected UnsupportedValue, got {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_is_stack_full() {
        let values: Vec<Value> = (0..(MAX_CHANNEL_PAYLOAD + 1))
            .map(|i| Value::Int(i as i64))
            .collect();
        assert!(matches!(
            copy_values(values).unwrap_err(),
            RuntimeError::StackFull(_)
        ));
    }
}
