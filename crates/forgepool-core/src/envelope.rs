//! Wire envelopes. One duplex, ordered, structured channel per worker;
//! IDs are unsigned integers, scoped per direction per connection.

use crate::value::Value;
use serde::{Deserialize, Serialize};

pub type TaskId = u64;

/// A marshalled error record: `{ name, message, stack, ...fields }`.
/// `fields` carries whatever own-enumerable data the original error had
/// beyond `name`/`message`/`stack`; for a
/// [`crate::error::PoolError::Handler`] this is the user handler's error
/// payload, for the built-in kinds it is `Value::Null`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub fields: Value,
}

/// The nine envelope kinds that make up the wire protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Envelope {
    Request {
        id: TaskId,
        method: String,
        params: Vec<Value>,
    },
    Response {
        id: TaskId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<RemoteError>,
    },
    Event {
        id: TaskId,
        payload: Value,
    },
    Abort {
        id: TaskId,
    },
    AbortAck {
        id: TaskId,
    },
    Ready,
    TerminateRequest,
    TerminateAck,
    /// Reports an error that was swallowed worker-side (an event
    /// handler, abort callback, or cleanup hook failed) so the pool can
    /// count it in `PoolStats::swallowed_errors` without the failure
    /// settling an unrelated task. `task_id` is `None` for a cleanup-hook
    /// failure, which isn't scoped to any one call.
    SwallowedError {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        task_id: Option<TaskId>,
        message: String,
    },
}

impl Envelope {
    pub fn ok_response(id: TaskId, result: Value) -> Self {
        Envelope::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err_response(id: TaskId, error: RemoteError) -> Self {
        Envelope::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// The task id an envelope is scoped to, if any (`Ready`,
    /// `TerminateRequest` and `TerminateAck` are connection-scoped, not
    /// task-scoped).
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Envelope::Request { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::Event { id, .. }
            | Envelope::Abort { id }
            | Envelope::AbortAck { id } => Some(*id),
            Envelope::SwallowedError { task_id, .. } => *task_id,
            Envelope::Ready | Envelope::TerminateRequest | Envelope::TerminateAck => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn request_round_trips() {
        let envelope = Envelope::Request {
            id: 7,
            method: "fib".to_string(),
            params: vec![Value::Number(40.0)],
        };
        let encoded = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.task_id(), Some(7));
    }

    #[test]
    fn connection_scoped_envelopes_have_no_task_id() {
        assert_eq!(Envelope::Ready.task_id(), None);
        assert_eq!(Envelope::TerminateRequest.task_id(), None);
        assert_eq!(Envelope::TerminateAck.task_id(), None);
    }

    /// A finite `f64` range keeps every generated `Value::Number` inside
    /// what `serde_json` can actually encode; NaN/Infinity have no JSON
    /// representation and would fail the round-trip for reasons that have
    /// nothing to do with the envelope codec under test.
    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            (-1e9..1e9f64).prop_map(Value::Number),
            ".*".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 16, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec((".*", inner), 0..4).prop_map(Value::Object),
            ]
        })
    }

    fn arb_envelope() -> impl Strategy<Value = Envelope> {
        prop_oneof![
            (any::<u64>(), ".*", prop::collection::vec(arb_value(), 0..4)).prop_map(
                |(id, method, params)| Envelope::Request { id, method, params }
            ),
            (any::<u64>(), arb_value()).prop_map(|(id, result)| Envelope::ok_response(id, result)),
            (any::<u64>(), arb_value()).prop_map(|(id, payload)| Envelope::Event { id, payload }),
            any::<u64>().prop_map(|id| Envelope::Abort { id }),
            any::<u64>().prop_map(|id| Envelope::AbortAck { id }),
            Just(Envelope::Ready),
            Just(Envelope::TerminateRequest),
            Just(Envelope::TerminateAck),
        ]
    }

    proptest! {
        /// Every envelope kind the wire protocol carries survives a
        /// JSON round-trip with its `task_id()` unchanged.
        #[test]
        fn envelope_round_trips_through_json(envelope in arb_envelope()) {
            let before_id = envelope.task_id();
            let encoded = serde_json::to_vec(&envelope).unwrap();
            let decoded: Envelope = serde_json::from_slice(&encoded).unwrap();
            prop_assert_eq!(decoded.task_id(), before_id);
        }
    }
}
