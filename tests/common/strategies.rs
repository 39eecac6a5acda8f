use proptest::prelude::*;

/// One recorded primary-store outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

pub fn call_outcome_strategy() -> impl Strategy<Value = CallOutcome> {
    prop_oneof![Just(CallOutcome::Success), Just(CallOutcome::Failure)]
}

pub fn call_sequence_strategy() -> impl Strategy<Value = Vec<CallOutcome>> {
    prop::collection::vec(call_outcome_strategy(), 0..64)
}

/// Per-call costs, including zero and negative values the breaker must ignore
pub fn cost_sequence_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(prop_oneof![Just(0.0), Just(-1.0), 0.01f64..5.0], 1..40)
}

/// Heartbeat timestamps in milliseconds, in arbitrary order
pub fn heartbeat_sequence_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..10_000_000_000_000, 1..20)
}

/// Free-form message text, sometimes carrying a routing keyword
pub fn message_strategy() -> impl Strategy<Value = String> {
    (
        "[a-z ]{0,40}",
        prop::option::of(prop_oneof![
            Just("DEPLOY"),
            Just("Research"),
            Just("security"),
            Just("incident"),
        ]),
        "[a-z ]{0,40}",
    )
        .prop_map(|(head, keyword, tail)| format!("{head}{}{tail}", keyword.unwrap_or("")))
}
