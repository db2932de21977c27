use calltrace_engine::naming::base_name;
use calltrace_engine::synthetic::{SyntheticStack, SyntheticValue};
use calltrace_engine::{
    ArgEntry, CallEntry, StopEvent, StopReason, Tid, TraceConfig, TraceDocument, TraceSession,
    TraceStatus, NO_PARENT,
};
use proptest::prelude::*;
use std::collections::HashSet;

const FUNCTIONS: &[&str] = &[
    "app::a",
    "app::b",
    "app::Widget::update",
    "app::helpers::c::h0123456789abcdef",
    "app::route",
    "lib_other::visit",
    "std::rt::lang_start_internal",
    "core::ops::function::FnOnce::call_once",
    "main",
];

/// (スレッド, 内側から外側へのフレーム) の列
fn events() -> impl Strategy<Value = Vec<(i32, Vec<usize>)>> {
    prop::collection::vec(
        (1..4i32, prop::collection::vec(0..FUNCTIONS.len(), 1..7)),
        0..40,
    )
}

fn build_stack(frames: &[usize]) -> SyntheticStack {
    frames.iter().enumerate().fold(SyntheticStack::new(), |stack, (i, f)| {
        stack.frame_with_args(
            FUNCTIONS[*f],
            Some(("src/lib.rs", 10 + i as u32)),
            vec![SyntheticValue::u64_value("x", *f as u64)],
        )
    })
}

fn replay(config: TraceConfig, events: &[(i32, Vec<usize>)]) -> TraceSession {
    let session = TraceSession::new(config);
    session.start(None).unwrap();
    for (tid, frames) in events {
        session.on_entry(Tid(*tid), &build_stack(frames));
    }
    session
}

proptest! {
    #[test]
    fn call_ids_and_parents_are_consistent(events in events(), retire in any::<bool>()) {
        let config = TraceConfig { retire_returned: retire, ..TraceConfig::default() };
        let session = replay(config, &events);
        let doc = session.stop(&StopEvent::new(StopReason::Exited(0))).unwrap();

        let mut seen = HashSet::new();
        let mut previous = 0;
        for call in &doc.calls {
            prop_assert!(call.call_id > previous);
            previous = call.call_id;
            prop_assert!(
                call.parent_call_id == NO_PARENT || seen.contains(&call.parent_call_id),
                "parent {} of {} not recorded earlier", call.parent_call_id, call.call_id
            );
            seen.insert(call.call_id);
        }
        prop_assert_eq!(doc.status, TraceStatus::Success);
    }

    #[test]
    fn forward_only_records_each_base_name_once_per_thread(events in events()) {
        let config = TraceConfig { retire_returned: false, ..TraceConfig::default() };
        let session = replay(config, &events);

        let mut keys = HashSet::new();
        for record in session.records() {
            prop_assert!(
                keys.insert((record.tid, base_name(&record.function))),
                "duplicate record for {} on {:?}", record.function, record.tid
            );
        }
    }

    #[test]
    fn document_json_round_trips(
        values in prop::collection::vec(any::<String>(), 0..6),
        message in proptest::option::of(any::<String>()),
    ) {
        let doc = TraceDocument {
            status: if message.is_some() { TraceStatus::Error } else { TraceStatus::Success },
            calls: vec![CallEntry {
                call_id: 1,
                parent_call_id: NO_PARENT,
                function: "app::a".to_string(),
                file: "src/lib.rs".to_string(),
                line: 1,
                args: values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| ArgEntry { name: format!("arg{}", i), value: v.clone() })
                    .collect(),
                error: message.as_ref().map(|_| true),
                error_message: message.clone(),
            }],
        };
        let json = doc.to_json().unwrap();
        prop_assert_eq!(TraceDocument::from_json(&json).unwrap(), doc);
    }
}
