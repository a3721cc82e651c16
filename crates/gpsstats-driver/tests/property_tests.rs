//! Property tests for change detection and payload encoding

mod common;

use common::reading;
use gpsstats_driver::{payload, ChangeResult, Differ, Snapshot};
use gpsstats_protocol::FixMode;
use proptest::prelude::*;
use serde_json::Value;

proptest! {
    /// A reading identical to the last published one never republishes
    #[test]
    fn repeated_reading_is_noop(used in 1u32..24, extra in 0u32..12, tdop in 0.1..20.0f64) {
        let mut differ = Differ::new();
        let data = reading(used, used + extra, tdop);
        prop_assert!(matches!(differ.observe(&data), ChangeResult::Publish(_)));
        prop_assert_eq!(differ.observe(&data), ChangeResult::NoOp);
    }

    /// Readings without a fix or without used satellites leave the differ untouched
    #[test]
    fn unpublishable_reading_keeps_last(visible in 0u32..24, tdop in 0.1..20.0f64) {
        let mut differ = Differ::new();
        let first = reading(4, 8, 1.0);
        differ.observe(&first);

        let mut no_fix = reading(4, 8, tdop);
        no_fix.fix_mode = FixMode::NoFix;
        prop_assert_eq!(differ.observe(&no_fix), ChangeResult::NoOp);
        prop_assert_eq!(differ.observe(&reading(0, visible, tdop)), ChangeResult::NoOp);
        let expected = Snapshot::from_reading(&first);
        prop_assert_eq!(differ.last(), expected.as_ref());
    }

    /// A change in satellite counts always publishes
    #[test]
    fn count_change_publishes(used in 1u32..24, delta in 1u32..8) {
        let mut differ = Differ::new();
        differ.observe(&reading(used, used + 10, 1.0));
        let changed = reading(used + delta, used + 10, 1.0);
        prop_assert!(matches!(differ.observe(&changed), ChangeResult::Publish(_)));
    }

    /// The payload is valid JSON carrying the snapshot's counts verbatim
    #[test]
    fn payload_carries_counts(
        used in 1u32..64,
        extra in 0u32..64,
        tdop in 0.01..100.0f64,
        q_err in any::<i64>(),
    ) {
        let mut data = reading(used, used + extra, tdop);
        data.q_err = q_err;
        let snapshot = Snapshot::from_reading(&data).unwrap();
        let value: Value = serde_json::from_slice(&payload::encode(&snapshot).unwrap()).unwrap();

        prop_assert_eq!(&value["sats_used"], &Value::from(used));
        prop_assert_eq!(&value["sats_visible"], &Value::from(used + extra));
        prop_assert_eq!(value["tdop"].as_f64(), Some(tdop));
        prop_assert_eq!(value.get("qErr").is_some(), q_err != 0);
        prop_assert_eq!(&value["sats.gps"], &Value::from(used));
    }
}

#[test]
fn test_payload_float_parses_back_exactly() {
    let tdop = 48.300543091469116;
    let snapshot = Snapshot::from_reading(&reading(1, 1, tdop)).unwrap();
    let value: Value = serde_json::from_slice(&payload::encode(&snapshot).unwrap()).unwrap();
    assert_eq!(value["tdop"].as_f64(), Some(tdop));
}
