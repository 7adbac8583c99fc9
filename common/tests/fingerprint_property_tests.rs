// Property-based tests for obligation fingerprints

use common::fingerprint::{fingerprint, short};
use common::models::ObligationKind;
use proptest::prelude::*;

fn kind() -> impl Strategy<Value = ObligationKind> {
    prop_oneof![
        Just(ObligationKind::FilingDue),
        Just(ObligationKind::PaymentDue),
        Just(ObligationKind::EstimateReminder),
        Just(ObligationKind::Overdue),
    ]
}

/// *For any* identity fields, the fingerprint is the same on every call
#[test]
fn property_fingerprint_is_stable() {
    proptest!(|(
        taxpayer in "[A-Za-z0-9-]{1,24}",
        period in "[0-9]{4}(-Q[1-4]|-[01][0-9])?",
        category in kind(),
    )| {
        let first = fingerprint(&taxpayer, &period, category);
        let second = fingerprint(&taxpayer, &period, category);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 64);
        prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(short(&first).len(), 12);
    });
}

/// *For any* two identities that differ in a field, fingerprints differ
#[test]
fn property_fingerprint_distinguishes_identities() {
    proptest!(|(
        a in ("[a-z0-9]{0,8}", "[a-z0-9]{0,8}", kind()),
        b in ("[a-z0-9]{0,8}", "[a-z0-9]{0,8}", kind()),
    )| {
        prop_assume!(a != b);
        prop_assert_ne!(fingerprint(&a.0, &a.1, a.2), fingerprint(&b.0, &b.1, b.2));
    });
}

/// Moving characters between fields must not collide
#[test]
fn property_field_boundaries_are_unambiguous() {
    proptest!(|(
        left in "[a-z]{1,6}",
        right in "[a-z]{1,6}",
        category in kind(),
    )| {
        let joined = format!("{}{}", left, right);
        prop_assert_ne!(
            fingerprint(&left, &right, category),
            fingerprint(&joined, "", category)
        );
    });
}
