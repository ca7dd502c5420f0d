// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn catalog_has_eighty_entries() {
    assert_eq!(CATALOG.len(), 80);
}

#[test]
fn known_classes() {
    assert!(is_known("person"));
    assert!(is_known("truck"));
    assert!(!is_known("Person"));
    assert!(!is_known("unicorn"));
}

#[test]
fn empty_filter_is_valid() {
    assert!(validate_filter(&[]).is_ok());
}

#[test]
fn filter_with_unknown_class_is_rejected() {
    let filter = vec!["person".to_owned(), "dragon".to_owned()];
    let msg = validate_filter(&filter).err().map(|e| e.to_string()).unwrap_or_default();
    assert!(msg.contains("dragon"));
}
