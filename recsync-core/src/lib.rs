//! recsync Core - Record and Query Types
//!
//! Pure data structures shared by every other crate: records and their
//! lifecycle flags, field transforms, identities, query payloads,
//! configuration and errors. Nothing in this crate performs I/O.

pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod query;
pub mod record;
pub mod transform;

pub use config::SyncConfig;
pub use constants::*;
pub use error::{
    ConfigError, ReconciliationError, StorageError, SyncError, SyncResult, TransformError,
    TransportError,
};
pub use identity::{stable_hash, BusinessKey, ClientToken, CollectionId};
pub use query::{merge_params, Filter, Params, QueryPayload, Sort, SortDirection};
pub use record::{field_map, FieldMap, FieldValue, Record, RecordFlags, RecordModel, WireMap};
pub use transform::{FieldCodec, FieldSchema, FieldSpec, FieldType, Transform};

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_field_value() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            Just(FieldValue::Null),
            any::<bool>().prop_map(FieldValue::Bool),
            any::<i64>().prop_map(FieldValue::Integer),
            "[a-z]{0,12}".prop_map(FieldValue::Text),
        ]
    }

    fn arb_fields() -> impl Strategy<Value = FieldMap> {
        prop::collection::btree_map("[a-z]{1,8}", arb_field_value(), 0..8)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Every mutator marks the record modified and advances its revision.
        #[test]
        fn prop_mutation_marks_modified(initial in arb_fields(), partial in arb_fields(), ghost in any::<bool>()) {
            let mut record = Record::new(initial, ghost);
            let before = record.revision();
            record.set_data(partial.clone());

            prop_assert!(record.is_modified());
            prop_assert_eq!(record.is_ghost(), ghost);
            prop_assert!(record.revision() > before);
            for (key, value) in &partial {
                let got = record.get(key);
                prop_assert_eq!(got.as_ref(), Some(value));
            }
        }

        /// Hashes depend on content only.
        #[test]
        fn prop_stable_hash_is_deterministic(page in 1u32..100, limit in 1u32..500, key in "[a-z]{1,6}", value in any::<i64>()) {
            let mut a = QueryPayload::new(page, limit);
            a.params.insert(key.clone(), serde_json::json!(value));
            let b = a.clone();
            prop_assert_eq!(stable_hash(&a), stable_hash(&b));

            let mut c = a.clone();
            c.page = page + 1;
            prop_assert_ne!(stable_hash(&a), stable_hash(&c));
        }

        /// Untyped fields survive an encode/decode pass unchanged.
        #[test]
        fn prop_untyped_fields_pass_through(fields in arb_fields()) {
            let transform = Transform::new();
            let schema = FieldSchema::new();
            let wire = transform.encode(&fields, &schema).unwrap();
            let back = transform.decode(&wire, &schema).unwrap();
            prop_assert_eq!(back, fields);
        }

        /// Oversized pages are rejected.
        #[test]
        fn prop_config_rejects_oversized_page(page_size in (MAX_PAGE_SIZE + 1)..u32::MAX) {
            let config = SyncConfig::default().with_page_size(page_size);
            prop_assert!(config.validate().is_err());
        }
    }
}
