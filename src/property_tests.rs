//! Property-based tests for version ordering and write-group bounds

#[cfg(test)]
mod tests {
    use crate::events::EventBus;
    use crate::schema::{
        CollectionSchemaDefinition, FieldDefinition, FieldType, SchemaDefinition, SchemaVersion,
        VersionRegistry,
    };
    use crate::store::{to_document, MemoryStore, Mutation, WriteBatcher};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn schema(version: SchemaVersion) -> SchemaDefinition {
        SchemaDefinition::new(
            "catalog",
            version,
            vec![CollectionSchemaDefinition::new(
                "items",
                vec![FieldDefinition::new("sku", FieldType::String)],
            )],
        )
        .breaking()
    }

    proptest! {
        #[test]
        fn test_version_order_matches_components(
            a in (0u64..20, 0u64..20, 0u64..20),
            b in (0u64..20, 0u64..20, 0u64..20),
        ) {
            let va = SchemaVersion::new(a.0, a.1, a.2);
            let vb = SchemaVersion::new(b.0, b.1, b.2);
            prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
            prop_assert_eq!(SchemaVersion::parse(&va.to_string()).unwrap(), va);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_current_version_never_decreases(
            versions in prop::collection::vec((0u64..4, 0u64..6, 0u64..3), 1..12),
        ) {
            let rt = runtime();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let store = Arc::new(MemoryStore::new());
                let registry = VersionRegistry::new(store, EventBus::new());
                let mut registered = BTreeSet::new();
                let mut previous: Option<SchemaVersion> = None;

                for (major, minor, patch) in versions {
                    let version = SchemaVersion::new(major, minor, patch);
                    let outcome = registry.register_schema(schema(version)).await;
                    if registered.insert(version) {
                        let outcome = outcome.unwrap();
                        prop_assert_eq!(outcome.advanced_current, previous.map_or(true, |p| version > p));
                    } else {
                        prop_assert!(outcome.is_err());
                    }

                    let current = registry.get_current_version().await.unwrap();
                    prop_assert_eq!(current, registered.iter().next_back().copied());
                    if let (Some(before), Some(now)) = (previous, current) {
                        prop_assert!(now >= before);
                    }
                    previous = current;
                }
                Ok(())
            });
            result?;
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn test_write_groups_stay_within_cap(
            documents in 0usize..300,
            cap in 1usize..40,
            limit in 1usize..60,
        ) {
            let rt = runtime();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let store = MemoryStore::with_write_group_limit(cap);
                let mut batcher = WriteBatcher::with_limit(&store, limit, false);
                for i in 0..documents {
                    let data = to_document(&json!({ "n": i })).unwrap();
                    batcher
                        .push(Mutation::Set {
                            collection: "items".to_string(),
                            id: format!("doc-{i}"),
                            data,
                        })
                        .await
                        .unwrap();
                }
                batcher.flush().await.unwrap();

                let sizes = store.commit_sizes().await;
                let bound = cap.min(limit);
                prop_assert!(sizes.iter().all(|size| *size <= bound));
                prop_assert_eq!(sizes.iter().sum::<usize>(), documents);
                prop_assert_eq!(store.snapshot("items").await.len(), documents);
                Ok(())
            });
            result?;
        }
    }
}
