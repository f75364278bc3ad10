#[cfg(test)]
mod tests {
    use crate::error::{Error, StoreError};
    use crate::store::Session;
    use crate::testing::{parent_key, RelationalEntity, TestDatabase, SHARDS, UPDATE_BY_KEY_TWO};
    use crate::types::{Criteria, UpdateOperationMeta, UpdateOutcome};
    use test_log::test;

    fn by_key_two(key_two: &str) -> Criteria<RelationalEntity> {
        let key_two = key_two.to_string();
        Criteria::new(format!("key_two = {}", key_two), move |e: &RelationalEntity| {
            e.key_two == key_two
        })
    }

    fn set_value(key_two: &str, value: &str) -> UpdateOperationMeta {
        UpdateOperationMeta::new(UPDATE_BY_KEY_TWO)
            .with_param("keyTwo", key_two)
            .with_param("value", value)
    }

    #[test]
    fn test_save_and_get() {
        let t = TestDatabase::new(SHARDS);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();

        let saved = dao
            .save(&parent, RelationalEntity::new("e1", "k2", "v1"))
            .unwrap();
        assert_eq!(saved.key, "e1");

        let found = dao.get(&parent, &"e1".to_string()).unwrap();
        assert_eq!(found, Some(saved));
        assert!(dao.get(&parent, &"missing".to_string()).unwrap().is_none());

        // Only the shard owning the parent key holds the row
        let shard = dao.shard_id(&parent).unwrap() as usize;
        assert_eq!(t.stores[shard].committed_rows("relational_entities"), 1);
        assert_eq!(t.committed_rows("relational_entities"), 1);
    }

    #[test]
    fn test_get_and_save_with_handlers() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();

        let key = dao
            .save_with(&parent, RelationalEntity::new("e1", "k2", "v1"), |e| e.key)
            .unwrap();
        assert_eq!(key, "e1");

        let value = dao
            .get_with(&parent, &key, |found| found.map(|e| e.value))
            .unwrap();
        assert_eq!(value.as_deref(), Some("v1"));
    }

    #[test]
    fn test_save_duplicate_is_transaction_failure() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();

        dao.save(&parent, RelationalEntity::new("e1", "k2", "v1")).unwrap();
        let err = dao
            .save(&parent, RelationalEntity::new("e1", "k2", "v2"))
            .unwrap_err();

        match &err {
            Error::Transaction { operation, .. } => assert_eq!(*operation, "save"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            err.find_store_error(),
            Some(StoreError::DuplicateKey { .. })
        ));
        assert_eq!(
            dao.get(&parent, &"e1".to_string()).unwrap().unwrap().value,
            "v1"
        );
    }

    #[test]
    fn test_save_all_is_atomic() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();

        let saved = dao
            .save_all(
                &parent,
                vec![
                    RelationalEntity::new("a", "k", "1"),
                    RelationalEntity::new("b", "k", "2"),
                ],
            )
            .unwrap();
        assert_eq!(saved.len(), 2);

        let result = dao.save_all(
            &parent,
            vec![
                RelationalEntity::new("c", "k", "3"),
                RelationalEntity::new("a", "k", "dup"),
            ],
        );
        assert!(result.is_err());
        assert!(!dao.exists(&parent, &"c".to_string()).unwrap());
        assert_eq!(t.committed_rows("relational_entities"), 2);
    }

    #[test]
    fn test_update_by_key_outcomes() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();
        let key = "e1".to_string();
        dao.save(&parent, RelationalEntity::new("e1", "k2", "v1")).unwrap();

        let updated = dao
            .update(&parent, &key, |mut e| {
                e.value = "v2".into();
                Some(e)
            })
            .unwrap();
        assert!(updated);
        assert_eq!(dao.get(&parent, &key).unwrap().unwrap().value, "v2");

        // Rejected and missing are both "no write", but distinguishable
        assert_eq!(
            dao.try_update(&parent, &key, |_| None).unwrap(),
            UpdateOutcome::Rejected
        );
        assert_eq!(
            dao.try_update(&parent, &"nope".to_string(), Some).unwrap(),
            UpdateOutcome::NotFound
        );
        assert!(!dao.update(&parent, &key, |_| None).unwrap());
        assert_eq!(dao.get(&parent, &key).unwrap().unwrap().value, "v2");
    }

    #[test]
    fn test_update_matching_first_only() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();
        dao.save(&parent, RelationalEntity::new("a", "same", "0")).unwrap();
        dao.save(&parent, RelationalEntity::new("b", "same", "0")).unwrap();

        let outcome = dao
            .update_matching(&parent, &by_key_two("same"), |mut e| {
                e.value = "1".into();
                Some(e)
            })
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);

        let rows = dao.select(&parent, &by_key_two("same"), 0, 10).unwrap();
        let values: Vec<_> = rows.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["1", "0"]);

        assert_eq!(
            dao.update_matching(&parent, &by_key_two("other"), Some).unwrap(),
            UpdateOutcome::NotFound
        );
    }

    #[test]
    fn test_update_all_writes_nothing_on_rejection() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();
        for key in ["a", "b", "c"] {
            dao.save(&parent, RelationalEntity::new(key, "grp", "0")).unwrap();
        }

        let outcome = dao
            .update_all(&parent, 0, 10, &by_key_two("grp"), |e| {
                (e.key != "c").then(|| RelationalEntity {
                    value: "1".into(),
                    ..e.clone()
                })
            })
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Rejected);
        let untouched = dao
            .select(&parent, &by_key_two("grp"), 0, 10)
            .unwrap()
            .iter()
            .all(|e| e.value == "0");
        assert!(untouched);

        let outcome = dao
            .update_all(&parent, 1, 2, &by_key_two("grp"), |e| {
                Some(RelationalEntity {
                    value: "2".into(),
                    ..e.clone()
                })
            })
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);

        let values: Vec<_> = dao
            .select(&parent, &by_key_two("grp"), 0, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(values, vec!["0", "2", "2"]);

        assert_eq!(
            dao.update_all(&parent, 0, 10, &by_key_two("none"), |e| Some(e.clone()))
                .unwrap(),
            UpdateOutcome::NotFound
        );
    }

    #[test]
    fn test_select_update_using_query_end_to_end() {
        let t = TestDatabase::new(SHARDS);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();

        dao.save(&parent, RelationalEntity::new("first", "shared", "initial"))
            .unwrap();
        dao.save(&parent, RelationalEntity::new("second", "shared", "initial"))
            .unwrap();

        let rows = dao.select(&parent, &by_key_two("shared"), 0, 10).unwrap();
        let keys: Vec<_> = rows.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["first", "second"]);
        assert_eq!(dao.count(&parent, &by_key_two("shared")).unwrap(), 2);

        let changed = dao
            .update_using_query(&parent, &set_value("shared", "updated"))
            .unwrap();
        assert_eq!(changed, 2);
        for key in ["first", "second"] {
            let row = dao.get(&parent, &key.to_string()).unwrap().unwrap();
            assert_eq!(row.value, "updated");
        }

        let changed = dao
            .update_using_query(&parent, &set_value("nobody", "other"))
            .unwrap();
        assert_eq!(changed, 0);
        for key in ["first", "second"] {
            let row = dao.get(&parent, &key.to_string()).unwrap().unwrap();
            assert_eq!(row.value, "updated");
        }
    }

    #[test]
    fn test_update_using_unknown_query() {
        let t = TestDatabase::new(2);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();

        let err = dao
            .update_using_query(&parent_key(), &UpdateOperationMeta::new("noSuchQuery"))
            .unwrap_err();
        assert!(matches!(
            err.find_store_error(),
            Some(StoreError::UnknownOperation(name)) if name == "noSuchQuery"
        ));
    }

    #[test]
    fn test_select_pagination_and_handler() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();
        for i in 0..5 {
            dao.save(&parent, RelationalEntity::new(&format!("e{}", i), "k", "v"))
                .unwrap();
        }

        let page = dao.select(&parent, &Criteria::all(), 1, 2).unwrap();
        let keys: Vec<_> = page.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["e1", "e2"]);

        let total = dao
            .select_with(&parent, &Criteria::all(), 0, 100, |rows| rows.len())
            .unwrap();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_exists() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();

        assert!(!dao.exists(&parent, &"e1".to_string()).unwrap());
        dao.save(&parent, RelationalEntity::new("e1", "k", "v")).unwrap();
        assert!(dao.exists(&parent, &"e1".to_string()).unwrap());
    }

    #[test]
    fn test_run_in_session_is_read_only() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();
        dao.save(&parent, RelationalEntity::new("e1", "k", "v")).unwrap();

        let count = dao
            .run_in_session(&parent, |session| {
                Ok(session.count(&Criteria::<RelationalEntity>::all())?)
            })
            .unwrap();
        assert_eq!(count, 1);

        let err = dao
            .run_in_session(&parent, |session| {
                Ok(session.save(RelationalEntity::new("e2", "k", "v"))?)
            })
            .unwrap_err();
        assert!(matches!(err.find_store_error(), Some(StoreError::ReadOnly)));
    }

    #[test]
    fn test_store_failure_mid_transaction_rolls_back() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();
        dao.save(&parent, RelationalEntity::new("a", "grp", "0")).unwrap();
        dao.save(&parent, RelationalEntity::new("b", "grp", "0")).unwrap();

        // "a" is rewritten first, then the replacement for "b" points at a
        // row that does not exist and the store refuses it
        let err = dao
            .update_all(&parent, 0, 10, &by_key_two("grp"), |e| {
                let key = if e.key == "b" { "ghost" } else { e.key.as_str() };
                Some(RelationalEntity::new(key, "grp", "1"))
            })
            .unwrap_err();

        assert!(matches!(err, Error::Transaction { operation: "updateAll", .. }));
        assert!(matches!(
            err.find_store_error(),
            Some(StoreError::MissingRow { key, .. }) if key == "ghost"
        ));
        assert_eq!(dao.get(&parent, &"a".to_string()).unwrap().unwrap().value, "0");
        assert_eq!(t.held_locks(), 0);
    }

    #[test]
    fn test_unavailable_shard_reports_operation_and_shard() {
        let t = TestDatabase::new(4);
        let dao = t.db.relational_dao::<RelationalEntity>().unwrap();
        let parent = parent_key();
        let shard = dao.shard_id(&parent).unwrap();
        t.stores[shard as usize].set_unavailable(true);

        match dao.get(&parent, &"e1".to_string()).unwrap_err() {
            Error::Transaction {
                operation,
                shard_id,
                source,
            } => {
                assert_eq!(operation, "get");
                assert_eq!(shard_id, shard);
                assert!(matches!(*source, Error::Store(StoreError::Unavailable(_))));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
