//! Lifecycle, dirty checking and flush behavior through the public API.

mod common;

use common::*;
use entkit::{
    Collection, ContextConfig, Cx, Error, LifecycleState, Managed, PersistenceContext, Ref, Value,
    WriteKind,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Persist `team` with its members, flush, then forget everything.
async fn stored(cx: &Cx, ctx: &mut Ctx, team: &Managed<Team>) {
    ctx.persist(team).unwrap();
    unwrap_outcome(ctx.flush(cx).await);
    ctx.clear();
}

#[test]
fn find_twice_returns_the_same_instance() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        stored(&cx, &mut ctx, &t).await;
        let id = m.read().id.unwrap();

        let first = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        first.write().age = Some(99);
        let second = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(second.read().age, Some(99));
        assert!(!first.ptr_eq(&m));
    });
}

#[test]
fn find_missing_key_is_none_and_get_fails() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        assert!(unwrap_outcome(ctx.find::<Member>(&cx, 404_i64).await).is_none());
        let err = unwrap_err(ctx.get::<Member>(&cx, 404_i64).await);
        assert!(matches!(err, Error::NotFound(_)), "{err:?}");
    });
}

#[test]
fn flushing_unchanged_instances_writes_nothing() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        m.write().nicknames = vec!["annie".into()];
        stored(&cx, &mut ctx, &t).await;

        let id = m.read().id.unwrap();
        let loaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        assert!(!ctx.is_dirty(&loaded).unwrap());

        db.clear_log();
        let result = unwrap_outcome(ctx.flush(&cx).await);
        assert!(result.is_empty());
        assert_eq!(db.writes(), 0);
    });
}

#[test]
fn one_changed_field_issues_one_full_row_update() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        stored(&cx, &mut ctx, &t).await;

        let id = m.read().id.unwrap();
        let loaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        loaded.write().age = Some(31);
        assert_eq!(ctx.changed_fields(&loaded).unwrap(), vec!["age"]);

        db.clear_log();
        let result = unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(db.writes(), 1);

        let log = db.statement_log();
        let update = log.last().unwrap();
        assert!(update.starts_with("UPDATE member "), "{update}");
        for column in ["username", "age", "city", "street", "team_id"] {
            assert!(update.contains(&format!("{column} = ")), "{column} missing: {update}");
        }
        assert_eq!(db.column("member", "age"), vec![Value::Int(31)]);
    });
}

#[test]
fn parent_row_is_written_before_its_child() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);

        ctx.persist(&m).unwrap();
        ctx.persist(&t).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);

        let log = db.statement_log();
        let team_at = log.iter().position(|s| s.starts_with("INSERT INTO team ")).unwrap();
        let member_at = log.iter().position(|s| s.starts_with("INSERT INTO member ")).unwrap();
        assert!(team_at < member_at);

        let team_id = t.read().id.unwrap();
        assert_eq!(db.column("member", "team_id"), vec![Value::BigInt(team_id)]);
        assert_eq!(t.read().version, 0);
    });
}

#[test]
fn cascade_remove_deletes_children_then_parent() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        join_team(&t, "ann", 30);
        join_team(&t, "bob", 40);
        ctx.persist(&t).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);

        ctx.remove(&t).unwrap();
        assert_eq!(ctx.state_of(&t), LifecycleState::Removed);
        db.clear_log();
        let result = unwrap_outcome(ctx.flush(&cx).await);

        assert_eq!(result.deleted, 3);
        assert!(db.rows("team").is_empty());
        assert!(db.rows("member").is_empty());
        let log = db.statement_log();
        let last_member = log.iter().rposition(|s| s.starts_with("DELETE FROM member ")).unwrap();
        let team_at = log.iter().position(|s| s.starts_with("DELETE FROM team ")).unwrap();
        assert!(last_member < team_at);
        assert_eq!(ctx.state_of(&t), LifecycleState::Detached);
    });
}

#[test]
fn removing_a_found_owner_deletes_its_unloaded_children() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let ann = join_team(&t, "ann", 30);
        join_team(&t, "bob", 40);
        ann.write().nicknames = vec!["annie".into()];
        ann.write().projects = Collection::from(vec![Managed::new(Project::new(7, "apollo"))]);
        stored(&cx, &mut ctx, &t).await;
        let id = t.read().id.unwrap();

        let found = unwrap_outcome(ctx.find::<Team>(&cx, id).await).unwrap();
        assert!(!ctx.is_loaded(&found.read().members));
        ctx.remove(&found).unwrap();
        let result = unwrap_outcome(ctx.flush(&cx).await);

        assert_eq!(result.deleted, 3);
        assert!(db.rows("team").is_empty());
        assert!(db.rows("member").is_empty());
        assert!(db.rows("member_nickname").is_empty());
        assert!(db.rows("member_project").is_empty());
        assert_eq!(db.rows("project").len(), 1);
        assert_eq!(ctx.state_of(&found), LifecycleState::Detached);
    });
}

#[test]
fn changing_the_key_of_a_stored_instance_fails_the_flush() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let ann = Managed::new(Member::new("ann", 30));
        let bob = Managed::new(Member::new("bob", 40));
        ctx.persist(&ann).unwrap();
        ctx.persist(&bob).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);
        let ann_id = ann.read().id.unwrap();
        let bob_id = bob.read().id.unwrap();

        ann.write().id = Some(bob_id);
        ann.write().name = Some("ann2".into());
        assert!(ctx.is_dirty(&ann).unwrap());
        assert_eq!(ctx.changed_fields(&ann).unwrap(), vec!["id", "name"]);
        db.clear_log();
        let err = unwrap_err(ctx.flush(&cx).await);
        assert!(matches!(err, Error::Mapping(_)), "{err:?}");
        assert_eq!(db.writes(), 0);
        assert_eq!(
            db.column("member", "username"),
            vec![Value::from("ann"), Value::from("bob")]
        );

        ann.write().id = Some(ann_id);
        let result = unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(
            db.column("member", "username"),
            vec![Value::from("ann2"), Value::from("bob")]
        );
        assert_eq!(bob.read().name.as_deref(), Some("bob"));
    });
}

#[test]
fn persisting_a_detached_instance_is_rejected() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        let t = team("A");
        stored(&cx, &mut ctx, &t).await;

        assert_eq!(ctx.state_of(&t), LifecycleState::Detached);
        let err = ctx.persist(&t).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)), "{err:?}");
        let err = ctx.remove(&t).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)), "{err:?}");
    });
}

#[test]
fn two_instances_with_one_assigned_key_conflict() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        let first = Managed::new(Project::new(7, "apollo"));
        ctx.persist(&first).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);

        let second = Managed::new(Project::new(7, "gemini"));
        let err = ctx.persist(&second).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(_)), "{err:?}");
        assert_eq!(ctx.state_of(&second), LifecycleState::Transient);
    });
}

#[test]
fn detached_changes_are_not_written() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        ctx.persist(&t).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);

        ctx.detach(&t).unwrap();
        t.write().name = "renamed".into();
        db.clear_log();
        unwrap_outcome(ctx.flush(&cx).await);

        assert_eq!(db.writes(), 0);
        assert_eq!(db.column("team", "name"), vec![Value::from("A")]);
    });
}

#[test]
fn concurrent_update_is_detected_by_version() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        stored(&cx, &mut ctx, &t).await;
        let id = t.read().id.unwrap();

        let mut other = open(&db);
        let mine = unwrap_outcome(ctx.find::<Team>(&cx, id).await).unwrap();
        let theirs = unwrap_outcome(other.find::<Team>(&cx, id).await).unwrap();

        theirs.write().name = "theirs".into();
        unwrap_outcome(other.flush(&cx).await);
        assert_eq!(theirs.read().version, 1);

        mine.write().name = "mine".into();
        match unwrap_err(ctx.flush(&cx).await) {
            Error::StaleState(stale) => {
                assert_eq!(stale.entity, "Team");
                assert_eq!(stale.write, WriteKind::Update);
                assert_eq!(stale.key, Value::BigInt(id));
            }
            other => panic!("expected StaleState, got {other:?}"),
        }
        assert_eq!(db.column("team", "name"), vec![Value::from("theirs")]);
    });
}

#[test]
fn deleting_a_changed_row_is_stale() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        stored(&cx, &mut ctx, &t).await;
        let id = t.read().id.unwrap();

        let mut other = open(&db);
        let mine = unwrap_outcome(ctx.find::<Team>(&cx, id).await).unwrap();
        let theirs = unwrap_outcome(other.find::<Team>(&cx, id).await).unwrap();
        theirs.write().name = "theirs".into();
        unwrap_outcome(other.flush(&cx).await);

        ctx.remove(&mine).unwrap();
        match unwrap_err(ctx.flush(&cx).await) {
            Error::StaleState(stale) => assert_eq!(stale.write, WriteKind::Delete),
            other => panic!("expected StaleState, got {other:?}"),
        }
        assert_eq!(db.rows("team").len(), 1);
    });
}

#[test]
fn embedded_value_is_replaced_as_a_whole() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        m.write().address = Some(Address::new("Oslo", "Storgata 1"));
        stored(&cx, &mut ctx, &t).await;
        let id = m.read().id.unwrap();

        let loaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        assert_eq!(
            loaded.read().address,
            Some(Address::new("Oslo", "Storgata 1"))
        );

        loaded.write().address = Some(Address::new("Bergen", "Bryggen 2"));
        assert!(ctx.changed_fields(&loaded).unwrap().contains(&"address"));
        unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(db.column("member", "city"), vec![Value::from("Bergen")]);

        loaded.write().address = None;
        unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(db.column("member", "city"), vec![Value::Null]);
        assert_eq!(db.column("member", "street"), vec![Value::Null]);

        ctx.clear();
        let reloaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        assert_eq!(reloaded.read().address, None);
    });
}

#[test]
fn value_collection_is_rewritten_when_changed() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        m.write().nicknames = vec!["annie".into(), "a".into()];
        stored(&cx, &mut ctx, &t).await;
        assert_eq!(db.rows("member_nickname").len(), 2);

        let id = m.read().id.unwrap();
        let loaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        assert_eq!(loaded.read().nicknames, vec!["annie".to_string(), "a".to_string()]);

        loaded.write().nicknames.push("nan".into());
        unwrap_outcome(ctx.flush(&cx).await);

        assert_eq!(
            db.column("member_nickname", "nickname"),
            vec![Value::from("annie"), Value::from("a"), Value::from("nan")]
        );
        // The owner's own row is untouched.
        assert!(!db.statement_log().iter().any(|s| s.starts_with("UPDATE member ")));
    });
}

#[test]
fn many_to_many_links_follow_the_collection() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        let apollo = Managed::new(Project::new(1, "apollo"));
        let gemini = Managed::new(Project::new(2, "gemini"));
        m.write().projects.push(apollo.clone()).unwrap();
        m.write().projects.push(gemini.clone()).unwrap();
        ctx.persist(&t).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(db.rows("project").len(), 2);
        assert_eq!(db.rows("member_project").len(), 2);

        m.write().projects.remove(&apollo).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(db.column("member_project", "project_code"), vec![Value::BigInt(2)]);
        assert_eq!(db.rows("project").len(), 2);

        ctx.clear();
        let id = m.read().id.unwrap();
        let loaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        let projects = loaded.read().projects.clone();
        assert!(!ctx.is_loaded(&projects));
        let items = unwrap_outcome(ctx.resolve_collection(&cx, &projects).await);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].read().title, "gemini");
    });
}

#[test]
fn lazy_reference_resolves_through_the_identity_map() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        stored(&cx, &mut ctx, &t).await;

        let id = m.read().id.unwrap();
        let loaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        let reference = loaded.read().team.clone();
        assert!(!ctx.is_loaded(&reference));

        let first = unwrap_outcome(ctx.resolve(&cx, &reference).await).unwrap();
        assert!(ctx.is_loaded(&loaded.read().team));
        let selects = db.count("SELECT");
        let again_ref = loaded.read().team.clone();
        let again = unwrap_outcome(ctx.resolve(&cx, &again_ref).await).unwrap();
        assert!(first.ptr_eq(&again));
        assert_eq!(db.count("SELECT"), selects);
        assert_eq!(first.read().name, "A");
    });
}

#[test]
fn reference_by_key_avoids_a_select() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        stored(&cx, &mut ctx, &t).await;
        let id = t.read().id.unwrap();

        db.clear_log();
        let reference = ctx.get_reference::<Team>(id).unwrap();
        let mut member = Member::new("new", 18);
        member.team = reference;
        let member = Managed::new(member);
        ctx.persist(&member).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);

        assert_eq!(db.count("SELECT"), 0);
        assert_eq!(db.column("member", "team_id"), vec![Value::BigInt(id)]);
    });
}

#[test]
fn proxy_from_a_closed_context_cannot_load() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        let m = join_team(&t, "ann", 30);
        stored(&cx, &mut ctx, &t).await;

        let id = m.read().id.unwrap();
        let loaded = unwrap_outcome(ctx.find::<Member>(&cx, id).await).unwrap();
        let reference = loaded.read().team.clone();
        ctx.close();
        assert!(!ctx.is_open());

        let err = unwrap_err(ctx.resolve(&cx, &reference).await);
        assert!(matches!(err, Error::ContextClosed(_)), "{err:?}");

        let mut other = open(&db);
        let err = unwrap_err(other.resolve(&cx, &reference).await);
        assert!(matches!(err, Error::ContextClosed(_)), "{err:?}");
        assert!(matches!(reference, Ref::Unresolved(_)));
    });
}

#[test]
fn refresh_reloads_the_stored_state() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        let t = team("A");
        ctx.persist(&t).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);

        t.write().name = "local".into();
        unwrap_outcome(ctx.refresh(&cx, &t).await);
        assert_eq!(t.read().name, "A");
        assert!(!ctx.is_dirty(&t).unwrap());
    });
}

#[test]
fn flush_events_fire_in_order() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        {
            let before = Arc::clone(&before);
            ctx.on_before_flush(move || {
                before.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let (before, after) = (Arc::clone(&before), Arc::clone(&after));
            ctx.on_after_flush(move || {
                assert_eq!(before.load(Ordering::SeqCst), after.load(Ordering::SeqCst) + 1);
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        ctx.persist(&team("A")).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);
        unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(before.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 2);
    });
}

#[test]
fn commit_flushes_and_rollback_discards() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();

        unwrap_outcome(ctx.begin(&cx).await);
        ctx.persist(&team("kept")).unwrap();
        unwrap_outcome(ctx.commit(&cx).await);
        assert_eq!(db.rows("team").len(), 1);

        unwrap_outcome(ctx.begin(&cx).await);
        let dropped = team("dropped");
        ctx.persist(&dropped).unwrap();
        unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(db.rows("team").len(), 2);
        unwrap_outcome(ctx.rollback(&cx).await);

        assert_eq!(db.rows("team").len(), 1);
        assert!(!db.in_transaction());
        assert_eq!(ctx.tracked_count(), 0);
    });
}

#[test]
fn failed_write_keeps_changes_pending() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        ctx.persist(&t).unwrap();
        db.fail_next_write("disk full");

        let err = unwrap_err(ctx.flush(&cx).await);
        assert!(matches!(err, Error::Executor(_)), "{err:?}");
        assert!(db.rows("team").is_empty());
    });
}

#[test]
fn bulk_clear_config_detaches_loaded_instances() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let t = team("A");
        stored(&cx, &mut ctx, &t).await;
        let id = t.read().id.unwrap();

        let config = ContextConfig::new().with_clear_after_bulk(true);
        let mut ctx = PersistenceContext::with_config(Arc::clone(&db), model(), config);
        let loaded = unwrap_outcome(ctx.find::<Team>(&cx, id).await).unwrap();

        let p = entkit::EntityPath::<Team>::new("t");
        let affected = unwrap_outcome(
            entkit::Update::table(&p)
                .set("name", "bulk")
                .filter(p.id().eq(id))
                .execute(&cx, &mut ctx)
                .await,
        );
        assert_eq!(affected, 1);
        assert!(!ctx.contains(&loaded));

        let fresh = unwrap_outcome(ctx.find::<Team>(&cx, id).await).unwrap();
        assert_eq!(fresh.read().name, "bulk");
        assert!(!fresh.ptr_eq(&loaded));
    });
}
