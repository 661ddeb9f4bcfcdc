//! Polymorphic hierarchies stored in one table or across joined tables.

mod common;

use common::*;
use entkit::{
    Cx, Delete, Entity, EntityPath, Managed, QueryCompilationErrorKind, Update, Value, select_from,
};

async fn store<T: Entity>(cx: &Cx, ctx: &mut Ctx, items: Vec<T>) -> Vec<i64> {
    let managed: Vec<Managed<T>> = items.into_iter().map(Managed::new).collect();
    for item in &managed {
        ctx.persist(item).unwrap();
    }
    unwrap_outcome(ctx.flush(cx).await);
    ctx.clear();
    managed
        .iter()
        .map(|m| m.id().and_then(|k| k.as_i64()).unwrap())
        .collect()
}

// ============================================================================
// Single Table
// ============================================================================

#[test]
fn single_table_rows_carry_the_discriminator() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let ids = store(
            &cx,
            &mut ctx,
            vec![Vehicle::car("AB 123", 5), Vehicle::truck("CD 456", 12_000)],
        )
        .await;

        assert_eq!(
            db.column("vehicle", "DTYPE"),
            vec![Value::from("CAR"), Value::from("TRUCK")]
        );
        assert_eq!(db.column("vehicle", "payload"), vec![Value::Null, Value::BigInt(12_000)]);

        let truck = unwrap_outcome(ctx.find::<Vehicle>(&cx, ids[1]).await).unwrap();
        assert!(matches!(&*truck.read(), Vehicle::Truck { payload: 12_000, .. }));
    });
}

#[test]
fn single_table_queries_return_concrete_variants() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        store(
            &cx,
            &mut ctx,
            vec![
                Vehicle::car("AB 123", 5),
                Vehicle::truck("CD 456", 12_000),
                Vehicle::car("EF 789", 2),
            ],
        )
        .await;

        let v = EntityPath::<Vehicle>::new("v");
        let all = unwrap_outcome(
            select_from(&v)
                .order_by(v.id().asc())
                .fetch(&cx, &mut ctx)
                .await,
        );
        let plates: Vec<String> = all.iter().map(|v| v.read().plate().to_string()).collect();
        assert_eq!(plates, vec!["AB 123", "CD 456", "EF 789"]);
        assert!(matches!(&*all[2].read(), Vehicle::Car { seats: 2, .. }));

        let trucks = unwrap_outcome(
            select_from(&v)
                .of_subtype("Truck")
                .fetch(&cx, &mut ctx)
                .await,
        );
        assert_eq!(trucks.len(), 1);
        assert!(trucks[0].ptr_eq(&all[1]));

        let roomy = unwrap_outcome(
            select_from(&v)
                .filter(v.get("seats").gt(4))
                .fetch(&cx, &mut ctx)
                .await,
        );
        assert_eq!(roomy.len(), 1);
        assert_eq!(roomy[0].read().plate(), "AB 123");
    });
}

#[test]
fn single_table_bulk_update_may_set_subtype_columns() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        store(&cx, &mut ctx, vec![Vehicle::car("AB 123", 5), Vehicle::truck("CD 456", 1)]).await;

        let v = EntityPath::<Vehicle>::new("v");
        let affected = unwrap_outcome(
            Update::table(&v)
                .set("seats", 7)
                .filter(v.get("plate").eq("AB 123"))
                .execute(&cx, &mut ctx)
                .await,
        );
        assert_eq!(affected, 1);
        assert_eq!(db.column("vehicle", "seats"), vec![Value::Int(7), Value::Null]);
    });
}

// ============================================================================
// Joined
// ============================================================================

#[test]
fn joined_insert_writes_root_then_subtype_row() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let ids = store(
            &cx,
            &mut ctx,
            vec![Payment::card(250, "4111"), Payment::transfer(90, "NO93")],
        )
        .await;

        let log = db.statement_log();
        let root = log.iter().position(|s| s.starts_with("INSERT INTO payment ")).unwrap();
        let sub = log.iter().position(|s| s.starts_with("INSERT INTO card_payment ")).unwrap();
        assert!(root < sub);
        assert_eq!(
            db.column("payment", "kind"),
            vec![Value::from("card"), Value::from("transfer")]
        );
        assert_eq!(db.column("card_payment", "payment_id"), vec![Value::BigInt(ids[0])]);
        assert_eq!(db.rows("transfer_payment").len(), 1);

        let card = unwrap_outcome(ctx.find::<Payment>(&cx, ids[0]).await).unwrap();
        match &*card.read() {
            Payment::Card { amount, number, .. } => {
                assert_eq!(*amount, 250);
                assert_eq!(number, "4111");
            }
            other => panic!("expected a card payment, got {other:?}"),
        }
    });
}

#[test]
fn joined_update_touches_only_changed_tables() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let ids = store(&cx, &mut ctx, vec![Payment::card(250, "4111")]).await;

        let card = unwrap_outcome(ctx.find::<Payment>(&cx, ids[0]).await).unwrap();
        if let Payment::Card { number, .. } = &mut *card.write() {
            *number = "5500".into();
        }
        db.clear_log();
        unwrap_outcome(ctx.flush(&cx).await);

        let log = db.statement_log();
        assert_eq!(log.len(), 1, "{log:?}");
        assert!(log[0].starts_with("UPDATE card_payment "), "{}", log[0]);
        assert_eq!(db.column("card_payment", "card_number"), vec![Value::from("5500")]);
    });
}

#[test]
fn joined_delete_removes_subtype_row_first() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let ids = store(&cx, &mut ctx, vec![Payment::transfer(90, "NO93")]).await;

        let transfer = unwrap_outcome(ctx.get::<Payment>(&cx, ids[0]).await);
        ctx.remove(&transfer).unwrap();
        db.clear_log();
        unwrap_outcome(ctx.flush(&cx).await);

        let log = db.statement_log();
        let sub = log.iter().position(|s| s.starts_with("DELETE FROM transfer_payment ")).unwrap();
        let root = log.iter().position(|s| s.starts_with("DELETE FROM payment ")).unwrap();
        assert!(sub < root);
        assert!(db.rows("payment").is_empty());
        assert!(db.rows("transfer_payment").is_empty());
    });
}

#[test]
fn joined_queries_filter_on_subtype_columns() {
    run(async {
        let cx = Cx::for_testing();
        let (_db, mut ctx) = setup();
        store(
            &cx,
            &mut ctx,
            vec![
                Payment::card(250, "4111"),
                Payment::transfer(90, "NO93"),
                Payment::transfer(40, "DE89"),
            ],
        )
        .await;

        let p = EntityPath::<Payment>::new("p");
        let found = unwrap_outcome(
            select_from(&p)
                .filter(p.get("iban").eq("DE89"))
                .fetch(&cx, &mut ctx)
                .await,
        );
        assert_eq!(found.len(), 1);
        assert!(matches!(&*found[0].read(), Payment::Transfer { amount: 40, .. }));

        let transfers = unwrap_outcome(
            select_from(&p)
                .of_subtype("Transfer")
                .fetch_count(&cx, &mut ctx)
                .await,
        );
        assert_eq!(transfers, 2);
    });
}

#[test]
fn joined_bulk_delete_clears_subtype_tables() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        store(
            &cx,
            &mut ctx,
            vec![Payment::card(250, "4111"), Payment::transfer(90, "NO93")],
        )
        .await;

        let p = EntityPath::<Payment>::new("p");
        let deleted = unwrap_outcome(
            Delete::from(&p)
                .filter(p.get("amount").gt(100_i64))
                .execute(&cx, &mut ctx)
                .await,
        );
        assert_eq!(deleted, 1);
        assert!(db.rows("card_payment").is_empty());
        assert_eq!(db.rows("transfer_payment").len(), 1);
        assert_eq!(db.rows("payment").len(), 1);
    });
}

#[test]
fn joined_bulk_update_cannot_reach_subtype_columns() {
    run(async {
        let cx = Cx::for_testing();
        let (db, mut ctx) = setup();
        let p = EntityPath::<Payment>::new("p");
        let err = unwrap_err(
            Update::table(&p)
                .set("iban", "none")
                .execute(&cx, &mut ctx)
                .await,
        );
        assert_eq!(
            err.compilation_kind(),
            Some(QueryCompilationErrorKind::UnknownField)
        );
        assert_eq!(db.writes(), 0);
    });
}
