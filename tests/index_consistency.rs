use strata::query::{col, DeleteQuery, InsertQuery, SelectQuery, UpdateQuery};
use strata::storage::wal::SyncMode;
use strata::txn::diff::TableDiff;
use strata::{row, Config, DataType, Database, ErrorKind, Order, Schema, SchemaBuilder, TableBuilder, Value};
use tempfile::TempDir;

/// `email` gets a unique index over a nullable column, `(team, nick)` a
/// two-column index whose first column is nullable.
fn schema() -> Schema {
    SchemaBuilder::new("club", 1)
        .table(
            TableBuilder::new("member")
                .add_column("id", DataType::Integer)
                .add_nullable_column("email", DataType::String)
                .add_nullable_column("team", DataType::Integer)
                .add_column("nick", DataType::String)
                .add_primary_key(&["id"])
                .add_unique("uq_email", &["email"])
                .add_index("idx_team_nick", &[("team", Order::Asc), ("nick", Order::Asc)], false),
        )
        .build()
        .unwrap()
}

async fn seed(db: &Database) {
    db.insert(
        "member",
        vec![
            row!("id" => 1, "email" => Value::Null, "team" => Value::Null, "nick" => "a"),
            row!("id" => 2, "email" => Value::Null, "team" => 1, "nick" => "b"),
            row!("id" => 3, "email" => "c@x", "team" => 1, "nick" => "c"),
            row!("id" => 4, "email" => "d@x", "team" => Value::Null, "nick" => "d"),
        ],
    )
    .await
    .unwrap();
}

async fn ids(db: &Database, query: SelectQuery) -> Vec<i64> {
    let mut out: Vec<i64> = db
        .select(query)
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.get("id").as_i64())
        .collect();
    out.sort();
    out
}

/// Every index-driven read returns exactly the rows a full scan sees.
async fn assert_indices_agree(db: &Database, expected_rows: usize) {
    let full = ids(db, SelectQuery::new(vec![]).from("member")).await;
    assert_eq!(full.len(), expected_rows);
    let by_index = [
        (
            "member.uq_email",
            SelectQuery::new(vec![]).from("member").order_by(col("member", "email"), Order::Asc),
        ),
        (
            "member.idx_team_nick",
            SelectQuery::new(vec![])
                .from("member")
                .order_by(col("member", "team"), Order::Asc)
                .order_by(col("member", "nick"), Order::Asc),
        ),
        (
            "member.pkmember",
            SelectQuery::new(vec![]).from("member").order_by(col("member", "id"), Order::Desc),
        ),
    ];
    for (index, query) in by_index {
        let plan = db.explain(query.clone()).unwrap();
        assert!(plan.contains(index), "{}", plan);
        assert_eq!(ids(db, query).await, full, "{}", index);
    }
}

#[tokio::test]
async fn test_failed_batch_restores_indices() {
    let db = Database::open_in_memory(schema()).await.unwrap();
    seed(&db).await;

    let mut tx = db.create_transaction().unwrap();
    let err = tx
        .exec(vec![
            DeleteQuery::from("member").where_(col("member", "id").eq(1)).into_query(),
            UpdateQuery::table("member")
                .set("email", Value::Null)
                .where_(col("member", "id").eq(4))
                .into_query(),
            InsertQuery::into_table("member")
                .values(vec![row!("id" => 3, "email" => Value::Null, "nick" => "dup")])
                .into_query(),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DuplicateKey);
    assert_indices_agree(&db, 4).await;
}

#[tokio::test]
async fn test_attached_rollback_restores_indices() {
    let db = Database::open_in_memory(schema()).await.unwrap();
    seed(&db).await;

    let mut tx = db.create_transaction().unwrap();
    tx.begin(&["member"]).await.unwrap();
    tx.attach(DeleteQuery::from("member").where_(col("member", "id").eq(2)))
        .unwrap();
    tx.attach(InsertQuery::into_table("member").values(vec![row!("id" => 5, "email" => Value::Null, "nick" => "e")]))
        .unwrap();
    tx.rollback().unwrap();
    assert_indices_agree(&db, 4).await;
}

#[tokio::test]
async fn test_external_changes_index_null_keys() {
    let db = Database::open_in_memory(schema()).await.unwrap();
    seed(&db).await;

    let mut diff = TableDiff::new("member");
    diff.add(row!("id" => 10, "email" => Value::Null, "team" => Value::Null, "nick" => "x").with_id(100));
    diff.add(row!("id" => 11, "email" => Value::Null, "team" => 2, "nick" => "y").with_id(101));
    db.apply_external_changes(vec![diff]).await.unwrap();
    assert_indices_agree(&db, 6).await;
}

#[tokio::test]
async fn test_reopen_rebuilds_indices() {
    let dir = TempDir::new().unwrap();
    let config = || Config {
        wal_sync_mode: SyncMode::Immediate,
        ..Config::with_storage_path(dir.path())
    };
    {
        let db = Database::open_durable(schema(), config()).await.unwrap();
        seed(&db).await;
        db.close().await.unwrap();
    }
    let db = Database::open_durable(schema(), config()).await.unwrap();
    assert_indices_agree(&db, 4).await;
    db.close().await.unwrap();
}
