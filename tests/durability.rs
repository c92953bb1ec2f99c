use strata::query::{col, DeleteQuery, SelectQuery, UpdateQuery};
use strata::storage::wal::SyncMode;
use strata::{row, Config, DataType, Database, ErrorKind, Order, Schema, SchemaBuilder, TableBuilder, Value};
use tempfile::TempDir;

fn schema() -> Schema {
    SchemaBuilder::new("notes", 1)
        .table(
            TableBuilder::new("note")
                .add_column("id", DataType::Integer)
                .add_column("title", DataType::String)
                .add_nullable_column("stars", DataType::Integer)
                .add_primary_key(&["id"])
                .add_index("idx_stars", &[("stars", Order::Desc)], false),
        )
        .build()
        .unwrap()
}

fn config(dir: &TempDir, checkpoint_every: u64) -> Config {
    Config {
        wal_sync_mode: SyncMode::Immediate,
        checkpoint_every_commits: checkpoint_every,
        ..Config::with_storage_path(dir.path())
    }
}

async fn titles(db: &Database) -> Vec<String> {
    let mut out: Vec<String> = db
        .select(SelectQuery::new(vec![]).from("note"))
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.get("title").as_str().map(str::to_string))
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn test_commits_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open_durable(schema(), config(&dir, 1000)).await.unwrap();
        db.insert(
            "note",
            vec![
                row!("id" => 1, "title" => "one", "stars" => 3),
                row!("id" => 2, "title" => "two", "stars" => Value::Null),
                row!("id" => 3, "title" => "three", "stars" => 5),
            ],
        )
        .await
        .unwrap();
        db.update(UpdateQuery::table("note").set("title", "uno").where_(col("note", "id").eq(1)))
            .await
            .unwrap();
        db.delete(DeleteQuery::from("note").where_(col("note", "id").eq(2)))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = Database::open_durable(schema(), config(&dir, 1000)).await.unwrap();
    assert_eq!(titles(&db).await, vec!["three".to_string(), "uno".to_string()]);

    // indices are rebuilt on open
    let top = db
        .select(SelectQuery::new(vec![]).from("note").where_(col("note", "stars").gt(4)))
        .await
        .unwrap();
    assert_eq!(top.len(), 1);

    // fresh row ids never collide with recovered ones
    let inserted = db.insert("note", vec![row!("id" => 4, "title" => "four")]).await.unwrap();
    assert!(inserted[0].id > 3);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_checkpoints_and_wal_combine_on_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open_durable(schema(), config(&dir, 2)).await.unwrap();
        for i in 0..5 {
            db.insert("note", vec![row!("id" => i, "title" => format!("n{}", i))])
                .await
                .unwrap();
        }
        db.close().await.unwrap();
    }
    let db = Database::open_durable(schema(), config(&dir, 2)).await.unwrap();
    assert_eq!(titles(&db).await.len(), 5);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_write_is_not_logged() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open_durable(schema(), config(&dir, 1000)).await.unwrap();
        db.insert("note", vec![row!("id" => 1, "title" => "a")]).await.unwrap();
        let err = db
            .insert("note", vec![row!("id" => 2, "title" => "b"), row!("id" => 1, "title" => "c")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateKey);
        db.close().await.unwrap();
    }
    let db = Database::open_durable(schema(), config(&dir, 1000)).await.unwrap();
    assert_eq!(titles(&db).await, vec!["a".to_string()]);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_directory_is_locked_while_open() {
    let dir = TempDir::new().unwrap();
    let db = Database::open_durable(schema(), config(&dir, 1000)).await.unwrap();
    assert!(Database::open_durable(schema(), config(&dir, 1000)).await.is_err());
    db.close().await.unwrap();
    let again = Database::open_durable(schema(), config(&dir, 1000)).await.unwrap();
    again.close().await.unwrap();
}
