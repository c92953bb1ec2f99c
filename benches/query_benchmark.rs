use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use strata::query::{col, or, SelectQuery};
use strata::{row, Database, DataType, Order, Row, SchemaBuilder, TableBuilder};
use tokio::runtime::Runtime;

fn schema() -> strata::Schema {
    SchemaBuilder::new("bench", 1)
        .table(
            TableBuilder::new("dept")
                .add_column("id", DataType::Integer)
                .add_column("name", DataType::String)
                .add_primary_key(&["id"]),
        )
        .table(
            TableBuilder::new("emp")
                .add_column("id", DataType::Integer)
                .add_column("dept_id", DataType::Integer)
                .add_column("salary", DataType::Number)
                .add_column("grade", DataType::Integer)
                .add_primary_key(&["id"])
                .add_index("idx_salary", &[("salary", Order::Desc)], false)
                .add_index("idx_dept", &[("dept_id", Order::Asc)], false)
                .add_index("idx_grade", &[("grade", Order::Asc)], false),
        )
        .build()
        .unwrap()
}

/// Database with `rows` employees spread over 20 departments
fn populated(rt: &Runtime, rows: i64) -> Database {
    rt.block_on(async {
        let db = Database::open_in_memory(schema()).await.unwrap();
        let depts: Vec<Row> = (0..20).map(|i| row!("id" => i, "name" => format!("d{}", i))).collect();
        db.insert("dept", depts).await.unwrap();

        let mut rng = rand::thread_rng();
        let emps: Vec<Row> = (0..rows)
            .map(|i| {
                row!(
                    "id" => i,
                    "dept_id" => i % 20,
                    "salary" => rng.gen_range(1_000.0..10_000.0),
                    "grade" => rng.gen_range(0i64..10)
                )
            })
            .collect();
        db.insert("emp", emps).await.unwrap();
        db
    })
}

fn bench_point_select(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = populated(&rt, 10_000);
    c.bench_function("select_by_primary_key", |b| {
        let mut i = 0i64;
        b.iter(|| {
            i = (i + 31) % 10_000;
            let q = SelectQuery::new(vec![]).from("emp").where_(col("emp", "id").eq(i));
            black_box(rt.block_on(db.select(q)).unwrap())
        });
    });
}

fn bench_indexed_vs_scan(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = populated(&rt, 10_000);
    let mut group = c.benchmark_group("range_select");
    for bound in [9_900.0f64, 5_000.0].iter() {
        group.bench_with_input(BenchmarkId::new("indexed_salary", bound), bound, |b, &bound| {
            b.iter(|| {
                let q = SelectQuery::new(vec![]).from("emp").where_(col("emp", "salary").gt(bound));
                black_box(rt.block_on(db.select(q)).unwrap())
            });
        });
    }
    group.bench_function("or_over_two_indices", |b| {
        b.iter(|| {
            let q = SelectQuery::new(vec![])
                .from("emp")
                .where_(or(vec![col("emp", "grade").eq(3), col("emp", "dept_id").eq(7)]));
            black_box(rt.block_on(db.select(q)).unwrap())
        });
    });
    group.bench_function("order_by_limit", |b| {
        b.iter(|| {
            let q = SelectQuery::new(vec![])
                .from("emp")
                .order_by(col("emp", "salary"), Order::Desc)
                .limit(10);
            black_box(rt.block_on(db.select(q)).unwrap())
        });
    });
    group.finish();
}

fn bench_join(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = populated(&rt, 2_000);
    c.bench_function("inner_join_with_filter", |b| {
        b.iter(|| {
            let q = SelectQuery::new(vec![col("emp", "id").into(), col("dept", "name").into()])
                .from("emp")
                .inner_join("dept", col("emp", "dept_id").eq_col(col("dept", "id")))
                .where_(col("emp", "grade").eq(1));
            black_box(rt.block_on(db.select(q)).unwrap())
        });
    });
}

fn bench_write_batches(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("insert_batch");
    for size in [10i64, 100, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let db = populated(&rt, 0);
            let mut next = 0i64;
            b.iter(|| {
                let rows: Vec<Row> = (0..size)
                    .map(|_| {
                        next += 1;
                        row!("id" => next, "dept_id" => next % 20, "salary" => 1_500.0, "grade" => 1)
                    })
                    .collect();
                black_box(rt.block_on(db.insert("emp", rows)).unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_point_select,
    bench_indexed_vs_scan,
    bench_join,
    bench_write_batches
);
criterion_main!(benches);
