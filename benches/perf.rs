use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tabula::Engine;
use tabula::catalog::schema::{CollectionDraft, Field, FieldDraft, ValidationRules};
use tabula::catalog::types::{FieldType, Record};
use tabula::config::EngineConfig;
use tabula::context::{AuthContext, Deadline, OperationContext};
use tabula::filter::filter_fields;
use tabula::permission::AllowedFields;
use tabula::query::builder::{PhysicalTable, Projection, Statement, build_select};
use tabula::query::plan::{Expr, Order};
use tabula::validation::{UnknownKeys, ValidationMode, convert_record, validate_record};
use tokio::runtime::Runtime;
use uuid::Uuid;

const SEEDED_ROWS: i64 = 1_000;

fn note_fields() -> Vec<Field> {
    vec![
        Field::new("title", FieldType::String).required(),
        Field::new("body", FieldType::Text),
        Field::new("status", FieldType::String).with_default("draft"),
        Field::new("priority", FieldType::Integer).with_rules(ValidationRules {
            min: Some(1.0),
            max: Some(5.0),
            ..ValidationRules::default()
        }),
    ]
}

fn sample_row() -> Record {
    Record::new()
        .with("id", Uuid::new_v4())
        .with("title", "Quarterly plan")
        .with("body", "x".repeat(512))
        .with("status", "draft")
        .with("priority", 3i64)
}

async fn seeded_engine() -> (Engine, OperationContext) {
    let (engine, _) = Engine::in_memory(EngineConfig::default());
    let d = Deadline::NONE;
    let provisioner = engine.provisioner();
    let tenant = provisioner.provision_tenant(d, "Bench", None).await.expect("tenant");
    let user = provisioner
        .create_user(d, tenant.id, "bench@example.test", None)
        .await
        .expect("user");
    let admin = provisioner.find_role(d, tenant.id, "admin").await.expect("role");
    provisioner
        .assign_role(d, tenant.id, user.id, admin.id)
        .await
        .expect("assign");
    let notes = engine
        .lifecycle()
        .create_collection(d, tenant.id, user.id, CollectionDraft::new("notes"))
        .await
        .expect("collection");
    for draft in [
        FieldDraft::new(notes.id, "title", FieldType::String).required(),
        FieldDraft::new(notes.id, "priority", FieldType::Integer),
    ] {
        engine
            .lifecycle()
            .create_field(d, tenant.id, user.id, draft)
            .await
            .expect("field");
    }
    let ctx = OperationContext::new(AuthContext::new(user.id, tenant.id));
    for i in 0..SEEDED_ROWS {
        engine
            .create(
                &ctx,
                "notes",
                Record::new().with("title", format!("note {i}")).with("priority", i % 5 + 1),
            )
            .await
            .expect("seed");
    }
    (engine, ctx)
}

fn bench_pipeline_pieces(c: &mut Criterion) {
    let table = PhysicalTable::dynamic("acme", "notes", "data_").expect("table");
    c.bench_function("render_filtered_select", |b| {
        b.iter(|| {
            let select = build_select(
                table.clone(),
                Projection::Columns(vec!["id".into(), "title".into(), "priority".into()]),
                Expr::all([
                    Expr::eq("status", "draft"),
                    Expr::In("priority".into(), vec![1i64.into(), 2i64.into(), 3i64.into()]),
                ]),
            )
            .order_by("created_at", Order::Desc)
            .limit(50);
            black_box(Statement::Select(select).to_sql());
        });
    });

    let row = sample_row();
    let allowed = AllowedFields::Only(["id", "title", "priority"].map(String::from).into());
    c.bench_function("filter_fields_restricted", |b| {
        b.iter(|| black_box(filter_fields(black_box(&row), &allowed)));
    });

    let fields = note_fields();
    let payload = Record::new().with("title", "Plan").with("priority", "4");
    c.bench_function("validate_and_convert_payload", |b| {
        b.iter(|| {
            validate_record(&fields, &payload, ValidationMode::Create, UnknownKeys::Reject)
                .expect("valid");
            black_box(convert_record(&fields, payload.clone(), ValidationMode::Create).expect("convert"));
        });
    });
}

fn bench_engine_hot_paths(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (engine, ctx) = rt.block_on(seeded_engine());

    c.bench_function("create_row_in_memory", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine
                    .create(&ctx, "notes", Record::new().with("title", "bench").with("priority", 2i64))
                    .await
                    .expect("create");
            })
        });
    });

    c.bench_function("query_top_priority", |b| {
        b.iter(|| {
            rt.block_on(async {
                let rows = engine
                    .query(
                        &ctx,
                        "notes",
                        tabula::handler::ListQuery::new()
                            .filter(Expr::eq("priority", 5i64))
                            .order_by("title", Order::Asc)
                            .limit(20),
                    )
                    .await
                    .expect("query");
                black_box(rows);
            })
        });
    });
}

criterion_group!(benches, bench_pipeline_pieces, bench_engine_hot_paths);
criterion_main!(benches);
