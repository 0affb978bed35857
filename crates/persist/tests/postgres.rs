#![forbid(unsafe_code)]

//! Runs against a live database when `FLEETPLANE_TEST_DATABASE_URL` is set.

use chrono::{NaiveDate, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use fleetplane_core::{CostRow, EventFact};
use fleetplane_persist::{CostStore, EventStore, PgStore};

async fn store() -> Option<(PgStore, PgPool)> {
    let url = std::env::var("FLEETPLANE_TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.unwrap();
    let store = PgStore::from_pool(pool.clone());
    store.migrate().await.unwrap();
    Some((store, pool))
}

fn fact(uid: Uuid, name: &str, size: &str) -> EventFact {
    EventFact {
        uid,
        environment_name: "dev".into(),
        involved_kind: "HorizontalPodAutoscaler".into(),
        involved_name: name.into(),
        involved_namespace: "team".into(),
        reason: "SuccessfulRescale".into(),
        data: json!({"newSize": size, "direction": "up"}),
        triggered_at: Some(Utc::now()),
    }
}

async fn stored_size(pool: &PgPool, uid: Uuid) -> Option<String> {
    sqlx::query_scalar::<_, String>("SELECT data->>'newSize' FROM events WHERE uid = $1")
        .bind(uid)
        .fetch_optional(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn batch_is_idempotent() {
    let Some((store, pool)) = store().await else { return };
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let batch = vec![fact(a, "web", "3"), fact(b, "api", "4")];
    assert_eq!(store.upsert_events(&batch).await.unwrap().upserted, 2);
    let batch = vec![fact(a, "web", "5"), fact(b, "api", "4")];
    let out = store.upsert_events(&batch).await.unwrap();
    assert_eq!(out.upserted, 2);
    assert!(out.failed.is_empty());
    assert_eq!(stored_size(&pool, a).await.as_deref(), Some("5"));
}

#[tokio::test]
async fn rejected_rows_fail_alone() {
    let Some((store, pool)) = store().await else { return };
    let (good, bad, late) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    // NUL is not valid in a text column, which rejects the whole bulk statement
    let batch = vec![fact(good, "web", "2"), fact(bad, "we\0b", "2"), fact(late, "api", "7")];
    let out = store.upsert_events(&batch).await.unwrap();
    assert_eq!(out.upserted, 2);
    assert_eq!(out.failed.len(), 1);
    assert_eq!(out.failed[0].0, 1);
    assert_eq!(stored_size(&pool, good).await.as_deref(), Some("2"));
    assert_eq!(stored_size(&pool, late).await.as_deref(), Some("7"));
    assert_eq!(stored_size(&pool, bad).await, None);
}

#[tokio::test]
async fn duplicate_keys_in_one_batch_converge() {
    let Some((store, pool)) = store().await else { return };
    let team = format!("team-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let row = |cost: f32| CostRow {
        environment: None,
        team_slug: team.clone(),
        app: "web".into(),
        cost_type: "CPU".into(),
        date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        daily_cost: cost,
    };
    let out = store.upsert_costs(&[row(1.0), row(2.5)]).await.unwrap();
    assert_eq!(out.upserted, 2);
    let costs: Vec<f32> = sqlx::query_scalar("SELECT daily_cost FROM cost WHERE team_slug = $1")
        .bind(&team)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(costs, vec![2.5]);
}
