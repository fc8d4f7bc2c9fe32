//! Integration tests for the embedded migrations and their constraints.
//!
//! Each test gets its own database on the shared PostgreSQL instance from
//! `mise-test-utils` and drops it on completion.

use chrono::{Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use mise_db::pool;
use mise_test_utils::{create_test_db, drop_test_db, seed_plan};

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let counts = pool::table_counts(&pool).await.expect("table counts");
    let names: Vec<&str> = counts.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, pool::TABLES);

    let mut listed: Vec<String> = sqlx::query_scalar(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename NOT LIKE '\\_sqlx%'",
    )
    .fetch_all(&pool)
    .await
    .expect("list tables");
    listed.sort();
    let mut expected = pool::TABLES.to_vec();
    expected.sort();
    assert_eq!(listed, expected, "every migrated table is counted");
    assert!(counts.iter().all(|(_, c)| *c == 0));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    pool::run_migrations(&pool)
        .await
        .expect("second run should be a no-op");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn only_one_option_per_event_can_be_chosen() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();
    let seeded = seed_plan(&pool, now, now + Duration::days(1), 2).await;

    sqlx::query("UPDATE meal_plan_options SET chosen = TRUE WHERE id = $1")
        .bind(seeded.option_ids[0])
        .execute(&pool)
        .await
        .expect("first chosen flag");
    let second = sqlx::query("UPDATE meal_plan_options SET chosen = TRUE WHERE id = $1")
        .bind(seeded.option_ids[1])
        .execute(&pool)
        .await;
    assert!(second.is_err(), "partial unique index should reject a second winner");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn tasks_created_requires_chosen() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();
    let seeded = seed_plan(&pool, now, now + Duration::days(1), 1).await;

    let result = sqlx::query("UPDATE meal_plan_options SET tasks_created = TRUE WHERE id = $1")
        .bind(seeded.option_ids[0])
        .execute(&pool)
        .await;
    assert!(result.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_origin_check_rejects_both_foreign_keys() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();
    let seeded = seed_plan(&pool, now, now + Duration::days(1), 1).await;

    let result = sqlx::query(
        "INSERT INTO meal_plan_tasks \
         (id, option_id, origin_kind, recipe_step_id, recipe_prep_task_id, \
          cannot_start_before, must_finish_by) \
         VALUES ($1, $2, 'prep_task', $3, NULL, $4, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(seeded.option_ids[0])
    .bind(seeded.step_ids[0])
    .bind(now)
    .execute(&pool)
    .await;
    assert!(result.is_err(), "prep_task origin without a prep task id must fail");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn plan_status_check_rejects_unknown_values() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();
    let seeded = seed_plan(&pool, now, now + Duration::days(1), 1).await;

    let result = sqlx::query("UPDATE meal_plans SET status = 'closed' WHERE id = $1")
        .bind(seeded.plan_id)
        .execute(&pool)
        .await;
    assert!(result.is_err());

    let row = sqlx::query("SELECT status, election_method FROM meal_plans WHERE id = $1")
        .bind(seeded.plan_id)
        .fetch_one(&pool)
        .await
        .expect("plan row");
    assert_eq!(row.get::<String, _>("status"), "awaiting_votes");
    assert_eq!(row.get::<String, _>("election_method"), "schulze");

    pool.close().await;
    drop_test_db(&db_name).await;
}
