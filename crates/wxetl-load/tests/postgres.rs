use std::env;
use std::str::FromStr;

use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use uuid::Uuid;
use wxetl_core::{CurrentWeatherRecord, HourlyForecastRecord, Relation, TransformedBatch};
use wxetl_load::{load, upsert, LoadError, PgWeatherStore, RelationBatch, WeatherStore};

/// Pool pinned to a throwaway schema so runs never see each other's rows.
async fn isolated_pool() -> Result<Option<(PgPool, String)>> {
    let database_url = match env::var("WXETL_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping postgres integration test because WXETL_TEST_DATABASE_URL is not set"
            );
            return Ok(None);
        }
    };

    let schema = format!("wxetl_test_{}", Uuid::new_v4().simple());
    let admin = PgPoolOptions::new().max_connections(1).connect(&database_url).await?;
    sqlx::query(&format!("CREATE SCHEMA {schema}")).execute(&admin).await?;
    admin.close().await;

    let options = PgConnectOptions::from_str(&database_url)?
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new().max_connections(2).connect_with(options).await?;
    Ok(Some((pool, schema)))
}

async fn drop_schema(pool: &PgPool, schema: &str) -> Result<()> {
    sqlx::query(&format!("DROP SCHEMA {schema} CASCADE")).execute(pool).await?;
    Ok(())
}

fn local(h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 15)
        .and_then(|d| d.and_hms_opt(h, 0, 0))
        .unwrap()
}

fn batch() -> TransformedBatch {
    let stamp = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).single().unwrap();
    TransformedBatch {
        current: vec![CurrentWeatherRecord {
            location_name: "London".into(),
            latitude: Some(51.5074),
            longitude: Some(-0.1278),
            temperature_celsius: Some(15.5),
            wind_speed_kmh: Some(10.2),
            wind_direction_degrees: Some(180),
            weather_code: Some(1),
            observation_time: Some(local(12)),
            extracted_at: stamp,
            loaded_at: stamp,
        }],
        hourly: (0..24)
            .map(|h| HourlyForecastRecord {
                location_name: "London".into(),
                forecast_time: local(h),
                temperature_celsius: Some(5.0 + f64::from(h) / 10.0),
                relative_humidity_percent: Some(80),
                wind_speed_kmh: if h % 2 == 0 { Some(9.4) } else { None },
                loaded_at: stamp,
            })
            .collect(),
    }
}

#[tokio::test]
async fn repeated_loads_are_idempotent() -> Result<()> {
    let Some((pool, schema)) = isolated_pool().await? else {
        return Ok(());
    };
    let store = PgWeatherStore::from_pool(pool.clone());

    let first = load(&batch(), &store).await?;
    assert_eq!(first.current_weather, 1);
    assert_eq!(first.hourly_weather, 24);

    let second = load(&batch(), &store).await?;
    assert_eq!(second.total(), 0);

    let row = sqlx::query("SELECT COUNT(*) AS n FROM hourly_weather").fetch_one(&pool).await?;
    assert_eq!(row.try_get::<i64, _>("n")?, 24);

    drop_schema(&pool, &schema).await
}

#[tokio::test]
async fn schema_creation_can_run_every_time() -> Result<()> {
    let Some((pool, schema)) = isolated_pool().await? else {
        return Ok(());
    };
    let store = PgWeatherStore::from_pool(pool.clone());
    store.ensure_schema().await?;
    store.ensure_schema().await?;
    drop_schema(&pool, &schema).await
}

#[tokio::test]
async fn failing_row_rolls_back_the_whole_relation_batch() -> Result<()> {
    let Some((pool, schema)) = isolated_pool().await? else {
        return Ok(());
    };
    let store = PgWeatherStore::from_pool(pool.clone());

    let mut input = batch();
    // NUMERIC(5, 2) overflow on the last row.
    if let Some(last) = input.hourly.last_mut() {
        last.temperature_celsius = Some(12_345.0);
    }

    let err = load(&input, &store).await.unwrap_err();
    assert!(matches!(
        err,
        LoadError::Write {
            relation: Relation::HourlyWeather,
            ..
        }
    ));

    let current = sqlx::query("SELECT COUNT(*) AS n FROM current_weather").fetch_one(&pool).await?;
    assert_eq!(current.try_get::<i64, _>("n")?, 1);
    let hourly = sqlx::query("SELECT COUNT(*) AS n FROM hourly_weather").fetch_one(&pool).await?;
    assert_eq!(hourly.try_get::<i64, _>("n")?, 0);

    drop_schema(&pool, &schema).await
}

#[tokio::test]
async fn store_assigns_loaded_at_on_write() -> Result<()> {
    let Some((pool, schema)) = isolated_pool().await? else {
        return Ok(());
    };
    let store = PgWeatherStore::from_pool(pool.clone());
    store.ensure_schema().await?;

    let input = batch();
    let before = Utc::now();
    let inserted = upsert(&store, RelationBatch::Current(&input.current)).await?;
    assert_eq!(inserted, 1);

    let row = sqlx::query("SELECT loaded_at FROM current_weather").fetch_one(&pool).await?;
    let loaded_at: chrono::DateTime<Utc> = row.try_get("loaded_at")?;
    assert!(loaded_at > input.current[0].loaded_at);
    assert!(loaded_at >= before - chrono::Duration::seconds(60));

    drop_schema(&pool, &schema).await
}
