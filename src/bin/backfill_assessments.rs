use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::env;
use uuid::Uuid;

use pharma_crm_api::db_storage::{AssessmentStorage, OpportunityStore};
use pharma_crm_api::scoring::{self, ScoringConfig};

/// Recomputes and stores a qualification assessment for every opportunity,
/// using the scoring configuration from the environment.
///
/// Usage: backfill_assessments [org_id]
///
/// With an org id the run is restricted to that organization; without one,
/// every organization with opportunities is processed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let org_filter: Option<Uuid> = match env::args().nth(1) {
        Some(raw) => Some(raw.parse()?),
        None => None,
    };

    let scoring_config = ScoringConfig::from_env_json(env::var("SCORING_CONFIG").ok().as_deref());
    if !scoring_config.is_usable() {
        tracing::warn!("Scoring configuration is degraded; every assessment will score zero");
    }

    let org_ids: Vec<Uuid> = match org_filter {
        Some(org) => vec![org],
        None => {
            sqlx::query_scalar("SELECT DISTINCT org_id FROM opportunities ORDER BY org_id")
                .fetch_all(&pool)
                .await?
        }
    };
    tracing::info!(
        "Backfilling assessments for {} organization(s)...",
        org_ids.len()
    );

    let store = OpportunityStore::new(pool.clone());
    let storage = AssessmentStorage::new(pool.clone());

    let mut stored_count = 0;
    let mut skipped_count = 0;
    let mut error_count = 0;
    let mut processed_count = 0;

    for org_id in org_ids {
        let ids = store.list_ids(org_id).await?;
        tracing::info!("Organization {}: {} opportunities", org_id, ids.len());

        for id in ids {
            processed_count += 1;
            if processed_count % 1000 == 0 {
                tracing::info!(
                    "Processed {} opportunities (Stored: {}, Skipped: {}, Errors: {})",
                    processed_count,
                    stored_count,
                    skipped_count,
                    error_count
                );
            }

            let opportunity = match store.fetch(org_id, id).await {
                Ok(Some(o)) => o,
                Ok(None) => {
                    // Deleted between listing and fetch
                    skipped_count += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!("Failed to fetch opportunity {}: {}", id, e);
                    error_count += 1;
                    continue;
                }
            };

            let assessment = scoring::assess(
                opportunity.id,
                opportunity.org_id,
                &opportunity.pillar_texts(),
                &scoring_config,
            );
            match storage.store(&assessment).await {
                Ok(_) => stored_count += 1,
                Err(e) => {
                    tracing::error!("Failed to store assessment for {}: {}", id, e);
                    error_count += 1;
                }
            }
        }
    }

    tracing::info!(
        "Backfill complete: {} processed, {} stored, {} skipped, {} errors",
        processed_count,
        stored_count,
        skipped_count,
        error_count
    );

    Ok(())
}
