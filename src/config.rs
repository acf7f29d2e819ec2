use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub auth_base_url: String,
    pub auth_service_key: String,
    pub webhook_secret: Option<String>, // Webhook ingestion is disabled when unset
    /// Raw JSON override for scoring weights/thresholds; parsed leniently at startup.
    pub scoring_config_json: Option<String>,
    pub assessment_cache_ttl_secs: u64,
    pub kpi_cache_ttl_secs: u64,
    pub recalc_cooldown_secs: u64,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            auth_base_url: std::env::var("AUTH_BASE_URL")
                .map_err(|_| anyhow::anyhow!("AUTH_BASE_URL environment variable required"))
                .and_then(|raw| {
                    let url = url::Url::parse(raw.trim())
                        .map_err(|e| anyhow::anyhow!("AUTH_BASE_URL is not a valid URL: {}", e))?;
                    if url.scheme() != "http" && url.scheme() != "https" {
                        anyhow::bail!("AUTH_BASE_URL must use http:// or https://");
                    }
                    // Trailing slashes would produce double-slash request paths
                    Ok(raw.trim().trim_end_matches('/').to_string())
                })?,
            auth_service_key: std::env::var("AUTH_SERVICE_KEY")
                .map_err(|_| anyhow::anyhow!("AUTH_SERVICE_KEY environment variable required"))
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("AUTH_SERVICE_KEY cannot be empty");
                    }
                    Ok(key)
                })?,
            webhook_secret: std::env::var("CRM_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            scoring_config_json: std::env::var("SCORING_CONFIG")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            assessment_cache_ttl_secs: std::env::var("ASSESSMENT_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("ASSESSMENT_CACHE_TTL_SECS must be a number"))?,
            kpi_cache_ttl_secs: std::env::var("KPI_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("KPI_CACHE_TTL_SECS must be a number"))?,
            recalc_cooldown_secs: std::env::var("KPI_RECALC_COOLDOWN_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("KPI_RECALC_COOLDOWN_SECS must be a number"))?,
            rate_limit_per_second: std::env::var("RATE_LIMIT_PER_SECOND")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| anyhow::anyhow!("RATE_LIMIT_PER_SECOND must be a number >= 1"))?,
            rate_limit_burst: std::env::var("RATE_LIMIT_BURST")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| anyhow::anyhow!("RATE_LIMIT_BURST must be a number >= 1"))?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Auth Base URL: {}", config.auth_base_url);
        tracing::debug!("Server Port: {}", config.port);
        if config.webhook_secret.is_none() {
            tracing::warn!("CRM_WEBHOOK_SECRET not set; the CRM webhook endpoint will reject all deliveries");
        }
        if config.scoring_config_json.is_some() {
            tracing::info!("Custom scoring configuration provided via SCORING_CONFIG");
        }

        Ok(config)
    }
}
