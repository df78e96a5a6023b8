//! Configuration loading for the bridge.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CLINIC_`, producing a typed [`AppConfig`]. Option names follow the
//! `CLINIC_<SECTION>_<OPTION>` convention, e.g. `CLINIC_CRM_WEBHOOK_URL`.

use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr, time::Duration};

use url::Url;

use crate::error::BridgeError;
use crate::stages::StageConfig;

/// Connection settings for the clinic appointment database.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub driver: String,
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub connection_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl SourceConfig {
    /// Connection URL in the form the SeaORM pool expects.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}",
            self.driver, self.username, self.password, self.server, self.port, self.database
        )
    }
}

/// Names of the CRM custom fields the bridge reads and writes. Stage and
/// field identifiers are opaque strings so a CRM admin can rename them
/// without a recompile.
#[derive(Debug, Clone)]
pub struct CrmFieldNames {
    pub external_id: String,
    pub plan: String,
    pub doctor: String,
    pub reception_start: String,
    pub services: String,
    pub status: String,
}

impl Default for CrmFieldNames {
    fn default() -> Self {
        Self {
            external_id: "UF_CRM_EXTERNAL_ID".to_string(),
            plan: "UF_CRM_TREATMENT_PLAN".to_string(),
            doctor: "UF_CRM_DOCTOR".to_string(),
            reception_start: "UF_CRM_RECEPTION_START".to_string(),
            services: "UF_CRM_SERVICES".to_string(),
            status: "UF_CRM_STATUS".to_string(),
        }
    }
}

/// CRM client behavior.
#[derive(Debug, Clone)]
pub struct CrmConfig {
    /// Inbound webhook base URL; the access token is embedded in it.
    pub webhook_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    /// Backoff ladder in seconds; the last entry is reused when attempts
    /// outnumber entries.
    pub retry_delays_secs: Vec<u64>,
    /// Upper bound on CRM calls per second.
    pub rate_limit: f64,
    /// Lead statuses that must never be converted.
    pub lead_final_statuses: Vec<String>,
    pub fields: CrmFieldNames,
}

impl CrmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

/// Cycle timing and batching.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval_minutes: u64,
    /// Page size when streaming the source.
    pub batch_size: u64,
    /// How many records share one round of coalesced CRM lookups.
    pub api_batch_size: usize,
    /// Depth of the very first sync when no watermark exists yet.
    pub initial_sync_days: i64,
    /// Branch identifier baked into every external id (1..=5).
    pub filial_id: u8,
}

/// Retry queue policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub store_path: PathBuf,
    pub max_queue_size: u64,
    pub max_retry_attempts: u32,
}

/// Treatment plan projector policy.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub cache_path: PathBuf,
    pub max_cache_entries: usize,
    pub throttle_minutes: i64,
}

/// Logging output settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

/// Application configuration derived from `CLINIC_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub crm: CrmConfig,
    pub sync: SyncConfig,
    pub queue: QueueConfig,
    pub plans: PlanConfig,
    pub logging: LoggingConfig,
    pub stages: StageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                driver: "mysql".to_string(),
                server: "localhost".to_string(),
                database: "clinic".to_string(),
                username: "bridge".to_string(),
                password: String::new(),
                port: 3306,
                connection_timeout_secs: 10,
                query_timeout_secs: 30,
            },
            crm: CrmConfig {
                webhook_url: "http://localhost/rest/1/token".to_string(),
                request_timeout_secs: 30,
                max_retries: 3,
                retry_delays_secs: vec![1, 5, 15],
                rate_limit: 2.0,
                lead_final_statuses: vec!["CONVERTED".to_string(), "JUNK".to_string()],
                fields: CrmFieldNames::default(),
            },
            sync: SyncConfig {
                interval_minutes: 2,
                batch_size: 100,
                api_batch_size: 20,
                initial_sync_days: 7,
                filial_id: 1,
            },
            queue: QueueConfig {
                store_path: PathBuf::from("state/queue.store"),
                max_queue_size: 1000,
                max_retry_attempts: 3,
            },
            plans: PlanConfig {
                cache_path: PathBuf::from("state/plan_cache.store"),
                max_cache_entries: 10_000,
                throttle_minutes: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
            stages: StageConfig::default(),
        }
    }
}

impl AppConfig {
    /// Checks cross-field invariants that the per-option parsers cannot see.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let url = Url::parse(&self.crm.webhook_url)
            .map_err(|err| BridgeError::ConfigInvalid(format!("CRM_WEBHOOK_URL: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BridgeError::ConfigInvalid(format!(
                "CRM_WEBHOOK_URL must be http(s), got '{}'",
                url.scheme()
            )));
        }
        if !(1..=5).contains(&self.sync.filial_id) {
            return Err(BridgeError::ConfigInvalid(format!(
                "SYNC_FILIAL_ID must be 1..=5, got {}",
                self.sync.filial_id
            )));
        }
        if self.crm.retry_delays_secs.is_empty() {
            return Err(BridgeError::ConfigInvalid(
                "CRM_RETRY_DELAYS must contain at least one delay".to_string(),
            ));
        }
        if self.crm.max_retries == 0 {
            return Err(BridgeError::ConfigInvalid(
                "CRM_MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if self.crm.rate_limit <= 0.0 {
            return Err(BridgeError::ConfigInvalid(
                "CRM_RATE_LIMIT must be positive".to_string(),
            ));
        }
        if self.sync.interval_minutes == 0 {
            return Err(BridgeError::ConfigInvalid(
                "SYNC_INTERVAL_MINUTES must be at least 1".to_string(),
            ));
        }
        if self.sync.batch_size == 0 || self.sync.api_batch_size == 0 {
            return Err(BridgeError::ConfigInvalid(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if self.queue.max_retry_attempts == 0 {
            return Err(BridgeError::ConfigInvalid(
                "QUEUE_MAX_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration using layered `.env` files and `CLINIC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates the full configuration.
    pub fn load(&self) -> Result<AppConfig, BridgeError> {
        let mut layered = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("CLINIC_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let defaults = AppConfig::default();

        let source = SourceConfig {
            driver: take(&mut layered, "SOURCE_DRIVER", defaults.source.driver),
            server: take(&mut layered, "SOURCE_SERVER", defaults.source.server),
            database: take(&mut layered, "SOURCE_DATABASE", defaults.source.database),
            username: take(&mut layered, "SOURCE_USERNAME", defaults.source.username),
            password: take(&mut layered, "SOURCE_PASSWORD", defaults.source.password),
            port: take_parse(&mut layered, "SOURCE_PORT", defaults.source.port)?,
            connection_timeout_secs: take_parse(
                &mut layered,
                "SOURCE_CONNECTION_TIMEOUT",
                defaults.source.connection_timeout_secs,
            )?,
            query_timeout_secs: take_parse(
                &mut layered,
                "SOURCE_QUERY_TIMEOUT",
                defaults.source.query_timeout_secs,
            )?,
        };

        let crm = CrmConfig {
            webhook_url: take(&mut layered, "CRM_WEBHOOK_URL", defaults.crm.webhook_url)
                .trim_end_matches('/')
                .to_string(),
            request_timeout_secs: take_parse(
                &mut layered,
                "CRM_REQUEST_TIMEOUT",
                defaults.crm.request_timeout_secs,
            )?,
            max_retries: take_parse(&mut layered, "CRM_MAX_RETRIES", defaults.crm.max_retries)?,
            retry_delays_secs: take_csv(
                &mut layered,
                "CRM_RETRY_DELAYS",
                defaults.crm.retry_delays_secs,
            )?,
            rate_limit: take_parse(&mut layered, "CRM_RATE_LIMIT", defaults.crm.rate_limit)?,
            lead_final_statuses: take_csv(
                &mut layered,
                "CRM_LEAD_FINAL_STATUSES",
                defaults.crm.lead_final_statuses,
            )?,
            fields: CrmFieldNames {
                external_id: take(
                    &mut layered,
                    "CRM_FIELD_EXTERNAL_ID",
                    defaults.crm.fields.external_id,
                ),
                plan: take(&mut layered, "CRM_FIELD_PLAN", defaults.crm.fields.plan),
                doctor: take(&mut layered, "CRM_FIELD_DOCTOR", defaults.crm.fields.doctor),
                reception_start: take(
                    &mut layered,
                    "CRM_FIELD_RECEPTION_START",
                    defaults.crm.fields.reception_start,
                ),
                services: take(
                    &mut layered,
                    "CRM_FIELD_SERVICES",
                    defaults.crm.fields.services,
                ),
                status: take(&mut layered, "CRM_FIELD_STATUS", defaults.crm.fields.status),
            },
        };

        let sync = SyncConfig {
            interval_minutes: take_parse(
                &mut layered,
                "SYNC_INTERVAL_MINUTES",
                defaults.sync.interval_minutes,
            )?,
            batch_size: take_parse(&mut layered, "SYNC_BATCH_SIZE", defaults.sync.batch_size)?,
            api_batch_size: take_parse(
                &mut layered,
                "SYNC_API_BATCH_SIZE",
                defaults.sync.api_batch_size,
            )?,
            initial_sync_days: take_parse(
                &mut layered,
                "SYNC_INITIAL_SYNC_DAYS",
                defaults.sync.initial_sync_days,
            )?,
            filial_id: take_parse(&mut layered, "SYNC_FILIAL_ID", defaults.sync.filial_id)?,
        };

        let queue = QueueConfig {
            store_path: PathBuf::from(take(
                &mut layered,
                "QUEUE_STORE_PATH",
                defaults.queue.store_path.display().to_string(),
            )),
            max_queue_size: take_parse(
                &mut layered,
                "QUEUE_MAX_QUEUE_SIZE",
                defaults.queue.max_queue_size,
            )?,
            max_retry_attempts: take_parse(
                &mut layered,
                "QUEUE_MAX_RETRY_ATTEMPTS",
                defaults.queue.max_retry_attempts,
            )?,
        };

        let plans = PlanConfig {
            cache_path: PathBuf::from(take(
                &mut layered,
                "PLANS_CACHE_PATH",
                defaults.plans.cache_path.display().to_string(),
            )),
            max_cache_entries: take_parse(
                &mut layered,
                "PLANS_MAX_CACHE_ENTRIES",
                defaults.plans.max_cache_entries,
            )?,
            throttle_minutes: take_parse(
                &mut layered,
                "PLANS_THROTTLE_MINUTES",
                defaults.plans.throttle_minutes,
            )?,
        };

        let logging = LoggingConfig {
            level: take(&mut layered, "LOGGING_LEVEL", defaults.logging.level),
            format: take(&mut layered, "LOGGING_FORMAT", defaults.logging.format),
        };

        let stages = StageConfig {
            new: take(&mut layered, "STAGE_NEW", defaults.stages.new),
            contact_made: take(
                &mut layered,
                "STAGE_CONTACT_MADE",
                defaults.stages.contact_made,
            ),
            treatment: take(&mut layered, "STAGE_TREATMENT", defaults.stages.treatment),
            completed_unpaid: take(
                &mut layered,
                "STAGE_COMPLETED_UNPAID",
                defaults.stages.completed_unpaid,
            ),
            won: take(&mut layered, "STAGE_WON", defaults.stages.won),
            lose: take(&mut layered, "STAGE_LOSE", defaults.stages.lose),
            protected: take_csv(&mut layered, "STAGE_PROTECTED", defaults.stages.protected)?,
        };

        let config = AppConfig {
            source,
            crm,
            sync,
            queue,
            plans,
            logging,
            stages,
        };
        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<BTreeMap<String, String>, BridgeError> {
        let mut values = BTreeMap::new();
        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;
        Ok(values)
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), BridgeError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|err| {
                        BridgeError::ConfigInvalid(format!(
                            "failed to read {}: {err}",
                            path.display()
                        ))
                    })?;
                    if let Some(stripped) = key.strip_prefix("CLINIC_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(BridgeError::ConfigInvalid(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }
}

fn take(values: &mut BTreeMap<String, String>, key: &str, default: String) -> String {
    values
        .remove(key)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn take_parse<T: FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, BridgeError>
where
    T::Err: std::fmt::Display,
{
    match values.remove(key).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| BridgeError::ConfigInvalid(format!("{key}='{raw}': {err}"))),
        None => Ok(default),
    }
}

fn take_csv<T: FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
    default: Vec<T>,
) -> Result<Vec<T>, BridgeError>
where
    T::Err: std::fmt::Display,
{
    match values.remove(key).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse()
                    .map_err(|err| BridgeError::ConfigInvalid(format!("{key}='{raw}': {err}")))
            })
            .collect(),
        None => Ok(default),
    }
}
