//! Configuration surface (spec.md §6). Every value has a documented default
//! and an environment-variable override, assembled the way the reference
//! orchestrator's own `Config::load` reads `std::env::var` with fallbacks
//! rather than a layered file loader — this crate has no secrets of its own
//! to validate, so the loader is simpler than a full service config.

use std::env;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::models::ModelTierKind;

#[derive(Debug, Clone)]
pub struct C3Config {
    /// Risk bound δ on conformal reuse errors.
    pub delta: f64,
    pub k_neighbors: usize,
    pub similarity_floor: f64,
    pub lambda_edit: f64,
    pub calibration_window: usize,
    pub calibration_n_min: usize,
}

impl Default for C3Config {
    fn default() -> Self {
        Self {
            delta: 0.01,
            k_neighbors: 8,
            similarity_floor: 0.88,
            lambda_edit: 0.25,
            calibration_window: 1000,
            calibration_n_min: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierPrior {
    pub kind: ModelTierKind,
    pub expected_cost: f64,
    pub prior_quality: f64,
}

#[derive(Debug, Clone)]
pub struct VoitConfig {
    pub tiers: Vec<TierPrior>,
    pub ensemble_enabled: bool,
    /// Weight given to the newest observation in the per-partition EWMA.
    pub ewma_alpha: f64,
}

impl Default for VoitConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierPrior {
                    kind: ModelTierKind::Nano,
                    expected_cost: 0.1,
                    prior_quality: 0.55,
                },
                TierPrior {
                    kind: ModelTierKind::Mini,
                    expected_cost: 0.3,
                    prior_quality: 0.80,
                },
                TierPrior {
                    kind: ModelTierKind::Full,
                    expected_cost: 0.7,
                    prior_quality: 0.92,
                },
                TierPrior {
                    kind: ModelTierKind::Ensemble,
                    expected_cost: 1.0,
                    prior_quality: 0.96,
                },
            ],
            ensemble_enabled: true,
            ewma_alpha: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_concurrency_per_partition: usize,
    /// Per-partition TTL (spec.md §9 open question: the source mentions
    /// differing TTL numbers per deployment; this crate fixes one default
    /// plus an explicit per-partition override map rather than guessing a
    /// single historical value).
    pub default_ttl: Duration,
    pub partition_ttl_overrides: std::collections::HashMap<String, Duration>,
    /// Floor below which a rebuild is rejected rather than written back, even
    /// when it fell short of `request.quality_target` (spec.md §8 S4: "cache
    /// if overall_quality >= 0.5, else reject — configured").
    pub min_cacheable_quality: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrency_per_partition: 64,
            default_ttl: Duration::from_secs(60 * 60 * 24 * 7),
            partition_ttl_overrides: std::collections::HashMap::new(),
            min_cacheable_quality: 0.5,
        }
    }
}

impl PipelineSettings {
    pub fn ttl_for(&self, partition: &str) -> Duration {
        self.partition_ttl_overrides
            .get(partition)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutsConfig {
    pub embedding: Duration,
    pub vector_index_query: Duration,
    pub cache_read: Duration,
    pub cache_write: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            embedding: Duration::from_secs(1),
            vector_index_query: Duration::from_millis(200),
            cache_read: Duration::from_millis(100),
            cache_write: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub c3: C3Config,
    pub voit: VoitConfig,
    pub pipeline: PipelineSettings,
    pub timeouts: TimeoutsConfig,
    pub validator_version: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            c3: C3Config::default(),
            voit: VoitConfig::default(),
            pipeline: PipelineSettings::default(),
            timeouts: TimeoutsConfig::default(),
            validator_version: 1,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the environment, falling back to the
    /// documented default for anything unset or unparsable. Unlike
    /// `voit.tiers`, which is a structural default a deployment typically
    /// overrides in code via `VoitConfig { tiers: ..., ..Default::default() }`,
    /// every scalar here has an env var override.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let mut config = Self::default();

        config.c3.delta = env_parse("C3_DELTA", config.c3.delta)?;
        config.c3.k_neighbors = env_parse("C3_K_NEIGHBORS", config.c3.k_neighbors)?;
        config.c3.similarity_floor = env_parse("C3_SIMILARITY_FLOOR", config.c3.similarity_floor)?;
        config.c3.lambda_edit = env_parse("C3_LAMBDA_EDIT", config.c3.lambda_edit)?;
        config.c3.calibration_window =
            env_parse("C3_CALIBRATION_WINDOW", config.c3.calibration_window)?;
        config.c3.calibration_n_min =
            env_parse("C3_CALIBRATION_N_MIN", config.c3.calibration_n_min)?;

        config.voit.ensemble_enabled =
            env_parse("VOIT_ENSEMBLE_ENABLED", config.voit.ensemble_enabled)?;

        config.pipeline.max_concurrency_per_partition = env_parse(
            "PIPELINE_MAX_CONCURRENCY_PER_PARTITION",
            config.pipeline.max_concurrency_per_partition,
        )?;

        if let Ok(secs) = env::var("PIPELINE_DEFAULT_TTL_SECS") {
            config.pipeline.default_ttl = Duration::from_secs(secs.parse().map_err(|_| {
                CoreError::Configuration("PIPELINE_DEFAULT_TTL_SECS must be an integer".into())
            })?);
        }

        config.timeouts.embedding =
            Duration::from_millis(env_parse("TIMEOUT_EMBEDDING_MS", 1000)?);
        config.timeouts.vector_index_query =
            Duration::from_millis(env_parse("TIMEOUT_VECTOR_INDEX_MS", 200)?);
        config.timeouts.cache_read = Duration::from_millis(env_parse("TIMEOUT_CACHE_READ_MS", 100)?);
        config.timeouts.cache_write =
            Duration::from_millis(env_parse("TIMEOUT_CACHE_WRITE_MS", 500)?);

        config.validator_version = env_parse("VALIDATOR_VERSION", config.validator_version)?;

        Ok(config)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| CoreError::Configuration(format!("{key} is not valid"))),
        Err(_) => Ok(default),
    }
}
