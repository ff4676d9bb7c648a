use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

/// Read an environment-variable override for a configuration default,
/// logging when the environment supplies a value (or supplies an invalid
/// one). Reloaded at the start of every throttled-runner attempt, so a
/// running build picks up new limits without restarting.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var = match env::var(name) {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(_)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}");
            return default;
        },
    };
    match T::from_str(&var) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Policy for building a target index by scanning a source index's key
/// space instead of the primary-key space.
#[derive(Clone, Debug, Default)]
pub struct IndexFromIndexPolicy {
    pub source_index: Option<String>,
    pub allow_record_scan: bool,
    /// Whether re-deriving an entry from the same source-index entry twice
    /// is guaranteed to produce the same result. `store_api` has no native
    /// notion of index idempotence, so the caller supplies it.
    pub source_is_idempotent: bool,
    /// Record types the source index is guaranteed to cover. Validation
    /// fails unless this is a superset of the target index's own record
    /// types.
    pub source_record_types: Vec<String>,
}

/// The five state-precondition gate policies from the on-disk lifecycle
/// table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexStatePrecondition {
    BuildIfDisabled,
    BuildIfDisabledContinueIfWriteOnly,
    BuildIfDisabledRebuildIfWriteOnly,
    ForceBuild,
    ErrorIfDisabledContinueIfWriteOnly,
}

/// Runtime knobs for one build, reloaded from the environment at the start
/// of every throttled-runner attempt.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub max_limit: u32,
    pub max_write_limit_bytes: u64,
    pub max_retries: u32,
    pub records_per_second: u32,
    /// Negative disables periodic progress logging.
    pub progress_log_interval_millis: i64,
    /// Negative means "never increase `L_eff` back up".
    pub increase_limit_after: i64,
    pub lease_length_millis: u64,
    pub track_progress: bool,
    pub use_synchronized_session: bool,
    pub index_state_precondition: IndexStatePrecondition,
    pub index_from_index_policy: IndexFromIndexPolicy,
    /// Number of disjoint sub-ranges the Orchestrator splits the missing
    /// range into when running more than one throttled runner concurrently.
    pub parallelism: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_limit: 100,
            max_write_limit_bytes: 900_000,
            max_retries: 100,
            records_per_second: 10_000,
            progress_log_interval_millis: -1,
            increase_limit_after: -1,
            lease_length_millis: 10_000,
            track_progress: true,
            use_synchronized_session: true,
            index_state_precondition: IndexStatePrecondition::BuildIfDisabledContinueIfWriteOnly,
            index_from_index_policy: IndexFromIndexPolicy::default(),
            parallelism: 1,
        }
    }
}

impl BuildConfig {
    /// Reload the subset of fields that are meaningfully overridable while a
    /// build is running (the throttling knobs), without disturbing policy
    /// decisions (precondition, index-from-index) made at start-of-build.
    pub fn reload_from_env(&mut self) {
        self.max_limit = env_config("ONLINE_INDEX_BUILDER_MAX_LIMIT", self.max_limit);
        self.max_write_limit_bytes =
            env_config("ONLINE_INDEX_BUILDER_MAX_WRITE_LIMIT_BYTES", self.max_write_limit_bytes);
        self.max_retries = env_config("ONLINE_INDEX_BUILDER_MAX_RETRIES", self.max_retries);
        self.records_per_second =
            env_config("ONLINE_INDEX_BUILDER_RECORDS_PER_SECOND", self.records_per_second);
        self.increase_limit_after =
            env_config("ONLINE_INDEX_BUILDER_INCREASE_LIMIT_AFTER", self.increase_limit_after);
    }
}

/// Per-iteration config source the throttled runner consults at the top of
/// every attempt. The default implementation just re-reads environment
/// overrides; tests can substitute a fixed or programmatically mutated
/// config instead.
pub trait ConfigLoader: Send + Sync {
    fn load(&self) -> BuildConfig;
}

pub struct EnvConfigLoader {
    pub base: BuildConfig,
}

impl ConfigLoader for EnvConfigLoader {
    fn load(&self) -> BuildConfig {
        let mut config = self.base.clone();
        config.reload_from_env();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_external_interface_table() {
        let config = BuildConfig::default();
        assert_eq!(config.max_limit, 100);
        assert_eq!(config.max_write_limit_bytes, 900_000);
        assert_eq!(config.max_retries, 100);
        assert_eq!(config.records_per_second, 10_000);
        assert_eq!(config.progress_log_interval_millis, -1);
        assert_eq!(config.increase_limit_after, -1);
        assert_eq!(config.lease_length_millis, 10_000);
        assert!(config.track_progress);
        assert!(config.use_synchronized_session);
        assert_eq!(config.parallelism, 1);
    }
}
