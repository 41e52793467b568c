use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use thiserror::Error;

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Partition count assumed by the Postgres broker. Deployment parameter;
/// nothing in the core depends on the specific value.
pub static BROKER_PARTITIONS: Lazy<i32> = Lazy::new(|| env_parse("BROKER_PARTITIONS", 16));

/// Seconds a consumer may hold a partition lease before it is reclaimable.
pub static BROKER_LEASE_SECONDS: Lazy<i64> = Lazy::new(|| env_parse("BROKER_LEASE_SECONDS", 30));

/// Idle sleep between broker polls when no message is available.
pub static BROKER_POLL_MILLIS: Lazy<u64> = Lazy::new(|| env_parse("BROKER_POLL_MILLIS", 250));

pub static OUTBOX_POLL_MILLIS: Lazy<u64> = Lazy::new(|| env_parse("OUTBOX_POLL_MILLIS", 500));

pub static OUTBOX_BATCH_SIZE: Lazy<i64> = Lazy::new(|| env_parse("OUTBOX_BATCH_SIZE", 50));

pub static RETRY_DISPATCH_MILLIS: Lazy<u64> = Lazy::new(|| env_parse("RETRY_DISPATCH_MILLIS", 500));

pub static CONFIG_CACHE_TTL_SECONDS: Lazy<u64> =
    Lazy::new(|| env_parse("CONFIG_CACHE_TTL_SECONDS", 30));

/// Wall-clock budget for a single handler invocation.
pub static HANDLER_DEADLINE_SECONDS: Lazy<u64> =
    Lazy::new(|| env_parse("HANDLER_DEADLINE_SECONDS", 30));

/// Per-role deadline override (`HANDLER_DEADLINE_SECONDS_TOOL=120`), falling
/// back to the global default.
pub fn handler_deadline_seconds(role: WorkerRole) -> u64 {
    let name = format!(
        "HANDLER_DEADLINE_SECONDS_{}",
        role.as_str().to_ascii_uppercase()
    );
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(*HANDLER_DEADLINE_SECONDS)
}

/// How recently the store must have answered a ping for /readyz to pass.
pub static READY_PROBE_SECONDS: Lazy<i64> = Lazy::new(|| env_parse("READY_PROBE_SECONDS", 15));

/// Compare-and-set retries before a version conflict is treated as transient.
pub const CAS_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Intake,
    Triage,
    Policy,
    Playbook,
    Step,
    Tool,
    Feedback,
    SlaMonitor,
    Api,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Intake => "intake",
            WorkerRole::Triage => "triage",
            WorkerRole::Policy => "policy",
            WorkerRole::Playbook => "playbook",
            WorkerRole::Step => "step",
            WorkerRole::Tool => "tool",
            WorkerRole::Feedback => "feedback",
            WorkerRole::SlaMonitor => "sla_monitor",
            WorkerRole::Api => "api",
        }
    }

    pub fn default_group_id(&self) -> String {
        format!("{}-workers", self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "intake" => Ok(WorkerRole::Intake),
            "triage" => Ok(WorkerRole::Triage),
            "policy" => Ok(WorkerRole::Policy),
            "playbook" => Ok(WorkerRole::Playbook),
            "step" => Ok(WorkerRole::Step),
            "tool" => Ok(WorkerRole::Tool),
            "feedback" => Ok(WorkerRole::Feedback),
            "sla_monitor" | "sla-monitor" => Ok(WorkerRole::SlaMonitor),
            "api" => Ok(WorkerRole::Api),
            other => Err(ConfigError::Invalid {
                name: "WORKER_ROLE",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-process surface described in the worker CLI/env contract.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub role: WorkerRole,
    pub concurrency: usize,
    pub group_id: String,
    pub store_url: String,
    pub broker_url: String,
    pub health_port: u16,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let role: WorkerRole = std::env::var("WORKER_ROLE")
            .map_err(|_| ConfigError::Missing("WORKER_ROLE"))?
            .parse()?;

        let concurrency = match std::env::var("CONCURRENCY") {
            Ok(raw) => {
                let parsed: usize = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "CONCURRENCY",
                    value: raw.clone(),
                })?;
                if parsed == 0 {
                    return Err(ConfigError::Invalid {
                        name: "CONCURRENCY",
                        value: raw,
                    });
                }
                parsed
            }
            Err(_) => 4,
        };

        let store_url = std::env::var("STORE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::Missing("STORE_URL"))?;
        let broker_url = std::env::var("BROKER_BOOTSTRAP").unwrap_or_else(|_| store_url.clone());
        let group_id = std::env::var("GROUP_ID").unwrap_or_else(|_| role.default_group_id());
        let health_port = match std::env::var("HEALTH_PORT") {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "HEALTH_PORT",
                value: raw,
            })?,
            Err(_) => 8080,
        };

        Ok(WorkerConfig {
            role,
            concurrency,
            group_id,
            store_url,
            broker_url,
            health_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            WorkerRole::Intake,
            WorkerRole::Triage,
            WorkerRole::Policy,
            WorkerRole::Playbook,
            WorkerRole::Step,
            WorkerRole::Tool,
            WorkerRole::Feedback,
            WorkerRole::SlaMonitor,
            WorkerRole::Api,
        ] {
            assert_eq!(role.as_str().parse::<WorkerRole>().unwrap(), role);
        }
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!("reindexer".parse::<WorkerRole>().is_err());
    }
}
