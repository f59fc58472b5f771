use std::env;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use tracing::debug;

use crate::config::FacadeConfig;

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const RABBITMQ_CONFIRM_MODE: &str = "RABBITMQ_CONFIRM_MODE";
pub const RABBITMQ_MANDATORY: &str = "RABBITMQ_MANDATORY";

/// Load `.env` (if present) and apply process environment overrides to `config`.
pub fn apply_env_overrides(config: &mut FacadeConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides(config, |key| env::var(key).ok())
}

/// Apply overrides from `lookup`. Unset variables leave the file value alone; a value that
/// does not parse is an error rather than silently ignored.
pub fn apply_overrides<F>(config: &mut FacadeConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(uri) = lookup(AMQP_ADDR) {
        debug!("Using {} from the environment", AMQP_ADDR);
        config.connection.uri = uri;
    }

    if let Some(val) = lookup(RABBITMQ_PREFETCH_COUNT) {
        let prefetch: u16 = val
            .trim()
            .parse()
            .context(format!("{} must be a number, got '{}'", RABBITMQ_PREFETCH_COUNT, val))?;
        config.subscriber.prefetch_count = Some(prefetch);
    }

    if let Some(val) = lookup(RABBITMQ_CONFIRM_MODE) {
        config.publisher.confirm = parse_flag(RABBITMQ_CONFIRM_MODE, &val)?;
    }

    if let Some(val) = lookup(RABBITMQ_MANDATORY) {
        config.publisher.mandatory = parse_flag(RABBITMQ_MANDATORY, &val)?;
    }

    config.validate()
}

fn parse_flag(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
    }
}
