mod parsing;
mod secret;
mod settings;
mod types;

pub(crate) use types::{ConfigError, Settings};
#[cfg(test)]
pub(crate) use settings::MAX_PIPELINE_TIMEOUT_SECONDS;
