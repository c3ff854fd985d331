mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, LoggingSettings, PersistenceSettings, QueueSettings, Settings};

/// Loads the configuration from `config/default` and the environment.
///
/// A `.env` file, when present, is loaded into the environment first.
/// Environment keys use the `RELAYBUS` prefix and `__` between sections,
/// for example `RELAYBUS__QUEUE__MAX_SIZE=10`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("RELAYBUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests;
