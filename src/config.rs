//! Configuration for the cbmfs crate
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::error;

/// Configuration format
pub struct Config {
    /// Version of the configuration root
    pub version: String,

    /// The general settings
    pub settings: config::Config,
}

/// Trait that defines a set of methods that allow loading and
/// unloading configuration data
pub trait Configuration {
    /// Load the configuration data from an already-built settings
    /// object
    fn load(settings: config::Config) -> std::result::Result<Config, error::Error>;
}

impl Configuration for Config {
    fn load(settings: config::Config) -> std::result::Result<Config, error::Error> {
        let config = Config {
            version: String::from("0.3.0"),
            settings,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Configuration};

    #[test]
    fn load_default_settings_works() {
        let settings = config::Config::default();
        let cfg = Config::load(settings).expect("Error loading cbmfs config");
        assert!(cfg.settings.get_bool("debug").is_err());
    }
}
