//! Loads [`Settings`] from the process environment: the `DEFAULT_BACKENDS`
//! sum type (§6) plus the boolean env flags that govern bootstrap and
//! SSL behaviour.

use crate::models::settings::{parse_default_backends, EnvFlags, Settings};

/// Reads `DEFAULT_BACKENDS` and the `SSL_*`/`DEBUG`/`FORCE_ENV`/`DNS_FIRST`
/// flags from the environment and normalises them into one [`Settings`].
///
/// `DEFAULT_BACKENDS` is required: a core with no seed configuration and
/// no persisted state has nothing to route, which is a configuration
/// error (`config_invalid`, §7), not a silent empty registry.
pub fn load_settings() -> Result<Settings, String> {
    let raw = std::env::var("DEFAULT_BACKENDS")
        .map_err(|_| "DEFAULT_BACKENDS environment variable is not set".to_string())?;
    let services = parse_default_backends(&raw)?;
    let settings = Settings {
        flags: EnvFlags::from_env(),
        services,
    };
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_default_backends_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("DEFAULT_BACKENDS");
        assert!(load_settings().is_err());
    }

    #[test]
    fn loads_single_service_shape() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(
            "DEFAULT_BACKENDS",
            r#"{"hostname":"a.example.com","backends":["https://a.origin"]}"#,
        );
        let settings = load_settings().unwrap();
        assert_eq!(settings.services.len(), 1);
        std::env::remove_var("DEFAULT_BACKENDS");
    }
}
