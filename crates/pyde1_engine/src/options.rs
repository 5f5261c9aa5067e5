//! Command line interface, mirroring `intiface_engine::bin::main`'s
//! `argh`-derived CLI struct and `getset`-derived accessors. CLI flags
//! override the config file path and a handful of individual fields;
//! everything else comes from the loaded [`PyDe1Config`].

use std::path::Path;

use argh::FromArgs;
use getset::{CopyGetters, Getters};
use pyde1_core::config::PyDe1Config;
use pyde1_core::error::{PyDe1Error, PyDe1Result, ValidationError};
use tracing::info;

/// pyde1 daemon: bridges a DE1 espresso machine to HTTP, MQTT, and IPC
/// consumers.
#[derive(FromArgs, Getters, CopyGetters)]
pub struct PyDe1CliArguments {
    /// print version and exit.
    #[argh(switch)]
    #[getset(get_copy = "pub")]
    version: bool,

    /// path to a YAML configuration file. Defaults to
    /// `/usr/local/etc/pyde1/pyde1.conf`.
    #[argh(option)]
    #[getset(get = "pub")]
    config_file: Option<String>,

    /// override `http.server_port` from the config file.
    #[argh(option)]
    #[getset(get_copy = "pub")]
    http_port: Option<u16>,

    /// override `bluetooth.scan_time` (seconds) from the config file.
    #[argh(option)]
    #[getset(get_copy = "pub")]
    scan_time: Option<u64>,

    /// disable the MQTT notification transport regardless of
    /// `mqtt.enabled` in the config file.
    #[argh(switch)]
    #[getset(get_copy = "pub")]
    no_mqtt: bool,

    /// set the `tracing` log level (error, warn, info, debug, trace).
    #[argh(option)]
    #[argh(default = "\"info\".to_owned()")]
    #[getset(get = "pub")]
    log_level: String,
}

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/pyde1/pyde1.conf";

/// Prints the package version and returns `true` if `args` requested it,
/// an early-exit check before configuration is loaded.
pub fn maybe_print_version(args: &PyDe1CliArguments) -> bool {
    if args.version() {
        println!("pyde1 {}", VERSION);
        return true;
    }
    false
}

/// Loads the configuration the CLI's `--config-file` names (or the
/// documented default path if it exists, or [`PyDe1Config::default`]
/// otherwise), then applies the individual-field overrides.
pub fn load_config(args: &PyDe1CliArguments) -> PyDe1Result<PyDe1Config> {
    let path = args
        .config_file()
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config = if Path::new(&path).exists() {
        info!(path, "loading configuration file");
        PyDe1Config::load(Path::new(&path))?
    } else {
        if args.config_file().is_some() {
            return Err(PyDe1Error::Validation(ValidationError::ValueError(
                "config_file".to_string(),
                format!("{path} does not exist"),
            )));
        }
        PyDe1Config::default()
    };

    if let Some(port) = args.http_port() {
        config.http.server_port = port;
    }
    if let Some(scan_time) = args.scan_time() {
        config.bluetooth.scan_time = scan_time;
    }
    if args.no_mqtt() {
        config.mqtt.enabled = false;
    }
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(overrides: impl FnOnce(&mut PyDe1CliArguments)) -> PyDe1CliArguments {
        let mut a = PyDe1CliArguments {
            version: false,
            config_file: None,
            http_port: None,
            scan_time: None,
            no_mqtt: false,
            log_level: "info".to_string(),
        };
        overrides(&mut a);
        a
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = load_config(&args(|_| {})).unwrap();
        assert_eq!(config.http.server_port, 1234);
    }

    #[test]
    fn explicit_missing_config_file_is_an_error() {
        let result = load_config(&args(|a| a.config_file = Some("/no/such/file.conf".to_string())));
        assert!(result.is_err());
    }

    #[test]
    fn cli_overrides_apply_after_loading_defaults() {
        let config = load_config(&args(|a| {
            a.http_port = Some(9999);
            a.no_mqtt = true;
        }))
        .unwrap();
        assert_eq!(config.http.server_port, 9999);
        assert!(!config.mqtt.enabled);
    }
}
