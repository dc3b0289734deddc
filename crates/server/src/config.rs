use std::path::Path;

use anyhow::{Context, Result};
use rtpcast_protocol::RelayConfig;

/// Load configuration from a TOML file, or defaults when no path was given.
/// An explicitly requested file that cannot be read or parsed is a startup
/// error.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let Some(path) = path else {
        return Ok(RelayConfig::default());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: RelayConfig =
        toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;

    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn no_path_yields_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:4040");
        assert_eq!(config.ingress.addrs, vec!["127.0.0.1:9090"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/rtpcast.toml"))).is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rtpcast-config-test-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[server]\nbind = \"127.0.0.1:9999\"\nmax_peers = 5\n\n[ingress]\naddrs = [\"127.0.0.1:6000\"]"
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.server.bind, "127.0.0.1:9999");
        assert_eq!(config.server.max_peers, 5);
        assert_eq!(config.ingress.addrs, vec!["127.0.0.1:6000"]);
        // untouched sections keep defaults
        assert_eq!(config.channel.ping_interval_ms, 5000);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rtpcast-bad-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[server\nbind=").unwrap();

        let result = load_config(Some(&path));
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
