use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rtpcast_protocol::RelayConfig;

pub struct Args {
    pub config: Option<PathBuf>,
    pub ingress: Option<Vec<String>>,
    pub bind: Option<String>,
    pub max_peers: Option<usize>,
    pub mtu: Option<usize>,
    pub ping_interval: Option<Duration>,
    pub disconnect_timeout: Option<Duration>,
    pub log_level: String,
}

pub fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    parse_from(&args[1..])
}

fn parse_from(args: &[String]) -> Result<Args> {
    let mut parsed = Args {
        config: None,
        ingress: None,
        bind: None,
        max_peers: None,
        mtu: None,
        ping_interval: None,
        disconnect_timeout: None,
        log_level: "info".to_string(),
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("rtpcast-server {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("rtpcast-server - RTP to WebRTC one-to-many relay");
                println!();
                println!("USAGE:");
                println!("    rtpcast-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -i <ADDRS>           Comma-separated UDP ingress addresses, one stream each");
                println!("                         [default: 127.0.0.1:9090]");
                println!("    -o <ADDR>            HTTP + WebSocket bind address [default: 0.0.0.0:4040]");
                println!("    -p <COUNT>           Maximum concurrent peers [default: 300]");
                println!("    -mtu <BYTES>         UDP read buffer size [default: 1500]");
                println!("    -ping <DURATION>     WebSocket ping interval, e.g. 5s or 500ms [default: 5s]");
                println!("    -disconnect <DURATION>  Close handshake timeout [default: 10s]");
                println!("    -l <LEVEL>           Log level: trace|debug|info|warn|error|fatal|disable");
                println!("                         [default: info]");
                println!("    -c, --config <PATH>  TOML configuration file; flags override it");
                println!("    -V, --version        Print version and exit");
                println!("    -h, --help           Print this help and exit");
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                parsed.config =
                    Some(PathBuf::from(args.get(i).context("missing --config value")?));
            }
            "-i" => {
                i += 1;
                let list = args.get(i).context("missing -i value")?;
                parsed.ingress = Some(
                    list.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                );
            }
            "-o" => {
                i += 1;
                parsed.bind = Some(args.get(i).context("missing -o value")?.clone());
            }
            "-p" => {
                i += 1;
                parsed.max_peers = Some(
                    args.get(i)
                        .context("missing -p value")?
                        .parse()
                        .context("invalid -p value")?,
                );
            }
            "-mtu" => {
                i += 1;
                parsed.mtu = Some(
                    args.get(i)
                        .context("missing -mtu value")?
                        .parse()
                        .context("invalid -mtu value")?,
                );
            }
            "-ping" => {
                i += 1;
                parsed.ping_interval = Some(
                    parse_duration(args.get(i).context("missing -ping value")?)
                        .context("invalid -ping value")?,
                );
            }
            "-disconnect" => {
                i += 1;
                parsed.disconnect_timeout = Some(
                    parse_duration(args.get(i).context("missing -disconnect value")?)
                        .context("invalid -disconnect value")?,
                );
            }
            "-l" => {
                i += 1;
                parsed.log_level = args.get(i).context("missing -l value")?.clone();
            }
            other => bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    log_filter(&parsed.log_level).context("invalid -l value")?;
    Ok(parsed)
}

/// Parse `5s`, `500ms`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if let Some(millis) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(
            millis.parse().context("not a number of milliseconds")?,
        ));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(
            secs.parse().context("not a number of seconds")?,
        ));
    }
    Ok(Duration::from_secs(
        s.parse().context("not a number of seconds")?,
    ))
}

/// Map a `-l` level onto a tracing directive. `fatal` has no tracing
/// equivalent and collapses to `error`; `disable` turns logging off.
pub fn log_filter(level: &str) -> Result<&'static str> {
    Ok(match level {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        "fatal" => "error",
        "disable" => "off",
        other => bail!("unknown log level '{other}'"),
    })
}

/// Flags override whatever the config file provided.
pub fn apply_overrides(config: &mut RelayConfig, args: &Args) {
    if let Some(ingress) = &args.ingress {
        config.ingress.addrs = ingress.clone();
    }
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(max_peers) = args.max_peers {
        config.server.max_peers = max_peers;
    }
    if let Some(mtu) = args.mtu {
        config.ingress.mtu = mtu;
    }
    if let Some(ping) = args.ping_interval {
        config.channel.ping_interval_ms = ping.as_millis() as u64;
    }
    if let Some(disconnect) = args.disconnect_timeout {
        config.channel.disconnect_timeout_ms = disconnect.as_millis() as u64;
    }
}
