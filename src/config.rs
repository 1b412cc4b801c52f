//! Command-line options and validated client configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::filter::Directive;

use crate::transport::{CipherMode, HashMode, OtpConfig, SpParams, TransportMode};
use crate::types::{
    DEFAULT_FRAGMENTATION_LATENCY_MS, DEFAULT_IGMP_GROUP_MEMBERSHIP_INTERVAL_MS,
    DEFAULT_IGMP_LAST_MEMBER_QUERY_TIME_MS, DEFAULT_MAX_GROUPS, DEFAULT_MAX_MACS,
    DEFAULT_MAX_PEERS, DEFAULT_SEND_BUFFER_RELAY_SIZE, DEFAULT_SEND_BUFFER_SIZE,
    DEFAULT_TCP_SOCKET_SNDBUF,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },
    #[error("{0} is only valid in UDP transport mode")]
    UdpOnly(&'static str),
    #[error("{0} is only valid in TCP transport mode")]
    TcpOnly(&'static str),
    #[error("--peer-ssl requires --ssl")]
    PeerSslWithoutSsl,
    #[error("--ssl requires --identity")]
    SslWithoutIdentity,
    #[error("OTP warning threshold must satisfy 0 < warn <= num")]
    OtpBounds,
    #[error("invalid --log filter: {0}")]
    InvalidLogFilter(String),
}

/// Filter applied until the command line supplies one.
pub const DEFAULT_LOG_FILTER: &str = "tapmesh=info";

fn invalid(what: &'static str, detail: impl ToString) -> ConfigError {
    ConfigError::Invalid { what, detail: detail.to_string() }
}

/// External address advertised for one bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtAddr {
    pub spec: ExtAddrSpec,
    pub scope: String,
}

/// Either a literal address or "whatever IP the server sees us as", with a
/// fixed port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtAddrSpec {
    Fixed(SocketAddr),
    ServerReported { port: u16 },
}

/// One local endpoint to bind peer links on, with the addresses to
/// advertise for it. UDP walks `num_ports` successive ports from the base
/// port; advertised ports are adjusted by the same offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddr {
    pub addr: SocketAddr,
    pub num_ports: u16,
    pub ext_addrs: Vec<ExtAddr>,
}

impl FromStr for BindAddr {
    type Err = ConfigError;

    /// `ADDR[,ports=N][,ext=EXT@SCOPE]...` — `EXT` is a socket address or
    /// `server:PORT` for the server-reported IP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let addr_part = parts.next().ok_or_else(|| invalid("bind-addr", "empty"))?;
        let addr: SocketAddr = addr_part.parse().map_err(|e| invalid("bind-addr", e))?;
        let mut bind = BindAddr { addr, num_ports: 1, ext_addrs: Vec::new() };
        for part in parts {
            if let Some(value) = part.strip_prefix("ports=") {
                bind.num_ports = value.parse().map_err(|e| invalid("bind-addr ports", e))?;
            } else if let Some(value) = part.strip_prefix("ext=") {
                let (ext, scope) = value
                    .rsplit_once('@')
                    .ok_or_else(|| invalid("ext-addr", "missing @scope"))?;
                if scope.is_empty() {
                    return Err(invalid("ext-addr", "empty scope"));
                }
                let spec = if let Some(port) = ext.strip_prefix("server:") {
                    ExtAddrSpec::ServerReported {
                        port: port.parse().map_err(|e| invalid("ext-addr port", e))?,
                    }
                } else {
                    ExtAddrSpec::Fixed(ext.parse().map_err(|e| invalid("ext-addr", e))?)
                };
                bind.ext_addrs.push(ExtAddr { spec, scope: scope.to_owned() });
            } else {
                return Err(invalid("bind-addr", format!("unknown element '{part}'")));
            }
        }
        Ok(bind)
    }
}

#[derive(Parser, Debug)]
#[command(name = "tapmesh", version, about = "Peer-to-peer layer-2 VPN client")]
pub struct Args {
    /// Rendezvous server endpoint
    #[arg(long)]
    pub server_addr: SocketAddr,

    /// Hostname expected on the server's TLS certificate
    #[arg(long)]
    pub server_name: Option<String>,

    /// Tap device name
    #[arg(long, default_value = "tap0")]
    pub tap: String,

    /// Peer link transport: udp or tcp
    #[arg(long, default_value = "udp")]
    pub transport: String,

    /// UDP cipher: none, blowfish or aes
    #[arg(long)]
    pub encryption: Option<String>,

    /// UDP integrity: none, md5 or sha1
    #[arg(long)]
    pub hash: Option<String>,

    /// UDP one-time pads: MODE:NUM:WARN (e.g. aes:1024:64)
    #[arg(long)]
    pub otp: Option<String>,

    /// How long to hold incomplete fragmented frames (ms, UDP)
    #[arg(long)]
    pub fragmentation_latency: Option<u64>,

    /// Enable TLS on the server connection
    #[arg(long)]
    pub ssl: bool,

    /// PKCS#12 client identity for TLS
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Password for the identity file
    #[arg(long, default_value = "")]
    pub identity_password: String,

    /// Enable peer-to-peer TLS on stream links (TCP, requires --ssl)
    #[arg(long)]
    pub peer_ssl: bool,

    /// SNDBUF for peer TCP sockets
    #[arg(long)]
    pub peer_tcp_socket_sndbuf: Option<usize>,

    /// Local endpoint to bind peer links on:
    /// ADDR[,ports=N][,ext=EXT@SCOPE]... (repeatable)
    #[arg(long = "bind-addr")]
    pub bind_addrs: Vec<BindAddr>,

    /// Scope name we may connect out to (repeatable)
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    /// Frames buffered per outgoing flow
    #[arg(long, default_value_t = DEFAULT_SEND_BUFFER_SIZE)]
    pub send_buffer_size: usize,

    /// Frames buffered per flow riding a relay
    #[arg(long, default_value_t = DEFAULT_SEND_BUFFER_RELAY_SIZE)]
    pub send_buffer_relay_size: usize,

    /// Source MACs remembered per peer
    #[arg(long, default_value_t = DEFAULT_MAX_MACS)]
    pub max_macs: usize,

    /// Multicast groups remembered per peer
    #[arg(long, default_value_t = DEFAULT_MAX_GROUPS)]
    pub max_groups: usize,

    /// Maximum peers accepted from the server
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS)]
    pub max_peers: usize,

    /// IGMP group membership interval (ms)
    #[arg(long, default_value_t = DEFAULT_IGMP_GROUP_MEMBERSHIP_INTERVAL_MS)]
    pub igmp_group_membership_interval: u64,

    /// IGMP last member query time (ms)
    #[arg(long, default_value_t = DEFAULT_IGMP_LAST_MEMBER_QUERY_TIME_MS)]
    pub igmp_last_member_query_time: u64,

    /// Talk to peers that decline TLS although we have TLS configured
    #[arg(long)]
    pub allow_peer_talk_without_ssl: bool,

    /// Tracing filter directive
    #[arg(long, default_value = DEFAULT_LOG_FILTER)]
    pub log: String,
}

/// Validated configuration the node runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: SocketAddr,
    pub server_name: Option<String>,
    pub tap: String,
    pub transport: TransportMode,
    pub sp_params: SpParams,
    pub fragmentation_latency: Duration,
    pub ssl: bool,
    pub identity: Option<PathBuf>,
    pub identity_password: String,
    pub peer_ssl: bool,
    pub peer_tcp_socket_sndbuf: usize,
    pub bind_addrs: Vec<BindAddr>,
    pub scopes: Vec<String>,
    pub send_buffer_size: usize,
    pub send_buffer_relay_size: usize,
    pub max_macs: usize,
    pub max_groups: usize,
    pub max_peers: usize,
    pub igmp_group_membership_interval: Duration,
    pub igmp_last_member_query_time: Duration,
    pub allow_peer_talk_without_ssl: bool,
    pub log: Directive,
}

fn parse_cipher(value: &str) -> Result<CipherMode, ConfigError> {
    match value {
        "none" => Ok(CipherMode::None),
        "blowfish" => Ok(CipherMode::Blowfish),
        "aes" => Ok(CipherMode::Aes),
        other => Err(invalid("cipher", other)),
    }
}

fn parse_hash(value: &str) -> Result<HashMode, ConfigError> {
    match value {
        "none" => Ok(HashMode::None),
        "md5" => Ok(HashMode::Md5),
        "sha1" => Ok(HashMode::Sha1),
        other => Err(invalid("hash", other)),
    }
}

fn parse_otp(value: &str) -> Result<OtpConfig, ConfigError> {
    let mut parts = value.split(':');
    let mode = match parts.next() {
        Some("blowfish") => CipherMode::Blowfish,
        Some("aes") => CipherMode::Aes,
        other => return Err(invalid("otp mode", other.unwrap_or(""))),
    };
    let num: u32 = parts
        .next()
        .ok_or(ConfigError::OtpBounds)?
        .parse()
        .map_err(|e| invalid("otp num", e))?;
    let num_warn: u32 = parts
        .next()
        .ok_or(ConfigError::OtpBounds)?
        .parse()
        .map_err(|e| invalid("otp warn", e))?;
    if parts.next().is_some() {
        return Err(invalid("otp", "trailing elements"));
    }
    if num_warn == 0 || num_warn > num {
        return Err(ConfigError::OtpBounds);
    }
    Ok(OtpConfig { mode, num, num_warn })
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let transport = match args.transport.as_str() {
            "udp" => TransportMode::Udp,
            "tcp" => TransportMode::Tcp,
            other => return Err(invalid("transport", other)),
        };

        if transport == TransportMode::Tcp {
            if args.encryption.is_some() {
                return Err(ConfigError::UdpOnly("--encryption"));
            }
            if args.hash.is_some() {
                return Err(ConfigError::UdpOnly("--hash"));
            }
            if args.otp.is_some() {
                return Err(ConfigError::UdpOnly("--otp"));
            }
            if args.fragmentation_latency.is_some() {
                return Err(ConfigError::UdpOnly("--fragmentation-latency"));
            }
        } else {
            if args.peer_ssl {
                return Err(ConfigError::TcpOnly("--peer-ssl"));
            }
            if args.peer_tcp_socket_sndbuf.is_some() {
                return Err(ConfigError::TcpOnly("--peer-tcp-socket-sndbuf"));
            }
        }

        if args.peer_ssl && !args.ssl {
            return Err(ConfigError::PeerSslWithoutSsl);
        }
        if args.ssl && args.identity.is_none() {
            return Err(ConfigError::SslWithoutIdentity);
        }

        let sp_params = SpParams {
            encryption: args.encryption.as_deref().map(parse_cipher).transpose()?.unwrap_or(CipherMode::None),
            hash: args.hash.as_deref().map(parse_hash).transpose()?.unwrap_or(HashMode::None),
            otp: args.otp.as_deref().map(parse_otp).transpose()?,
        };

        for (what, value) in [
            ("--max-macs", args.max_macs),
            ("--max-groups", args.max_groups),
            ("--max-peers", args.max_peers),
            ("--send-buffer-size", args.send_buffer_size),
            ("--send-buffer-relay-size", args.send_buffer_relay_size),
        ] {
            if value == 0 {
                return Err(invalid("option", format!("{what} must be positive")));
            }
        }

        let log = args
            .log
            .parse::<Directive>()
            .map_err(|e| ConfigError::InvalidLogFilter(e.to_string()))?;

        Ok(Config {
            server_addr: args.server_addr,
            server_name: args.server_name,
            tap: args.tap,
            transport,
            sp_params,
            fragmentation_latency: Duration::from_millis(
                args.fragmentation_latency.unwrap_or(DEFAULT_FRAGMENTATION_LATENCY_MS),
            ),
            ssl: args.ssl,
            identity: args.identity,
            identity_password: args.identity_password,
            peer_ssl: args.peer_ssl,
            peer_tcp_socket_sndbuf: args.peer_tcp_socket_sndbuf.unwrap_or(DEFAULT_TCP_SOCKET_SNDBUF),
            bind_addrs: args.bind_addrs,
            scopes: args.scopes,
            send_buffer_size: args.send_buffer_size,
            send_buffer_relay_size: args.send_buffer_relay_size,
            max_macs: args.max_macs,
            max_groups: args.max_groups,
            max_peers: args.max_peers,
            igmp_group_membership_interval: Duration::from_millis(
                args.igmp_group_membership_interval,
            ),
            igmp_last_member_query_time: Duration::from_millis(args.igmp_last_member_query_time),
            allow_peer_talk_without_ssl: args.allow_peer_talk_without_ssl,
            log,
        })
    }

    /// Filter directive to use before a validated configuration exists.
    pub fn default_log_directive() -> Directive {
        // A fixed literal, so the parse cannot fail.
        DEFAULT_LOG_FILTER.parse().expect("default directive parses")
    }

    /// Minimal configuration used by tests and the simulator.
    pub fn for_test(transport: TransportMode) -> Self {
        Config {
            server_addr: "127.0.0.1:7000".parse().unwrap(),
            server_name: None,
            tap: "tap0".into(),
            transport,
            sp_params: SpParams::plaintext(),
            fragmentation_latency: Duration::from_millis(DEFAULT_FRAGMENTATION_LATENCY_MS),
            ssl: false,
            identity: None,
            identity_password: String::new(),
            peer_ssl: false,
            peer_tcp_socket_sndbuf: DEFAULT_TCP_SOCKET_SNDBUF,
            bind_addrs: Vec::new(),
            scopes: vec!["internet".into()],
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            send_buffer_relay_size: DEFAULT_SEND_BUFFER_RELAY_SIZE,
            max_macs: DEFAULT_MAX_MACS,
            max_groups: DEFAULT_MAX_GROUPS,
            max_peers: DEFAULT_MAX_PEERS,
            igmp_group_membership_interval: Duration::from_millis(
                DEFAULT_IGMP_GROUP_MEMBERSHIP_INTERVAL_MS,
            ),
            igmp_last_member_query_time: Duration::from_millis(
                DEFAULT_IGMP_LAST_MEMBER_QUERY_TIME_MS,
            ),
            allow_peer_talk_without_ssl: false,
            log: Config::default_log_directive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(extra: &[&str]) -> Args {
        let mut argv = vec!["tapmesh", "--server-addr", "192.0.2.1:7100"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_bind_addr_spec_parsing() {
        let bind: BindAddr =
            "0.0.0.0:8000,ports=8,ext=203.0.113.5:8000@internet,ext=server:8000@lan"
                .parse()
                .unwrap();
        assert_eq!(bind.addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(bind.num_ports, 8);
        assert_eq!(bind.ext_addrs.len(), 2);
        assert_eq!(
            bind.ext_addrs[0],
            ExtAddr {
                spec: ExtAddrSpec::Fixed("203.0.113.5:8000".parse().unwrap()),
                scope: "internet".into(),
            }
        );
        assert_eq!(
            bind.ext_addrs[1],
            ExtAddr { spec: ExtAddrSpec::ServerReported { port: 8000 }, scope: "lan".into() }
        );

        assert!("nonsense".parse::<BindAddr>().is_err());
        assert!("0.0.0.0:8000,bogus=1".parse::<BindAddr>().is_err());
        assert!("0.0.0.0:8000,ext=1.2.3.4:5".parse::<BindAddr>().is_err());
    }

    #[test]
    fn test_udp_only_options_rejected_under_tcp() {
        let args = base_args(&["--transport", "tcp", "--encryption", "aes"]);
        assert!(matches!(Config::from_args(args), Err(ConfigError::UdpOnly(_))));
        let args = base_args(&["--transport", "udp", "--peer-tcp-socket-sndbuf", "1"]);
        assert!(matches!(Config::from_args(args), Err(ConfigError::TcpOnly(_))));
    }

    #[test]
    fn test_peer_ssl_requires_ssl() {
        let args = base_args(&["--transport", "tcp", "--peer-ssl"]);
        assert!(matches!(Config::from_args(args), Err(ConfigError::PeerSslWithoutSsl)));
    }

    #[test]
    fn test_ssl_requires_identity() {
        let args = base_args(&["--ssl"]);
        assert!(matches!(Config::from_args(args), Err(ConfigError::SslWithoutIdentity)));
    }

    #[test]
    fn test_otp_parsing_and_bounds() {
        let args = base_args(&["--encryption", "aes", "--otp", "aes:1024:64"]);
        let config = Config::from_args(args).unwrap();
        assert_eq!(
            config.sp_params.otp,
            Some(OtpConfig { mode: CipherMode::Aes, num: 1024, num_warn: 64 })
        );

        let args = base_args(&["--otp", "aes:64:65"]);
        assert!(matches!(Config::from_args(args), Err(ConfigError::OtpBounds)));
        let args = base_args(&["--otp", "des:64:1"]);
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn test_invalid_log_filter_rejected() {
        let args = base_args(&["--log", "not a directive!!"]);
        assert!(matches!(Config::from_args(args), Err(ConfigError::InvalidLogFilter(_))));

        let args = base_args(&["--log", "tapmesh=debug"]);
        assert!(Config::from_args(args).is_ok());
    }
}
