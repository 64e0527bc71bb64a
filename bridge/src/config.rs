use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use mumble::MumbleConfig;

use crate::signaling::GatewayConfig;

pub struct Options {
    pub mumble: MumbleConfig,
    pub gateway: GatewayConfig,
    pub listen: SocketAddr,
    pub ice_servers: Vec<String>,
    pub log_level: LevelFilter,
}

fn app() -> Command<'static> {
    command!()
        .arg(
            Arg::new("host")
                .long("host")
                .env("MUMBLE_HOST")
                .value_name("HOST")
                .required(true)
                .help("Voice server to connect to"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .env("MUMBLE_PORT")
                .value_name("PORT")
                .default_value("64738")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("username")
                .long("username")
                .env("MUMBLE_USERNAME")
                .value_name("NAME")
                .default_value("dispatch-bridge"),
        )
        .arg(
            Arg::new("password")
                .long("password")
                .env("MUMBLE_PASSWORD")
                .value_name("PASSWORD")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("cert")
                .long("cert")
                .env("MUMBLE_CERT")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("PEM file with client certificate and PKCS#8 key"),
        )
        .arg(
            Arg::new("accept-invalid-certs")
                .long("accept-invalid-certs")
                .action(ArgAction::SetTrue)
                .help("Don't verify the server's certificate"),
        )
        .arg(
            Arg::new("disable-udp")
                .long("disable-udp")
                .env("MUMBLE_DISABLE_UDP")
                .action(ArgAction::SetTrue)
                .help("Tunnel voice over the TCP control connection"),
        )
        .arg(
            Arg::new("ping-interval")
                .long("ping-interval")
                .value_name("SECONDS")
                .default_value("5")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("max-missed-pings")
                .long("max-missed-pings")
                .value_name("COUNT")
                .default_value("3")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("reconnect-attempts")
                .long("reconnect-attempts")
                .value_name("COUNT")
                .default_value("10")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("reconnect-max-delay")
                .long("reconnect-max-delay")
                .value_name("SECONDS")
                .default_value("30")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .env("BRIDGE_LISTEN")
                .value_name("ADDR")
                .default_value("0.0.0.0:8090")
                .value_parser(value_parser!(SocketAddr))
                .help("Address of the dispatcher signaling endpoint"),
        )
        .arg(
            Arg::new("ice-server")
                .long("ice-server")
                .value_name("URL")
                .action(ArgAction::Append)
                .default_value("stun:stun.l.google.com:19302"),
        )
        .arg(
            Arg::new("queue-frames")
                .long("queue-frames")
                .value_name("FRAMES")
                .default_value("50")
                .value_parser(value_parser!(u64).range(1..))
                .help("Playback queue length per dispatcher"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"]),
        )
}

pub fn parse() -> Options {
    from_matches(&app().get_matches())
}

pub fn try_parse_from<I, T>(args: I) -> Result<Options, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Ok(from_matches(&app().try_get_matches_from(args)?))
}

fn from_matches(m: &ArgMatches) -> Options {
    let string = |id: &str| m.get_one::<String>(id).cloned();
    let secs = |id: &str| Duration::from_secs(m.get_one::<u64>(id).copied().unwrap_or(1));
    let count = |id: &str| m.get_one::<u32>(id).copied().unwrap_or(0);
    let flag = |id: &str| m.get_one::<bool>(id).copied().unwrap_or(false);

    let mut mumble = MumbleConfig::new(
        string("host").unwrap_or_default(),
        string("username").unwrap_or_default(),
    );
    mumble.port = m.get_one::<u16>("port").copied().unwrap_or(mumble.port);
    mumble.password = string("password");
    mumble.certfile = m.get_one::<PathBuf>("cert").cloned();
    mumble.accept_invalid_certs = flag("accept-invalid-certs");
    mumble.tcp_only = flag("disable-udp");
    mumble.ping_interval = secs("ping-interval");
    mumble.max_missed_pings = count("max-missed-pings");
    mumble.reconnect_attempts = count("reconnect-attempts");
    mumble.reconnect_max_delay = secs("reconnect-max-delay");

    let gateway = GatewayConfig {
        queue_frames: m.get_one::<u64>("queue-frames").copied().unwrap_or(50) as usize,
    };

    let listen = m
        .get_one::<SocketAddr>("listen")
        .copied()
        .unwrap_or_else(|| ([0, 0, 0, 0], 8090).into());

    let ice_servers = m
        .get_many::<String>("ice-server")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();

    let log_level = string("log-level")
        .and_then(|l| l.parse().ok())
        .unwrap_or(LevelFilter::Info);

    Options {
        mumble,
        gateway,
        listen,
        ice_servers,
        log_level,
    }
}
