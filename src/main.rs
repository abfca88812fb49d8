use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    thread,
};

use arc_swap::ArcSwap;
use nacdhcp::{
    config::Config,
    logging, mgmt,
    registry::{DeviceStore, MemoryRegistry},
    v4,
};
use tracing::{error, info, warn, Level};

const HELP: &str = "\
nacdhcp - DHCPv4 server for network access control

USAGE:
  nacdhcp [OPTIONS]

OPTIONS:
  --config <path>          configuration file [default: dhcp.conf]
  --devices <path>         JSON device registry
  --bind <addr:port>       UDP listen address [default: 0.0.0.0:67]
  --local-address <ipv4>   address of the serving interface for unrelayed clients
  --workers <n>            worker threads [default: 4]
  --mgmt <addr:port>       management socket
  --log-level <level>      trace, debug, info, warn or error [default: info]
  --log-json               log as JSON lines
  -h, --help               print this help
";

struct Args {
    config: PathBuf,
    devices: Option<PathBuf>,
    bind: SocketAddrV4,
    local_address: Option<Ipv4Addr>,
    workers: usize,
    mgmt: Option<SocketAddr>,
    log_level: Level,
    log_json: bool,
}

fn parse_args() -> Result<Args, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let args = Args {
        log_json: pargs.contains("--log-json"),
        config: pargs
            .opt_value_from_str("--config")?
            .unwrap_or_else(|| PathBuf::from("dhcp.conf")),
        devices: pargs.opt_value_from_str("--devices")?,
        bind: pargs
            .opt_value_from_str("--bind")?
            .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v4::worker::SERVER_PORT)),
        local_address: pargs.opt_value_from_str("--local-address")?,
        workers: pargs.opt_value_from_str("--workers")?.unwrap_or(4),
        mgmt: pargs.opt_value_from_str("--mgmt")?,
        log_level: pargs.opt_value_from_str("--log-level")?.unwrap_or(Level::INFO),
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {remaining:?}");
    }
    Ok(args)
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {e}\n\n{HELP}");
            return ExitCode::FAILURE;
        }
    };

    if args.log_json {
        logging::init_json(args.log_level);
    } else {
        logging::init_stdout(args.log_level);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> nacdhcp::Result<()> {
    let config = Config::load(&args.config)?;
    info!(server_id = %config.global.server_id, "starting");
    let config = Arc::new(ArcSwap::from_pointee(config));

    let registry = match &args.devices {
        Some(path) => MemoryRegistry::load_file(path)?,
        None => {
            warn!("no device registry given, every client is unregistered");
            MemoryRegistry::new()
        }
    };
    let store: Arc<dyn DeviceStore> = Arc::new(registry);

    let socket = UdpSocket::bind(args.bind)?;
    let local_addr = args
        .local_address
        .or_else(|| Some(*args.bind.ip()).filter(|ip| !ip.is_unspecified()));
    info!(bind = %args.bind, ?local_addr, workers = args.workers, "listening for DHCPv4");
    let workers = v4::spawn_workers(socket, args.workers, Arc::clone(&config), store, local_addr)?;

    if let Some(addr) = args.mgmt {
        let listener = TcpListener::bind(addr)?;
        let mgmt_config = Arc::clone(&config);
        let config_path = args.config.clone();
        thread::Builder::new()
            .name("mgmt".to_string())
            .spawn(move || mgmt::listener(listener, mgmt_config, config_path))?;
        info!(%addr, "management socket listening");
    }

    #[cfg(unix)]
    let _sighup = nacdhcp::signal::spawn_sighup_handler(Arc::clone(&config), args.config.clone());

    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}
