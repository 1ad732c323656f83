//! docgate: websocket gateway between browser editing sessions and a
//! pool of per-document worker processes.

mod admin;
mod adminmodel;
mod auth;
mod broker;
mod config;
mod dispatch;
mod error;
mod filesrv;
mod gateway;
mod limits;
mod logging;
mod net;
mod prisoner;
mod session;
mod trace;

use config::Config;
use dispatch::{PlainSocketFactory, SslSocketFactory};
use gateway::{Gateway, Limits};
use net::server::ServerSocket;
use prisoner::PrisonerSocketFactory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const EXIT_OK: i32 = 0;
/// BSD sysexits "internal software error": missing required option or a
/// spawn failure.
const EXIT_SOFTWARE: i32 = 70;

const DEFAULT_CONFIG_FILE: &str = "docgate.yaml";

#[derive(Debug, Default)]
struct CliOptions {
    help: bool,
    version: bool,
    port: Option<u16>,
    disable_ssl: bool,
    overrides: Vec<(String, String)>,
    config_file: Option<String>,
}

fn cli_opts() -> getopts::Options {
    let mut opts = getopts::Options::new();
    opts.optflag("h", "help", "Display help information on command line arguments.");
    opts.optflag("", "version", "Display version information.");
    opts.optopt(
        "",
        "port",
        &format!(
            "Port number to listen to (default: {}), must not be {}.",
            limits::DEFAULT_CLIENT_PORT,
            limits::DEFAULT_MASTER_PORT
        ),
        "port_number",
    );
    opts.optflag("", "disable-ssl", "Disable SSL security layer.");
    opts.optmulti(
        "o",
        "override",
        "Override any setting by providing key=value.",
        "key=value",
    );
    opts.optopt("", "config-file", "Override configuration file path.", "path");
    opts
}

fn parse_cli(args: &[String]) -> Result<CliOptions, String> {
    let opts = cli_opts();
    let matches = opts.parse(args).map_err(|e| format!("{e}"))?;

    let mut cli = CliOptions {
        help: matches.opt_present("help"),
        version: matches.opt_present("version"),
        disable_ssl: matches.opt_present("disable-ssl"),
        config_file: matches.opt_str("config-file"),
        ..CliOptions::default()
    };

    if let Some(port) = matches.opt_str("port") {
        cli.port = Some(port.parse().map_err(|_| format!("Invalid port [{port}]"))?);
    }

    for pair in matches.opt_strs("override") {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid override [{pair}], expected key=value"))?;
        cli.overrides.push((key.to_string(), value.to_string()));
    }

    Ok(cli)
}

fn build_config(cli: &CliOptions) -> Result<Config, String> {
    let config_file = cli.config_file.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);

    let mut conf = if std::path::Path::new(config_file).exists() {
        Config::from_yaml(config_file).map_err(|e| format!("{e}"))?
    } else {
        if cli.config_file.is_some() {
            return Err(format!("Configuration file [{config_file}] not found"));
        }
        Config::default()
    };

    if cli.disable_ssl {
        conf.set_key("ssl.enable", "false").map_err(|e| format!("{e}"))?;
    }

    for (key, value) in &cli.overrides {
        conf.set_key(key, value).map_err(|e| format!("{e}"))?;
    }

    if let Some(port) = cli.port {
        conf.client_port = port;
    }

    validate_config(&conf)?;
    Ok(conf)
}

fn validate_config(conf: &Config) -> Result<(), String> {
    if conf.sys_template_path.is_empty() {
        return Err("Missing sys_template_path setting".to_string());
    }
    if conf.lo_template_path.is_empty() {
        return Err("Missing lo_template_path setting".to_string());
    }
    if conf.child_root_path.is_empty() {
        return Err("Missing child_root_path setting".to_string());
    }
    if conf.client_port == conf.master_port {
        return Err("Client and master ports must differ".to_string());
    }
    if conf.num_prespawn_children < 1 {
        return Err("num_prespawn_children must be at least 1".to_string());
    }
    Ok(())
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let cli = match parse_cli(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("docgate: {e}");
            return EXIT_SOFTWARE;
        }
    };

    if cli.help {
        print!(
            "{}",
            cli_opts().usage("Document gateway websocket server.\n\nUsage: docgate [OPTIONS]")
        );
        return EXIT_OK;
    }

    let conf = match build_config(&cli) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("docgate: {e}");
            return EXIT_SOFTWARE;
        }
    };

    if let Err(e) = logging::Logger::new(
        &conf.logging_level,
        conf.logging_color,
        conf.log_file_path(),
    )
    .and_then(|logger| logger.init().map_err(|e| format!("{e}")))
    {
        eprintln!("docgate: cannot initialize logging: {e}");
        return EXIT_SOFTWARE;
    }

    if cli.version {
        log::info!(
            "docgate version details: {} - {}",
            env!("CARGO_PKG_VERSION"),
            limits::VERSION_HASH
        );
    }

    if unsafe { libc::geteuid() } == 0 {
        log::error!("Do not run as root. Please run as a normal user.");
        return EXIT_SOFTWARE;
    }

    if conf.ssl_enable {
        log::info!("SSL support: SSL is enabled.");
        if let Err(e) = net::tls::initialize(&conf.ssl_cert_file_path, &conf.ssl_key_file_path) {
            log::error!("Cannot initialize SSL: {e}");
            return EXIT_SOFTWARE;
        }
    } else {
        log::warn!("SSL support: SSL is disabled.");
    }

    log::info!(
        "Maximum concurrent open documents limit: {}",
        limits::MAX_DOCUMENTS
    );
    log::info!(
        "Maximum concurrent client connections limit: {}",
        limits::MAX_CONNECTIONS
    );

    // SIGTERM and SIGINT begin a graceful shutdown; SIGUSR1 dumps state.
    let signal_seen = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(e) = signal_hook::flag::register(sig, signal_seen.clone()) {
            log::error!("Cannot register signal handler: {e}");
            return EXIT_SOFTWARE;
        }
    }
    let dump_requested = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, dump_requested.clone()).ok();

    // Bind both listeners before wiring anything to their (possibly
    // walked) port numbers.
    let prisoner_server = match ServerSocket::bind("127.0.0.1", conf.master_port, "prisoner") {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to listen on prisoner master port: {e}");
            return EXIT_SOFTWARE;
        }
    };
    let client_server = match ServerSocket::bind("0.0.0.0", conf.client_port, "client") {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to listen on client port: {e}");
            return EXIT_SOFTWARE;
        }
    };

    let mut conf = conf;
    conf.master_port = prisoner_server.port();
    conf.client_port = client_server.port();
    conf.clone().apply_if_unset();

    let gateway = Gateway::new(conf, Limits::default());

    let accept_stop = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();

    // Worker callback plumbing first: accept loop, the forkit, then the
    // prisoner reactor whose wakeup hook supervises that forkit.
    threads.push(prisoner_server.start_thread(
        Arc::new(PrisonerSocketFactory::new(gateway.clone())),
        gateway.prisoner_poll.clone(),
        accept_stop.clone(),
    ));

    match gateway.forkit.launch() {
        Ok(pid) => {
            gateway.admin.set_forkit_pid(pid);
            gateway.pool.note_spawn_request(1);
        }
        Err(e) => {
            log::error!("Failed to spawn forkit: {e}");
            return EXIT_SOFTWARE;
        }
    }

    {
        let hook_gateway = gateway.clone();
        threads.push(
            gateway
                .prisoner_poll
                .start_thread(move || hook_gateway.prisoner_wakeup()),
        );
    }

    // Make sure we have at least one worker before serving clients.
    let spawn_deadline =
        Instant::now() + Duration::from_millis(procpool::CHILD_TIMEOUT_MS * 3);
    while gateway.pool.available_count() == 0 {
        if Instant::now() >= spawn_deadline {
            log::error!("Failed to fork child processes.");
            gateway.forkit.terminate();
            return EXIT_SOFTWARE;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    log::info!("Have {} new children.", gateway.pool.available_count());

    // Client-facing plumbing.
    threads.push(gateway.web_poll.start_thread(|| {}));
    threads.push(gateway.admin.start());

    let client_factory: Arc<dyn net::server::SocketFactory> = if gateway.config.ssl_enable {
        match net::tls::server_config() {
            Some(tls) => Arc::new(SslSocketFactory::new(gateway.clone(), tls)),
            None => {
                log::error!("SSL enabled but not initialized");
                return EXIT_SOFTWARE;
            }
        }
    } else {
        Arc::new(PlainSocketFactory::new(gateway.clone()))
    };
    threads.push(client_server.start_thread(
        client_factory,
        gateway.web_poll.clone(),
        accept_stop.clone(),
    ));

    let scheme = if gateway.config.is_ssl_visible() { "https" } else { "http" };
    log::info!(
        "Browser URI: {scheme}://localhost:{}/loleaflet/{}/{}",
        gateway.config.client_port,
        limits::VERSION_HASH,
        gateway.config.loleaflet_html
    );
    if !gateway.config.admin_console_username.is_empty() {
        log::info!(
            "Admin console: {scheme}://localhost:{}/loleaflet/dist/admin/admin.html",
            gateway.config.client_port
        );
    }

    // The main loop does next to nothing: watch for signals, reap idle
    // and dead brokers.
    while !gateway::is_termination_requested() {
        if signal_seen.load(Ordering::SeqCst)
            && !gateway::SHUTDOWN_REQUEST_FLAG.swap(true, Ordering::SeqCst)
        {
            log::info!("Shutdown requested. Initiating WSD shutdown.");
            gateway.alert_all_users("close: shuttingdown");
            gateway::SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            break;
        }

        if dump_requested.swap(false, Ordering::SeqCst) {
            gateway.dump_state();
        }

        std::thread::sleep(Duration::from_millis(1000));
        gateway.cleanup_doc_brokers();
    }

    // Bounded grace for workers to finish saving, then a hard stop.
    if gateway::SHUTDOWN_FLAG.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(2));
    }
    gateway::request_termination();

    accept_stop.store(true, Ordering::SeqCst);
    gateway.shutdown();

    for thread in threads {
        thread.join().ok();
    }

    log::info!("Process [docgate] finished.");
    EXIT_OK
}
