use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ember::{connect_pool, EmberResult, Logger, ServerConfig, WebServer};
use ember_pg::PgConfig;

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Event-driven HTTP/1.1 static and auth server")]
#[command(version)]
struct Cli {
    /// Listen port
    #[arg(short = 'p', long = "port", default_value_t = 1316)]
    port: u16,

    /// Trigger-mode bitmask: bit 0 = edge-triggered connections, bit 1 = edge-triggered listener
    #[arg(short = 'm', long = "trig-mode", default_value_t = 3)]
    trig_mode: u8,

    /// Lingering close on shutdown (0|1)
    #[arg(short = 'o', long = "linger", default_value_t = 0)]
    linger: u8,

    /// Database connection pool size
    #[arg(short = 's', long = "sql-num", default_value_t = 12)]
    sql_num: usize,

    /// Worker thread count (0 = one per core)
    #[arg(short = 't', long = "threads", default_value_t = 6)]
    threads: usize,

    /// Enable logging (0|1)
    #[arg(short = 'l', long = "log", default_value_t = 1)]
    log: u8,

    /// Log level: 0 debug, 1 info, 2 warn, 3 error
    #[arg(short = 'e', long = "log-level", default_value_t = 1)]
    log_level: usize,

    /// Log queue capacity; 0 or less writes synchronously
    #[arg(short = 'q', long = "log-queue", default_value_t = 1024)]
    log_queue: i64,

    /// Database host
    #[arg(long = "db-host", default_value = "127.0.0.1")]
    db_host: String,

    /// Database port
    #[arg(long = "db-port", default_value_t = 5432)]
    db_port: u16,

    /// Database user
    #[arg(long = "db-user", default_value = "root")]
    db_user: String,

    /// Database password
    #[arg(long = "db-password", default_value = "centos")]
    db_password: String,

    /// Database name
    #[arg(long = "db-name", default_value = "ember")]
    db_name: String,
}

fn run(cli: Cli) -> EmberResult<()> {
    let logger = if cli.log != 0 {
        let logger = Logger::init(cli.log_level, &PathBuf::from("./log"), ".log", cli.log_queue)
            .map_err(|e| ember::EmberError::Init(format!("log directory: {}", e)))?;
        logger.install();
        Some(logger)
    } else {
        None
    };

    let db_config = PgConfig::new(
        &cli.db_host,
        cli.db_port,
        &cli.db_user,
        &cli.db_password,
        &cli.db_name,
    );
    let sql_pool = connect_pool(&db_config, cli.sql_num);

    let config = ServerConfig {
        port: cli.port,
        trig_mode: cli.trig_mode,
        timeout_ms: 60_000,
        open_linger: cli.linger != 0,
        thread_num: cli.threads,
        ..ServerConfig::default()
    };

    let mut server = WebServer::new(&config, sql_pool)?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || handle.shutdown())
        .map_err(|e| ember::EmberError::Init(format!("signal handler: {}", e)))?;

    server.start();

    if let Some(logger) = logger {
        logger.flush();
        logger.close();
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("ember: {}", e);
            ExitCode::FAILURE
        }
    }
}
