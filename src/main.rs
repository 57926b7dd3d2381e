//! Multiplexed Chat Relay - Entry Point
//!
//! `chat_relay <server|client> <host> <port>`

use std::env;
use std::io;
use std::net::SocketAddr;
use std::process::ExitCode;

use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::terminal::{self, RawInput};
use chat_relay::{resolve_addr, AppError, Client, Server, ServerConfig, ShutdownHandle};

/// Program name used when argv[0] is missing
const DEFAULT_PROGRAM: &str = "chat_relay";

fn main() -> ExitCode {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ AppError::Usage(_)) => {
            eprintln!("{}", e);
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn run(args: &[String]) -> Result<(), AppError> {
    let program = args
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_PROGRAM.to_string());

    let [_, mode, host, port] = args else {
        return Err(AppError::Usage(program));
    };
    if mode != "server" && mode != "client" {
        return Err(AppError::Usage(program));
    }
    let port: u16 = port.parse().map_err(|_| AppError::Usage(program))?;
    let addr = resolve_addr(host, port)?;

    if mode == "server" {
        run_server(addr)
    } else {
        run_client(addr)
    }
}

fn run_server(addr: SocketAddr) -> Result<(), AppError> {
    let config = ServerConfig::from_env()?;
    let mut server = Server::bind(addr, config)?;
    install_interrupt_handler(server.shutdown_handle());
    server.run()
}

fn run_client(addr: SocketAddr) -> Result<(), AppError> {
    let mut input = RawInput::stdin()?;
    let mut stdout = io::stdout();
    let username = terminal::ask(&mut stdout, "Enter your username: ", &mut input)?;
    let password = terminal::ask(&mut stdout, "Enter your password: ", &mut input)?;

    let mut client = Client::connect(addr, &username, &password, input, stdout)?;
    install_interrupt_handler(client.shutdown_handle());
    client.run()
}

/// Route Ctrl-C to the event loop's shutdown handle
fn install_interrupt_handler(handle: ShutdownHandle) {
    ctrlc::set_handler(move || {
        if let Err(e) = handle.trigger() {
            error!("Failed to wake event loop: {}", e);
        }
    })
    .unwrap_or_else(|e| {
        warn!("Failed to set signal handler: {}", e);
    });
}
