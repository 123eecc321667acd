use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use framewire::{
    setup_tracing, AppError, AppResult, ConnectionSession, FramewireConfig, ListenerSession,
    SessionEvent, WriteOrigin, WriteTag,
};
use tokio::runtime::{self, Handle};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    /// raise log verbosity, ignored when RUST_LOG is set
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// echo every packet back to its sender
    Serve,
    /// send each message as one packet and wait for the echoes
    Send { messages: Vec<String> },
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    if env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        env::set_var("RUST_LOG", level);
    }
    let _log_guard = setup_tracing(&commandline.log_dir)?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = FramewireConfig::set_up_config(config_path)?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command {
        Command::Serve => rt.block_on(serve(&config, rt.handle())),
        Command::Send { messages } => rt.block_on(send(&config, messages, rt.handle())),
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn serve(config: &FramewireConfig, runtime: &Handle) -> AppResult<()> {
    let mut listener =
        ListenerSession::bind(&config.network, config.session.clone(), runtime).await?;
    info!("echo server listening on {}", listener.local_addr());

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    runtime.spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
            return;
        }
        info!("get shutdown signal");
        ctrl_c.cancel();
    });

    loop {
        tokio::select! {
            arrival = listener.next_connection() => match arrival {
                Some(Ok(session)) => {
                    runtime.spawn(echo(session, shutdown.child_token()));
                }
                Some(Err(err)) => warn!("accept failed: {}", err),
                None => break,
            },
            _ = shutdown.cancelled() => {
                listener.close();
                break;
            }
        }
    }
    Ok(())
}

async fn echo(mut session: ConnectionSession, shutdown: CancellationToken) {
    let id = session.id();
    debug!(connection_id = id, peer = ?session.peer_addr(), "echo session started");
    loop {
        let event = tokio::select! {
            event = session.next_event() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => {
                session.close();
                break;
            }
        };
        match event {
            SessionEvent::PacketArrived(payload) => {
                if let Err(err) = session.write_packet(payload, None) {
                    error!(connection_id = id, "echo write rejected: {}", err);
                    session.abortive_close();
                }
            }
            SessionEvent::RemoteClosed => {
                if session.shutdown().is_err() {
                    session.close();
                }
            }
            SessionEvent::ShutdownCompleted(_) => session.close(),
            SessionEvent::ReadFailed(err) => {
                warn!(connection_id = id, "read failed: {}", err);
                session.abortive_close();
            }
            SessionEvent::WriteCompleted {
                result: Err(err), ..
            } => {
                warn!(connection_id = id, "write failed: {}", err);
                session.abortive_close();
            }
            SessionEvent::WriteCompleted { .. } => {}
        }
    }
    debug!(connection_id = id, "echo session ended");
}

async fn send(config: &FramewireConfig, messages: Vec<String>, runtime: &Handle) -> AppResult<()> {
    let address = config.network.listen_address()?;
    let mut session = ConnectionSession::connect(address, &config.session, runtime).await?;
    info!("connected to {}", address);

    let expected = messages.len();
    for (index, message) in messages.into_iter().enumerate() {
        session.write_packet(message.into_bytes(), Some(WriteTag(index as u64)))?;
    }

    let mut echoed = 0;
    while echoed < expected {
        match session.next_event().await {
            Some(SessionEvent::PacketArrived(payload)) => {
                println!("{}", String::from_utf8_lossy(&payload));
                echoed += 1;
            }
            Some(SessionEvent::WriteCompleted {
                origin,
                result: Err(err),
            }) => {
                session.abortive_close();
                return Err(match origin {
                    WriteOrigin::Keepalive => AppError::IllegalStateError(format!(
                        "connection lost, keepalive failed: {}",
                        err
                    )),
                    WriteOrigin::User(_) => err,
                });
            }
            Some(SessionEvent::ReadFailed(err)) => {
                session.abortive_close();
                return Err(err);
            }
            Some(SessionEvent::RemoteClosed) | None => {
                session.close();
                return Err(AppError::IllegalStateError(format!(
                    "server closed after {} of {} echoes",
                    echoed, expected
                )));
            }
            Some(_) => {}
        }
    }

    session.shutdown()?;
    while let Some(event) = session.next_event().await {
        if let SessionEvent::ShutdownCompleted(result) = event {
            if let Err(err) = result {
                debug!("shutdown completed with error: {}", err);
            }
            break;
        }
    }
    session.close();
    Ok(())
}
