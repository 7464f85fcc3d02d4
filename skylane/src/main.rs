//! Peer-to-peer lockstep air traffic control server.
//!
//! Runs as the session server by default; pass `--target` to join an
//! existing one. The UI is a separate child process wired to our standard
//! streams: frames go out on stdout, player commands come in on stdin.

mod ui;

use std::error::Error;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{error, info};
use netcode::{connect_to_server, serve_peer, spawn_render_loop, Netcode};
use sim::{State, TICK_RATE};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address to connect to; leave unset to run as the server
    #[clap(long)]
    target: Option<String>,

    /// Address to listen on when running as the server
    #[clap(long, default_value = "0.0.0.0:0")]
    listen: String,

    /// Spawn this many local client processes pointed at this server
    #[clap(long, default_value_t = 0)]
    debug_start_clients: u32,

    /// Tick pacing; `slow` runs one tick per second for debugging
    #[clap(long, value_enum, default_value = "realtime")]
    debug_tickmode: TickMode,
}

#[derive(ValueEnum, Copy, Clone, Debug)]
enum TickMode {
    Realtime,
    Slow,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info");
    }

    let args = Args::parse();
    let tick_period = match args.debug_tickmode {
        TickMode::Realtime => Duration::from_secs(1) / TICK_RATE,
        TickMode::Slow => Duration::from_secs(1),
    };

    match args.target.clone() {
        None => run_server(args, tick_period).await,
        Some(target) => run_client(target, tick_period).await,
    }
}

async fn run_server(args: Args, tick_period: Duration) -> Result<(), Box<dyn Error>> {
    info!("starting as server");
    let netcode = Netcode::new_server(State::with_demo_map(), tick_period);
    netcode.spawn_tick_clock(Instant::now(), 0);
    spawn_render_loop(&netcode, ui::UiEncoder::default(), tokio::io::stdout());

    let listener = TcpListener::bind(&args.listen).await?;
    let addr = listener.local_addr()?;
    info!("listening on {}", addr);

    if args.debug_start_clients > 0 {
        spawn_debug_clients(addr, args.debug_start_clients)?;
    }

    let accept_netcode = netcode.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("new connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("setting nodelay for {}: {}", peer, e);
                    }
                    let (reader, writer) = stream.into_split();
                    tokio::spawn(serve_peer(accept_netcode.clone(), reader, writer));
                }
                Err(e) => error!("accepting connection: {}", e),
            }
        }
    });

    ui::read_ui_commands(netcode, tokio::io::stdin()).await?;
    Ok(())
}

async fn run_client(target: String, tick_period: Duration) -> Result<(), Box<dyn Error>> {
    info!("connecting to {}", target);
    let netcode = Netcode::new_client(tick_period);
    spawn_render_loop(&netcode, ui::UiEncoder::default(), tokio::io::stdout());

    let stream = TcpStream::connect(&target).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let clock = connect_to_server(&netcode, reader, writer).await?;
    netcode.spawn_tick_clock(clock.origin, clock.send_after);

    ui::read_ui_commands(netcode, tokio::io::stdin()).await?;
    Ok(())
}

/// Starts `count` copies of this binary as clients of the given listener.
/// Their stdin pipes are held open (and leaked) for the process lifetime so
/// the children never see end-of-file on their command stream.
fn spawn_debug_clients(addr: SocketAddr, count: u32) -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let target = format!("127.0.0.1:{}", addr.port());
    for _ in 0..count {
        let child = std::process::Command::new(&exe)
            .arg("--target")
            .arg(&target)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;
        info!("started debug client pid {}", child.id());
        std::mem::forget(child);
    }
    Ok(())
}
