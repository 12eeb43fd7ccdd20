// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use clap::Parser;
use eyre::WrapErr;
use rand::Rng;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::fmt::format::FmtSpan;

mod db;
mod game;
mod network;
mod packman;
mod room;
mod server;
mod shell;
mod user;

use crate::server::Server;

#[derive(Parser, Debug)]
#[command(
    name = "croupier-daemon",
    about = "Network and session core for a multiplayer card-game server"
)]
struct Args {
    #[arg(short = 'v', long = "version", help = "Display version information")]
    version: bool,

    #[arg(
        short = 'p',
        long,
        value_name = "port",
        help = "Port number to listen on",
        default_value = "9527"
    )]
    port: i64,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    debug: bool,
}

/// Host for the croupier core.
///   * Brings up the stores and the user/room managers
///   * Spawns the TCP/UDP listeners and the heartbeat
///   * Runs the main executor until a signal or `quit`
fn main() -> Result<(), eyre::Report> {
    color_eyre::install()?;

    let args = Args::parse();

    if args.version {
        println!(
            "croupier-daemon v{}\n\
             License GPLv3: GNU GPL version 3 <https://gnu.org/licenses/gpl.html>.\n\
             This is free software: you are free to change and redistribute it.\n\
             There is NO WARRANTY, to the extent permitted by law.",
            env!("CARGO_PKG_VERSION")
        );
        return Ok(());
    }

    let main_subscriber = tracing_subscriber::fmt()
        .compact()
        .with_ansi(true)
        .with_file(true)
        .with_target(false)
        .with_line_number(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::NONE)
        .with_max_level(if args.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(main_subscriber)
        .wrap_err("Unable to configure logging")?;

    let port = if args.port < 1024 || args.port > 65535 {
        let fallback = rand::thread_rng().gen_range(1024..=65535);
        warn!("port {} out of range, falling back to {fallback}", args.port);
        fallback
    } else {
        args.port as u16
    };

    let server = Server::new()?;

    // one thread hosts every session: this runtime is the main executor
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("cannot build runtime")?;

    runtime.block_on(async {
        server.attach_runtime();
        network::listener::serve(server.clone(), port).await?;
        tokio::spawn(server.clone().heartbeat());
        shell::start(server.clone());

        let mut interrupt =
            signal(SignalKind::interrupt()).wrap_err("cannot register SIGINT handler")?;
        let mut terminate =
            signal(SignalKind::terminate()).wrap_err("cannot register SIGTERM handler")?;
        let signal_server = server.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            info!("signal received, stopping...");
            signal_server.stop();
        });

        server.run().await;
        Ok::<(), eyre::Report>(())
    })?;

    server.shutdown();
    info!("Done.");
    Ok(())
}
