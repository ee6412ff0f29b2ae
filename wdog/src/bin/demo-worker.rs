//! A minimal server that runs under the watchdog.

use clap::Parser;
use std::{
    fs,
    net::TcpListener,
    os::unix::io::{FromRawFd, IntoRawFd},
    path::PathBuf,
};
use tokio::runtime::Builder;
use wdog::{
    client::{supervised, Client},
    message::{Family, Kind, ListenSocketKey},
    Error,
};
use wdog_log::{error, info, warn};

#[derive(Parser)]
#[command(name = "wdog-demo-worker")]
#[command(about = "Demo server for the wdog watchdog")]
struct Cli {
    /// Number of processes that report reconfiguration completions
    #[arg(long, default_value_t = 1)]
    workers: u32,
    /// Write the worker's PID to this file after initialization
    #[arg(long)]
    pid_out: Option<PathBuf>,
    /// Exit with this code right after initialization
    #[arg(long)]
    crash_after_init: Option<i32>,
    /// Listen socket to request, as ADDR:PORT
    #[arg(long)]
    listen: Option<String>,
}

fn listen_key(listen: &str) -> Result<ListenSocketKey, Error> {
    let (addr, port) = listen
        .rsplit_once(':')
        .and_then(|(addr, port)| Some((addr, port.parse::<u16>().ok()?)))
        .ok_or_else(|| Error::Setup(format!("invalid listen address {}", listen).into()))?;
    let family = if addr.contains(':') {
        Family::Inet6
    } else {
        Family::Inet
    };
    Ok(ListenSocketKey::new("demo", Some(addr), port, family))
}

async fn serve(cli: Cli) -> Result<i32, Error> {
    let mut client = Client::from_env().await?;

    let _listener = match &cli.listen {
        Some(listen) => {
            let fd = client.get_listen_socket(&listen_key(listen)?).await?;
            let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
            let local_addr = listener.local_addr()?;
            info!("listening on {}", local_addr);
            Some(listener)
        }
        None => None,
    };

    client.end_init(cli.workers).await?;
    if let Some(path) = &cli.pid_out {
        fs::write(path, format!("{}\n", std::process::id()))?;
    }
    if let Some(code) = cli.crash_after_init {
        warn!("exiting with {}", code);
        return Ok(code);
    }

    loop {
        let command = client.next_command().await?;
        match command.kind() {
            Kind::Reconfigure => {
                client.reconfigure_status("ok").await?;
                for _ in 0..cli.workers {
                    client.reconfigure_done().await?;
                }
            }
            Kind::Rotate => info!("reopening logs"),
            Kind::Terminate | Kind::EmptyRead => break,
            kind => warn!("ignoring {}", kind),
        }
    }

    Ok(0)
}

fn main() {
    let cli = Cli::parse();
    let _guard = wdog_log::logger("wdog-demo-worker", true);

    if !supervised() {
        error!("not started by the watchdog");
        std::process::exit(2);
    }

    let code = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => match runtime.block_on(serve(cli)) {
            Ok(code) => code,
            Err(err) => {
                error!("{}", err);
                1
            }
        },
        Err(err) => {
            error!("failed to start runtime: {}", err);
            1
        }
    };

    std::process::exit(code);
}
