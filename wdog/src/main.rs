use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process, time::Duration};
use tokio::runtime::{Builder, Runtime};
use wdog::{
    client::AdminClient,
    config::{self, DEFAULT_TEMP_DIR},
    process::{detach, running, Detached},
    Config, Error, Supervisor,
};
use wdog_log::{error, info};

/// Privileged watchdog for a supervised server
#[derive(Parser)]
#[command(name = "wdog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory of the supervisor socket and the PID file
    #[arg(short, long, global = true, default_value = DEFAULT_TEMP_DIR)]
    temp_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the watchdog and the server
    Run(RunArgs),
    /// Restart the server and wait until it is initialized
    Restart {
        /// Write the watchdog's messages to this file during the restart
        #[arg(short, long)]
        status_file: Option<PathBuf>,
    },
    /// Reconfigure the server and print its status
    Reconfigure {
        /// Attach to a reconfiguration that is already running
        #[arg(long)]
        attach: bool,
    },
    /// Ask the server to reopen its log files
    Rotate,
    /// Stop the server and the watchdog
    Stop,
}

#[derive(Args)]
struct RunArgs {
    /// Do not detach from the terminal
    #[arg(short = 'd', long)]
    foreground: bool,
    /// Run the server once to check its configuration
    #[arg(short = 'n', long)]
    check: bool,
    /// PID file, defaults to wdog.pid in the temp directory
    #[arg(short, long)]
    pid_file: Option<PathBuf>,
    /// Owner of the temp directory when started as root
    #[arg(short, long)]
    user: Option<String>,
    /// Maximum number of open channels
    #[arg(long, default_value_t = 64)]
    capacity: usize,
    /// Seconds between housekeeping rounds
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,
    /// Seconds before a reconfiguration is given up
    #[arg(long, default_value_t = 300)]
    reconfigure_timeout: u64,
    /// The server binary
    worker: PathBuf,
    /// Arguments for the server
    #[arg(last = true)]
    args: Vec<String>,
}

fn runtime() -> Runtime {
    match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            process::exit(1);
        }
    }
}

fn run(temp_dir: PathBuf, args: RunArgs) -> i32 {
    let config = Config {
        temp_dir,
        pid_file: args.pid_file,
        worker: args.worker,
        args: args.args,
        user: args.user,
        foreground: args.foreground,
        check: args.check,
        capacity: args.capacity,
        poll_interval: Duration::from_secs(args.poll_interval.max(1)),
        reconfigure_timeout: Duration::from_secs(args.reconfigure_timeout),
    };

    let _guard = match wdog_log::logger("wdog", !config.detach()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logger: {}", err);
            return 1;
        }
    };

    if running(&config.pid_file(), &config.socket_path()) {
        info!("server already running");
        return 0;
    }

    let parent = if config.detach() {
        match detach() {
            Ok(Detached::Parent(code)) => return code,
            Ok(Detached::Child { parent }) => Some(parent),
            Err(err) => {
                error!("failed to detach: {}", err);
                return 1;
            }
        }
    } else {
        None
    };

    runtime().block_on(async move {
        match Supervisor::new(config, parent) {
            Ok(supervisor) => supervisor.run().await,
            Err(err) => {
                error!("{}", err);
                if let Some(parent) = parent {
                    wdog::process::notify_parent(parent, false);
                }
                1
            }
        }
    })
}

async fn admin(temp_dir: PathBuf, command: Commands) -> Result<(), Error> {
    let mut client = AdminClient::for_temp_dir(&temp_dir).await.map_err(|err| {
        Error::Setup(
            format!(
                "watchdog is not running ({}): {}",
                config::socket_path(&temp_dir).display(),
                err
            )
            .into(),
        )
    })?;

    match command {
        Commands::Restart { status_file } => client.restart(status_file.as_deref()).await,
        Commands::Reconfigure { attach } => {
            let status = if attach {
                client.reconfigure_status().await?
            } else {
                client.reconfigure().await?
            };
            for line in status {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Rotate => client.rotate().await,
        Commands::Stop => client.stop().await,
        Commands::Run(_) => Ok(()),
    }
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run(args) => run(cli.temp_dir, args),
        command => match runtime().block_on(admin(cli.temp_dir, command)) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("Error: {}", err);
                1
            }
        },
    };

    process::exit(code);
}
