// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use gammarelay::protocol::{RequestMessage, Response, SubscriptionKey};
use gammarelay::{Client, ColorDelta, ColorState, DisplayActor, Lifecycle, Params, Service};
use nu_ansi_term::Color;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};

/// Adjust the color temperature and brightness of wayland outputs
#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Unix domain socket path for RPC. Defaults to ~/.wl-gammarelay.sock.
    #[arg(short, long, global = true)]
    sock: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the daemon that owns the compositor connection.
    Daemon(DaemonArgs),

    /// Change the color temperature and brightness.
    Set(SetArgs),

    /// Print the color setting now and after every change.
    Watch,

    /// Print the current color setting.
    Get,
}

#[derive(clap::Args, Debug)]
struct DaemonArgs {
    /// History file to use. Defaults to ~/.wl-gammarelay.hist.
    #[arg(short = 'H', long)]
    history: Option<PathBuf>,

    /// Do not write a history file.
    #[arg(long, conflicts_with = "history")]
    no_history: bool,
}

#[derive(clap::Args, Debug)]
struct SetArgs {
    /// Color temperature to set, neutral is 6500. A + or - prefix adjusts it.
    #[arg(short, long, allow_hyphen_values(true))]
    temperature: Option<String>,

    /// Brightness to set, max is 1.0. A + or - prefix adjusts it.
    #[arg(short, long, allow_hyphen_values(true))]
    brightness: Option<String>,

    /// Do not start the daemon if it is not running.
    #[arg(short = 'D', long)]
    no_daemon: bool,

    #[command(flatten)]
    daemon: DaemonArgs,
}

impl DaemonArgs {
    fn history_path(&self) -> Result<Option<PathBuf>, Box<dyn Error>> {
        if self.no_history {
            return Ok(None);
        }

        match &self.history {
            Some(path) => Ok(Some(path.clone())),
            None => home_file(".wl-gammarelay.hist").map(Some),
        }
    }
}

fn setup_logs() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gammarelay=info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logs();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(why) => {
            eprintln!("{} {why}", Color::Red.bold().paint("error:"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let socket = match cli.sock {
        Some(path) => path,
        None => home_file(".wl-gammarelay.sock")?,
    };

    match cli.command {
        Commands::Daemon(args) => {
            let history = args.history_path()?;
            let listener = bind(&socket).await?;
            daemon(&socket, listener, history).await
        }

        Commands::Set(args) => set(&socket, args).await,

        Commands::Watch => watch(&socket).await,

        Commands::Get => get(&socket).await,
    }
}

fn home_file(name: &str) -> Result<PathBuf, Box<dyn Error>> {
    dirs::home_dir()
        .map(|home| home.join(name))
        .ok_or_else(|| "could not determine the home directory".into())
}

/// Binds the daemon socket, replacing a stale socket file.
async fn bind(socket: &Path) -> Result<UnixListener, Box<dyn Error>> {
    if socket.exists() {
        if UnixStream::connect(socket).await.is_ok() {
            return Err(format!("a daemon is already listening on {}", socket.display()).into());
        }

        tracing::warn!(?socket, "removing stale socket");
        std::fs::remove_file(socket)?;
    }

    Ok(UnixListener::bind(socket)?)
}

/// Serves clients until interrupted, then removes the socket file.
async fn daemon(
    socket: &Path,
    listener: UnixListener,
    history: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let result = serve(listener, history).await;

    if let Err(why) = std::fs::remove_file(socket) {
        tracing::warn!(?socket, %why, "failed to remove socket");
    }

    result
}

async fn serve(listener: UnixListener, history: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let display = Arc::new(gammarelay::connect().await?);

    let params = Params {
        history_path: history,
        ..Params::default()
    };

    tracing::info!(?params, "daemon started");

    let served = Service::new(display.clone(), params)
        .serve(listener, shutdown(&display))
        .await;

    display.close().await;
    served?;

    if display.lifecycle() == Lifecycle::Failed {
        return Err("lost the connection to the compositor".into());
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM, or once the display actor terminated.
async fn shutdown(display: &DisplayActor) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(why) => {
                tracing::warn!(%why, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        () = terminate => tracing::info!("terminated"),
        lifecycle = display.terminated() => tracing::error!(?lifecycle, "display actor terminated"),
    }
}

async fn set(socket: &Path, args: SetArgs) -> Result<(), Box<dyn Error>> {
    // Reject malformed values before a daemon is started for them.
    ColorDelta::parse(args.temperature.as_deref(), args.brightness.as_deref())?;

    let message = RequestMessage::color(args.temperature.clone(), args.brightness.clone());

    if socket.exists() || args.no_daemon {
        let mut client = Client::connect(socket).await?;
        return print_color(&client.request(&message).await?);
    }

    let history = args.daemon.history_path()?;
    let listener = bind(socket).await?;

    let request = async {
        let mut client = Client::connect(socket).await?;
        let reply = client.request(&message).await?;
        print_color(&reply)?;
        Ok::<_, Box<dyn Error>>(())
    };

    let (served, requested) = tokio::join!(daemon(socket, listener, history), request);
    requested?;
    served
}

async fn watch(socket: &Path) -> Result<(), Box<dyn Error>> {
    let mut client = Client::connect(socket).await?;

    let reply = client
        .request(&RequestMessage::subscribe(vec![SubscriptionKey::Color]))
        .await?;
    print_updates(&reply)?;

    while let Some(response) = client.recv().await? {
        print_updates(&response)?;
    }

    Ok(())
}

async fn get(socket: &Path) -> Result<(), Box<dyn Error>> {
    let mut client = Client::connect(socket).await?;

    let reply = client
        .request(&RequestMessage::subscribe(vec![SubscriptionKey::Color]))
        .await?;

    print_updates(&reply)
}

fn check(response: &Response) -> Result<(), Box<dyn Error>> {
    match &response.error {
        Some(message) => Err(message.clone().into()),
        None => Ok(()),
    }
}

fn print_color(response: &Response) -> Result<(), Box<dyn Error>> {
    check(response)?;

    let color = response
        .color
        .as_ref()
        .ok_or("daemon replied without a color")?;

    println!("{}", ColorState::try_from(color)?);

    Ok(())
}

fn print_updates(response: &Response) -> Result<(), Box<dyn Error>> {
    check(response)?;

    for update in response.updates.iter().flatten() {
        if let Some(color) = &update.color {
            println!("{}", ColorState::try_from(color)?);
        }
    }

    Ok(())
}
