use std::process::ExitCode;

#[macro_use]
extern crate log;

use anyhow::{Context as _, Result};
use argh::FromArgs;
use tokio::signal::unix::{signal, SignalKind};

use mender_rs::daemon::{Context, ExternalEvent, StartMode, StateMachine};
use mender_rs::proxy::AuthProxy;
use mender_rs::{standalone, MenderConfig, MenderStore};

/// Device-side update client: installs signed artifacts delivered by the
/// fleet management server, or from local files in standalone mode.
#[derive(FromArgs, Debug)]
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Daemon(DaemonArgs),
    Install(InstallArgs),
    Commit(CommitArgs),
    Rollback(RollbackArgs),
    CheckUpdate(CheckUpdateArgs),
    SendInventory(SendInventoryArgs),
    ShowArtifact(ShowArtifactArgs),
    ShowProvides(ShowProvidesArgs),
}

/// run the update daemon
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "daemon")]
struct DaemonArgs {}

/// install an artifact from a file or URL
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "install")]
struct InstallArgs {
    /// path or URL of the artifact
    #[argh(positional)]
    src: String,

    /// exit with code 2 when the installed update needs a reboot
    #[argh(switch)]
    reboot_exit_code: bool,
}

/// commit a pending standalone update
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "commit")]
struct CommitArgs {}

/// roll a pending standalone update back
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "rollback")]
struct RollbackArgs {}

/// poll the server once and run a pending deployment to completion
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "check-update")]
struct CheckUpdateArgs {}

/// collect and submit the inventory once
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "send-inventory")]
struct SendInventoryArgs {}

/// print the name of the installed artifact
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "show-artifact")]
struct ShowArtifactArgs {}

/// print everything the device currently provides
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "show-provides")]
struct ShowProvidesArgs {}

async fn run_machine(config: MenderConfig, mode: StartMode) -> Result<()> {
    let ctx = Context::new(config).context("failed to set the client up")?;

    // Local consumers that cannot set their own Authorization header go
    // through the authenticating proxy.
    let proxy = AuthProxy::spawn(ctx.auth.clone())
        .await
        .context("failed to start the authenticating proxy")?;
    info!("authenticated API available on {}", proxy.url());

    let (mut machine, events) = StateMachine::new(ctx, mode);

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!("failed to install the SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("received termination signal");
        let _ = events.send(ExternalEvent::Terminate).await;
    });

    machine.run().await?;
    proxy.shutdown().await;
    Ok(())
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = MenderConfig::load().context("failed to load the configuration")?;

    match args.command {
        Command::Daemon(_) => {
            run_machine(config, StartMode::Daemon).await?;
        }
        Command::CheckUpdate(_) => {
            run_machine(config, StartMode::OneShotPoll).await?;
        }
        Command::SendInventory(_) => {
            run_machine(config, StartMode::OneShotInventory).await?;
        }
        Command::Install(install) => {
            let store = MenderStore::open(&config.paths.datastore_dir)?;
            let outcome = standalone::install(&config, &store, &install.src).await?;
            if outcome.committed {
                println!("installed and committed artifact {}", outcome.artifact_name);
            } else if outcome.needs_reboot {
                println!(
                    "installed artifact {}, reboot and commit to complete",
                    outcome.artifact_name
                );
            } else {
                println!(
                    "installed artifact {}, commit to complete",
                    outcome.artifact_name
                );
            }
            if install.reboot_exit_code && outcome.needs_reboot {
                return Ok(ExitCode::from(2));
            }
        }
        Command::Commit(_) => {
            let store = MenderStore::open(&config.paths.datastore_dir)?;
            standalone::commit(&config, &store).await?;
        }
        Command::Rollback(_) => {
            let store = MenderStore::open(&config.paths.datastore_dir)?;
            standalone::rollback(&config, &store).await?;
        }
        Command::ShowArtifact(_) => {
            let store = MenderStore::open(&config.paths.datastore_dir)?;
            match store.artifact_name()? {
                Some(name) => println!("{name}"),
                None => println!("unknown"),
            }
        }
        Command::ShowProvides(_) => {
            let store = MenderStore::open(&config.paths.datastore_dir)?;
            for (key, value) in standalone::show_provides(&store)? {
                println!("{key}={value}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args: Args = argh::from_env();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
