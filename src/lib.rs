pub mod archiver;
pub mod config;
pub mod console;
pub mod credentials;
pub mod db;
pub mod manager;
pub mod transport;
pub mod workflow;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};

use archiver::GzipArchiver;
use config::{Settings, resolve_key_path};
use console::{Console, TerminalConfirmation, prompt_secret};
use manager::{LocalManager, RemoteManager};
use transport::{SshAuth, SshTransport};
use workflow::{SyncWorkflow, WorkflowError, WorkflowReport};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "databaser",
    version,
    about = "Copy MySQL databases between a local project and its remote deployment"
)]
pub struct Cli {
    /// Log debug output to stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// How to reach the remote project.
#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    /// Remote account, as user@host
    #[arg(value_name = "USER@HOST")]
    pub target: String,

    /// Project directory on the remote host
    pub remote_project_path: String,

    /// Private key file; relative paths resolve against the home directory
    #[arg(short = 'k', long = "key", value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Prompt for the account password or the key passphrase
    #[arg(long)]
    pub password: bool,

    /// SSH port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Print a JSON report on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replace the local database with the remote one
    Pull {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Local project directory (defaults to the current directory)
        local_project_path: Option<String>,
    },
    /// Replace the remote database with the local one
    Push {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Local project directory (defaults to the current directory)
        local_project_path: Option<String>,
    },
    /// Download the remote database as a plain SQL file
    Download {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Directory receiving the dump
        #[arg(short = 'o', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Pull {
            remote,
            local_project_path,
        } => {
            let console = Console::new(remote.json);
            let mut remote_manager = open_remote(&remote)?;
            let mut local = LocalManager::new(local_project_path.as_deref().unwrap_or_default());
            let report = SyncWorkflow::new(&mut local, &mut remote_manager)
                .pull(|p| console.progress(p));
            finish(&console, report)
        }
        Commands::Push {
            remote,
            local_project_path,
        } => {
            let console = Console::new(remote.json);
            let mut remote_manager = open_remote(&remote)?;
            let mut local = LocalManager::new(local_project_path.as_deref().unwrap_or_default());
            let mut confirmation = TerminalConfirmation::new(&console);
            let report = SyncWorkflow::new(&mut local, &mut remote_manager)
                .push(&mut confirmation, |p| console.progress(p));
            finish(&console, report)
        }
        Commands::Download { remote, output_dir } => {
            let console = Console::new(remote.json);
            let mut remote_manager = open_remote(&remote)?;
            let report = workflow::download(
                &mut remote_manager,
                &output_dir,
                &GzipArchiver::new(),
                |p| console.progress(p),
            );
            finish(&console, report)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "databaser", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

fn finish(console: &Console, report: Result<WorkflowReport, WorkflowError>) -> Result<()> {
    match report {
        Ok(report) => console.report(&report),
        Err(e) => {
            console.fail_step();
            Err(e.into())
        }
    }
}

/// Split `user@host`. Exactly one `@` is accepted.
pub fn parse_ssh_target(target: &str) -> Result<(&str, &str)> {
    if target.matches('@').count() != 1 {
        bail!("Argument \"user@host\" must contain single \"@\" symbol, got \"{target}\".");
    }
    match target.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok((user, host)),
        _ => bail!("Argument \"user@host\" needs both a user and a host, got \"{target}\"."),
    }
}

fn open_remote(args: &RemoteArgs) -> Result<RemoteManager<SshTransport>> {
    let (user, host) = parse_ssh_target(&args.target)?;
    let settings = Settings::load().context("loading settings")?;

    let key = match &args.key {
        Some(key) => resolve_key_path(key),
        None => settings.key_path(),
    };
    let mut auth = SshAuth::with_key(&key);
    if args.password {
        let prompt = if auth.usable_key().is_some() {
            format!("Passphrase for {}", key.display())
        } else {
            format!("Password for {user}@{host}")
        };
        auth = auth.secret(prompt_secret(&prompt).context("reading password")?);
    }

    let port = args.port.unwrap_or(settings.ssh_port);
    let transport = SshTransport::connect(user, host, port, &auth, settings.connect_timeout())
        .with_context(|| format!("connecting to {user}@{host}:{port}"))?;
    Ok(RemoteManager::new(transport, &args.remote_project_path))
}
