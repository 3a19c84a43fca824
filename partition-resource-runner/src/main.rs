/// The partition-resource-runner executable
///
/// Reconciles partitions against a local partition state file, printing the
/// change report as JSON.
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::{ColorChoice, CommandFactory as _, Parser, Subcommand};
use partition_resource::{
    device::PartitionDevice as _,
    reconcile::{ReconcileOptions, Reconciler},
    state::CanonicalState,
};
use partition_resource_runner::inputs::InputArgs;
use partition_resources_local::LocalDevice;
use serde::Serialize;

mod logging;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::Apply { inputs, check } => {
            set_up_logging(&args.options)?;
            runtime()?.block_on(apply(&args.options, inputs, *check))
        }
        Commands::Remove { name, check } => {
            set_up_logging(&args.options)?;
            runtime()?.block_on(remove(&args.options, name, *check))
        }
        Commands::Show { name } => {
            set_up_logging(&args.options)?;
            runtime()?.block_on(show(&args.options, name))
        }
        Commands::GenerateMan => {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        }
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(
                *shell,
                &mut cmd,
                "partition-resource-runner",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .context("failed to initialize tokio runtime")
}

fn set_up_logging(options: &Options) -> Result<()> {
    let color = match options.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stderr().is_terminal(),
    };
    logging::set_up(&logging::Options {
        verbose: options.verbose,
        color,
    })
}

async fn apply(options: &Options, inputs: &InputArgs, check_mode: bool) -> Result<()> {
    let params = inputs.gather()?;
    // Validate before touching the device.
    let desired = CanonicalState::from_user_input(&params)?;
    let device = LocalDevice::open(&options.state_file)?;
    let report = Reconciler::with_options(&device, ReconcileOptions { check_mode })
        .reconcile(&desired)
        .await?;
    print_json(&report)
}

async fn remove(options: &Options, name: &str, check_mode: bool) -> Result<()> {
    let device = LocalDevice::open(&options.state_file)?;
    let report = Reconciler::with_options(&device, ReconcileOptions { check_mode })
        .remove(name)
        .await?;
    print_json(&report)
}

async fn show(options: &Options, name: &str) -> Result<()> {
    let device = LocalDevice::open(&options.state_file)?;
    if !device.exists(name).await? {
        bail!("partition {} does not exist", name);
    }
    let current = CanonicalState::from_device_response(&device.read(name).await?)
        .with_context(|| format!("unexpected state for partition {}", name))?;
    print_json(&current.to_user_params())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("partition-resource-runner error: {:?}", e);
            exit(1);
        }
    }
}

/// Reconcile partitions declaratively
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Parser, Debug, Clone)]
struct Options {
    /// The state file holding the partitions of the local device
    #[arg(
        long,
        global = true,
        env = "PARTITION_STATE_FILE",
        default_value = "partitions.json"
    )]
    state_file: PathBuf,

    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update a partition so that it matches the given parameters
    Apply {
        #[command(flatten)]
        inputs: InputArgs,

        /// Report what would change, without changing anything
        #[arg(long)]
        check: bool,
    },

    /// Delete a partition if it exists
    Remove {
        /// The name of the partition
        #[arg(long)]
        name: String,

        /// Report what would change, without changing anything
        #[arg(long)]
        check: bool,
    },

    /// Print a partition's current state in parameter form
    Show {
        /// The name of the partition
        #[arg(long)]
        name: String,
    },

    /// Generate markdown documentation for partition-resource-runner
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for partition-resource-runner
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for partition-resource-runner
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn parse_apply() {
        let args = Args::try_parse_from([
            "partition-resource-runner",
            "--state-file",
            "/tmp/partitions.json",
            "apply",
            "--check",
            "-s",
            "name",
            "foo",
            "-j",
            "route_domain",
            "1",
        ])
        .unwrap();
        assert_eq!(args.options.state_file, PathBuf::from("/tmp/partitions.json"));
        match args.command {
            Commands::Apply { inputs, check } => {
                assert!(check);
                assert_eq!(inputs.param_str, vec!["name", "foo"]);
                assert_eq!(inputs.param_json, vec!["route_domain", "1"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn params_json_conflicts_with_params_file() {
        let r = Args::try_parse_from([
            "partition-resource-runner",
            "apply",
            "--params-json",
            "{}",
            "--params-file",
            "params.json",
        ]);
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn apply_then_show() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            state_file: dir.path().join("partitions.json"),
            verbose: false,
            color: ColorChoice::Never,
        };
        let inputs = InputArgs {
            param_str: vec!["name".into(), "foo".into(), "route_domain".into(), "2".into()],
            ..Default::default()
        };
        apply(&options, &inputs, false).await.unwrap();
        show(&options, "foo").await.unwrap();
        remove(&options, "foo", false).await.unwrap();
        assert!(show(&options, "foo").await.is_err());
    }

    #[tokio::test]
    async fn apply_rejects_invalid_params_before_touching_device() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            state_file: dir.path().join("partitions.json"),
            verbose: false,
            color: ColorChoice::Never,
        };
        let inputs = InputArgs {
            param_str: vec!["name".into(), "foo".into(), "route_domain".into(), "x".into()],
            ..Default::default()
        };
        assert!(apply(&options, &inputs, false).await.is_err());
        assert!(!options.state_file.exists());
    }
}
