//! Command-line front end: stage inputs, run RDFox, print results.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use rdfox_runner::collect::{run_collecting_output, run_in_dir};
use rdfox_runner::core::results::AnswerFormat;
use rdfox_runner::core::types::CommandSpec;
use rdfox_runner::endpoint::EndpointError;
use rdfox_runner::error::RunError;
use rdfox_runner::io::config::{RunnerConfig, load_config, write_config};
use rdfox_runner::io::sandbox::InputSpec;
use rdfox_runner::orchestrator::{RunBuilder, with_run};
use rdfox_runner::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "rdfox-runner",
    version,
    about = "Run RDFox in a temporary working directory"
)]
struct Cli {
    /// TOML config file. Missing file means defaults.
    #[arg(long, global = true, default_value = "rdfox-runner.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script to completion and print the requested outputs as JSON.
    Run {
        #[command(flatten)]
        stage: StageArgs,

        /// Output to collect, as `LABEL=PATH` relative to the working directory.
        #[arg(long = "output", value_name = "LABEL=PATH")]
        outputs: Vec<String>,

        /// Run this shell command instead of an RDFox script.
        #[arg(long, conflicts_with = "script")]
        shell: Option<String>,
    },
    /// Start the endpoint, run one query and print the raw answer.
    Query {
        #[command(flatten)]
        stage: StageArgs,

        /// SPARQL query text.
        #[arg(long)]
        query: String,

        /// Answer format requested from the endpoint.
        #[arg(long, default_value = "application/sparql-results+json")]
        format: String,
    },
    /// Write the effective config (defaults plus environment) to `--config`.
    InitConfig {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct StageArgs {
    /// File to stage, as `TARGET=SOURCE`.
    #[arg(long = "input", value_name = "TARGET=SOURCE")]
    inputs: Vec<String>,

    /// RDFox shell script, one command per line.
    #[arg(long)]
    script: Option<PathBuf>,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            stage,
            outputs,
            shell,
        } => {
            let config = load_config(&cli.config)?;
            cmd_run(&config, &stage, &outputs, shell.as_deref())
        }
        Command::Query {
            stage,
            query,
            format,
        } => cmd_query(load_config(&cli.config)?, &stage, &query, &format),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    let config = RunnerConfig::default().with_env_overrides();
    write_config(path, &config, force)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_run(
    config: &RunnerConfig,
    stage: &StageArgs,
    outputs: &[String],
    shell: Option<&str>,
) -> Result<()> {
    let inputs = parse_inputs(&stage.inputs)?;
    let outputs = outputs
        .iter()
        .map(|pair| split_pair(pair).map(|(label, path)| (label, PathBuf::from(path))))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let collected = match (shell, &stage.script) {
        (Some(shell), _) => run_in_dir(inputs, &outputs, CommandSpec::shell(shell), config)?,
        (None, Some(script)) => {
            let lines = read_script(script)?;
            run_collecting_output(inputs, &outputs, &lines, config)?
        }
        (None, None) => bail!("either --script or --shell is required"),
    };
    let payload = serde_json::to_string_pretty(&collected).context("serialize outputs")?;
    println!("{payload}");
    Ok(())
}

fn cmd_query(config: RunnerConfig, stage: &StageArgs, query: &str, format: &str) -> Result<()> {
    let script = stage
        .script
        .as_ref()
        .ok_or_else(|| anyhow!("--script is required to start the endpoint"))?;
    let lines = read_script(script)?;
    let inputs = parse_inputs(&stage.inputs)?;
    let format = AnswerFormat::from_mime(format);

    let builder = RunBuilder::new(config)
        .inputs(inputs)
        .rdfox_script(&lines)
        .endpoint();
    let answer = with_run(builder, |run| -> Result<_> {
        let endpoint = run
            .endpoint()
            .ok_or_else(|| anyhow!("endpoint did not start"))?;
        Ok(endpoint.query_raw(query, &format)?)
    })?;
    print!("{}", answer.text());
    Ok(())
}

fn parse_inputs(pairs: &[String]) -> Result<Vec<InputSpec>> {
    pairs
        .iter()
        .map(|pair| split_pair(pair).map(|(target, source)| InputSpec::path(target, source)))
        .collect()
}

fn split_pair(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((left, right)) if !left.is_empty() && !right.is_empty() => {
            Ok((left.to_string(), right.to_string()))
        }
        _ => bail!("expected KEY=VALUE, got '{pair}'"),
    }
}

fn read_script(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(text.lines().map(str::to_string).collect())
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(run_err) = err.downcast_ref::<RunError>() {
        return exit_codes::for_run_error(run_err);
    }
    if err.downcast_ref::<EndpointError>().is_some() {
        return exit_codes::ENDPOINT;
    }
    exit_codes::INVALID
}
