//! Command line front end: inject boot stages through a generated debugger script.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::LevelFilter;

use stagehand::{
    Stage, StageError, Step, TargetSession,
    config::{BoardTable, BuildRoot, Variant, probe_variant},
    orchestrator::{self, Options, Outcome, Report},
    sequencer::{Transition, advance_to_stage},
    target::script::ScriptTarget,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inject freshly built boot stages into a halted target")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Board table (TOML). Defaults to the built-in LAN966x table.
    #[arg(long, global = true)]
    board: Option<PathBuf>,
    /// Build output directory. Defaults to the path in ~/.atfpath, then build/<target>/debug.
    #[arg(long, global = true)]
    build: Option<PathBuf>,
    /// How long to wait for a stage entry to be reached.
    #[arg(long, global = true, default_value = "60s", value_parser = humantime::parse_duration)]
    timeout: Duration,
    /// Image variant to inject.
    #[arg(long, global = true, value_enum, default_value_t = VariantArg::Board)]
    variant: VariantArg,
    /// Write the debugger script here instead of to stdout.
    #[arg(long, global = true)]
    script: Option<PathBuf>,
    /// Directory for the image copies the script restores from.
    #[arg(long, global = true, default_value = "stagehand-images")]
    staging: PathBuf,
    /// More logging; repeat for more.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load BL1 at its entry.
    Bl1,
    /// Inject BL2.
    Bl2(StageArgs),
    /// Inject BL2U.
    Bl2u(StageArgs),
    /// Inject BL31.
    Bl31(StageArgs),
    /// Inject BL32.
    Bl32(StageArgs),
    /// Inject BL33.
    Bl33(StageArgs),
    /// Inject U-Boot.
    Uboot(StageArgs),
    /// Reset the target, load BL1 and inject BL2.
    Reset,
    /// Reset the target and inject every stage of the full sequence.
    FullSequence,
}

#[derive(Debug, Args)]
struct StageArgs {
    /// Set the program counter to the entry and load there, instead of running to it.
    #[arg(long)]
    direct: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VariantArg {
    Board,
    Fpga,
    /// Read the board's variant register.
    Auto,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match embassy_futures::block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let table = match &cli.board {
        Some(path) => BoardTable::load(path)?,
        None => BoardTable::lan966x()?,
    };
    let root = match cli.build {
        Some(path) => BuildRoot::new(path),
        None => BuildRoot::resolve(&table.build_target),
    };
    log::info!("{} images from {}", table.name, root.path().display());

    std::fs::create_dir_all(&cli.staging)
        .with_context(|| format!("create staging directory {}", cli.staging.display()))?;
    let out: Box<dyn Write> = match &cli.script {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create script {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    let status = Status {
        to_stderr: cli.script.is_none(),
        script: match &cli.script {
            Some(path) => path.display().to_string(),
            None => String::from("stdout"),
        },
    };
    let mut session = TargetSession::new(ScriptTarget::new(out, &cli.staging));

    let variant = match cli.variant {
        VariantArg::Board => Variant::Board,
        VariantArg::Fpga => Variant::Fpga,
        VariantArg::Auto => {
            let register = table
                .variant_register
                .with_context(|| format!("{} has no variant register", table.name))?;
            probe_variant(&mut session, register)
                .await
                .context("cannot detect the variant, pass --variant board or fpga")?
        }
    };

    let (name, args) = match cli.command {
        Command::Bl1 => ("bl1", StageArgs { direct: true }),
        Command::Bl2(args) => ("bl2", args),
        Command::Bl2u(args) => ("bl2u", args),
        Command::Bl31(args) => ("bl31", args),
        Command::Bl32(args) => ("bl32", args),
        Command::Bl33(args) => ("bl33", args),
        Command::Uboot(args) => ("uboot", args),
        Command::Reset => {
            let stages = table.sequence("reset", &root, variant)?;
            return boot(session, &stages, cli.timeout, &status).await;
        }
        Command::FullSequence => {
            let stages = table.sequence("full", &root, variant)?;
            return boot(session, &stages, cli.timeout, &status).await;
        }
    };

    let stage = table.stage(name, &root, variant)?;
    let code = if args.direct {
        match orchestrator::load_at_entry(&mut session, &stage).await {
            Ok(address) => status.transition(&stage.name, Transition::Completed { address }),
            Err(e) => status.failed(&e),
        }
    } else {
        match inject(&mut session, &stage, cli.timeout).await {
            Ok(transition) => status.transition(&stage.name, transition),
            Err(e) => status.failed(&e),
        }
    };
    finish(session, &status)?;
    Ok(code)
}

/// Reset the target and inject `stages` in order.
async fn boot<W: Write>(
    mut session: TargetSession<ScriptTarget<W>>,
    stages: &[Stage],
    timeout: Duration,
    status: &Status,
) -> Result<ExitCode> {
    let options = Options {
        reset_first: true,
        timeout,
        ..Options::default()
    };
    let code = match orchestrator::run_sequence(&mut session, stages, &options).await {
        Ok(report) => status.report(&report),
        Err(e) => status.failed(&e),
    };
    finish(session, status)?;
    Ok(code)
}

/// Stop the target, then run it into `stage`.
async fn inject<W: Write>(
    session: &mut TargetSession<ScriptTarget<W>>,
    stage: &Stage,
    timeout: Duration,
) -> Result<Transition, StageError> {
    session
        .stop()
        .await
        .map_err(|e| StageError::new(&stage.name, Step::Stop, e))?;
    advance_to_stage(session, stage, timeout).await
}

fn finish<W: Write>(session: TargetSession<ScriptTarget<W>>, status: &Status) -> Result<()> {
    session
        .into_inner()
        .into_inner()
        .flush()
        .context("write script")?;
    status.line(&format!("script written to {}", status.script));
    Ok(())
}

/// One-line status reports, kept off stdout while the script goes there.
///
/// Stages are only loaded once the debugger runs the script, so the lines describe what the
/// script does rather than what already happened on the target.
struct Status {
    to_stderr: bool,
    script: String,
}

impl Status {
    fn line(&self, line: &str) {
        if self.to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn print_transition(&self, stage: &str, transition: Transition) {
        self.line(&match transition {
            Transition::Completed { address } => format!("{stage}: script loads image @ {address}"),
            Transition::AlreadyLoaded { address } => {
                format!("{stage}: already halted at entry, script loads image @ {address}")
            }
            Transition::TimedOut => format!("{stage}: timed out waiting for the stage entry"),
        });
    }

    fn transition(&self, stage: &str, transition: Transition) -> ExitCode {
        self.print_transition(stage, transition);
        match transition {
            Transition::TimedOut => ExitCode::from(1),
            _ => ExitCode::SUCCESS,
        }
    }

    fn failed(&self, error: &StageError) -> ExitCode {
        let mut line = error.to_string();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            line.push_str(&format!(": {cause}"));
            source = cause.source();
        }
        self.line(&line);
        ExitCode::from(2)
    }

    fn report(&self, report: &Report) -> ExitCode {
        for completion in &report.completed {
            self.print_transition(&completion.stage, completion.transition);
        }
        match &report.outcome {
            Outcome::Finished => ExitCode::SUCCESS,
            Outcome::TimedOut { stage } => self.transition(stage, Transition::TimedOut),
            Outcome::Failed(error) => self.failed(error),
        }
    }
}
