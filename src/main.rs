use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

use nuclide_audit::audit::{Audit, AuditConfig, MAX_JOBS};
use nuclide_audit::decoder::{CapstoneDecoder, IcedReference};
use nuclide_audit::fallback::FixPolicy;
use nuclide_audit::format::{self, RunHeader, SummaryFormat};
use nuclide_audit::parser;
use nuclide_audit::report::Reporter;
use nuclide_audit::{Architecture, AuditError, BinaryMetadata};

/// Cross-check an x86-64 binary's CFG against a reference decoder.
#[derive(Debug, Parser)]
#[command(
    name = "nuclide-audit",
    version,
    about,
    after_help = "Exit status: 0 when the audit completes (findings do not change it) and for \
                  -h/--version; 1 on usage errors, unreadable input or a fatal audit error."
)]
struct Cli {
    /// Worker threads for the parse and check phases
    #[arg(short = 'j', long = "jobs", default_value_t = 1,
          value_parser = clap::value_parser!(u16).range(1..=MAX_JOBS as i64))]
    jobs: u16,

    /// Do not print one line per unknown instruction, bad block or gap
    #[arg(short, long)]
    quiet: bool,

    /// Accept instructions the reference decoder finds at the failure address
    #[arg(long, overrides_with_all = ["fix", "fix_all", "no_fix"])]
    fix: bool,

    /// Also accept the bytes skipped before a later valid instruction
    #[arg(long, overrides_with_all = ["fix", "fix_all", "no_fix"])]
    fix_all: bool,

    /// Never substitute placeholder instructions (default)
    #[arg(long, overrides_with_all = ["fix", "fix_all", "no_fix"])]
    no_fix: bool,

    /// Summary format
    #[arg(long, value_enum, default_value_t = SummaryFormat::Text)]
    format: SummaryFormat,

    /// Print the parsed CFG (functions, blocks, out edges) instead of auditing it
    #[arg(long)]
    dump_cfg: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Binary to audit
    filename: PathBuf,
}

impl Cli {
    fn fix_policy(&self) -> FixPolicy {
        if self.fix_all {
            FixPolicy::ALL
        } else if self.fix {
            FixPolicy::VALID
        } else {
            FixPolicy::NONE
        }
    }

    fn config(&self) -> AuditConfig {
        AuditConfig {
            jobs: self.jobs as usize,
            quiet: self.quiet,
            fix: self.fix_policy(),
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => return usage_error(e),
    };

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_module("nuclide_audit", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    if let Err(e) = std::fs::File::open(&cli.filename) {
        let msg = format!("unable to read file: {}: {e}", cli.filename.display());
        return usage_error(Cli::command().error(ErrorKind::Io, msg));
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn usage_error(e: clap::Error) -> ExitCode {
    let _ = e.print();
    ExitCode::from(1)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    if cli.dump_cfg {
        return dump(cli);
    }

    let config = cli.config();
    let header = RunHeader::new(cli.filename.display().to_string(), config.jobs, config.fix);
    let reporter = Arc::new(Reporter::stdout(config.quiet));

    if cli.format == SummaryFormat::Text {
        reporter.banner(format_args!("{header}"));
    }
    reporter.banner(format_args!("\nreading file: {} ...", cli.filename.display()));

    let (data, metadata) = load(&cli.filename)?;
    let image = metadata.code_image(&data);
    let seeds = metadata.function_entries();
    log::info!(
        "{} executable regions, {} function entries",
        image.regions().len(),
        seeds.len()
    );

    let summary = audit(config, reporter.clone())?.run(&image, seeds)?;

    let rendered = format::render(cli.format, &header, &summary)?;
    reporter.banner(format_args!("{rendered}"));
    Ok(())
}

/// `--dump-cfg`: the CFG goes to stdout, diagnostics to stderr.
fn dump(cli: &Cli) -> anyhow::Result<()> {
    let (data, metadata) = load(&cli.filename)?;
    let image = metadata.code_image(&data);

    let reporter = Arc::new(Reporter::new(Box::new(io::stderr()), cli.quiet));
    let audit = audit(cli.config(), reporter)?;

    let mut out = io::BufWriter::new(io::stdout().lock());
    writeln!(out, "--------------------------------------------------")?;
    writeln!(out, "file:  {}", cli.filename.display())?;
    let funcs = audit.dump_cfg(&image, metadata.function_entries(), &mut out)?;
    log::info!("dumped {funcs} functions");
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<(Vec<u8>, BinaryMetadata)> {
    let (data, metadata) =
        parser::parse_file(path).with_context(|| format!("cannot parse {}", path.display()))?;
    if metadata.architecture != Architecture::X86_64 {
        return Err(AuditError::UnsupportedArchitecture(metadata.architecture).into());
    }
    Ok((data, metadata))
}

fn audit(config: AuditConfig, reporter: Arc<Reporter>) -> anyhow::Result<Audit> {
    let primary = CapstoneDecoder::x86_64().context("cannot initialize capstone")?;
    Ok(Audit::new(
        config,
        Arc::new(primary),
        Arc::new(IcedReference::new()),
        reporter,
    ))
}
