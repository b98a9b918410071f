use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fescan::sim::{SimBoard, SimFrontend};
use fescan::{
    Conf, DigitalScan, DigitalScanParams, MaskPlan, RunOptions, ScanController, ScanError,
    ScanRecordStore,
};
use log::{info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mask-stepping scan runner")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "fescan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a digital scan
    Run {
        /// Use the software board instead of hardware
        #[arg(long)]
        simulate: bool,
        /// Simulated execution time of one command, in microseconds
        #[arg(long, default_value_t = 50)]
        exec_time_us: u64,
    },
    /// Print the run ledger of the configured scan
    Ledger,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = if cli.config.exists() {
        Conf::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        Conf::from_env()?
    };
    init_logging(&conf)?;

    match cli.cmd {
        Commands::Run {
            simulate,
            exec_time_us,
        } => run(&conf, simulate, Duration::from_micros(exec_time_us)),
        Commands::Ledger => {
            let store = ScanRecordStore::new(&conf.scan.data_path);
            let identifier = conf.scan.identifier.trim_start_matches(['/', '\\']);
            for (run_number, status) in store.runs(identifier)? {
                println!("{run_number}\t{status}");
            }
            Ok(())
        }
    }
}

fn run(conf: &Conf, simulate: bool, exec_time: Duration) -> Result<()> {
    if !simulate {
        bail!("no hardware backend is built in; use --simulate");
    }
    let sim = SimFrontend::new(SimBoard::new().with_exec_time(exec_time));
    let mut controller = ScanController::new(conf, &sim, DigitalScan::new())?;

    let options = RunOptions::from(&conf.run);
    let params = DigitalScanParams {
        plan: MaskPlan::try_from(&conf.mask)?,
        use_delay: conf.mask.use_delay,
    };
    match controller.start(options, params) {
        Ok(()) => {}
        // A foreground scan that failed still holds the run open.
        Err(ScanError::Scan(e)) => {
            controller.stop(None)?;
            return Err(e.context("digital scan"));
        }
        Err(e) => return Err(e.into()),
    }
    let completed = controller.stop(conf.scan.stop_timeout())?;

    info!(
        "Run {} {}",
        controller.identity().run_number.unwrap_or_default(),
        if completed { "completed" } else { "aborted" }
    );
    if completed {
        controller.analyze()?;
    }
    Ok(())
}

fn init_logging(conf: &Conf) -> Result<()> {
    let level = LevelFilter::from_str(&conf.logging.level)
        .with_context(|| format!("invalid log level {:?}", conf.logging.level))?;
    let log_config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Error)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &conf.logging.file {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        loggers.push(WriteLogger::new(level, log_config, file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}
