use clap::{Parser, ValueEnum};
use scrollscan::pipeline::{self, PipelineOptions, Preset};
use scrollscan_core::format_amount;
use scrollscan_cv::session::error_chain;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "scrollscan")]
#[command(about = "Capture every record of a scrolling feed exactly once", long_about = None)]
#[command(version)]
struct Args {
    /// Directory of screenshots, replayed in file name order
    screenshots: PathBuf,

    /// Session configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preset used when no configuration file is given
    #[arg(long, value_enum)]
    preset: Option<PresetArg>,

    /// Template search directory (repeatable)
    #[arg(short, long = "templates")]
    template_dirs: Vec<PathBuf>,

    /// Use every image in this directory as a content template
    #[arg(long)]
    content_dir: Option<PathBuf>,

    /// OCR command; `{}` is replaced by the crop path, e.g. "tesseract {} stdout"
    #[arg(long)]
    ocr: Option<String>,

    /// Save every emitted crop as PNG here
    #[arg(long)]
    crops: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Cancel the session after this many seconds
    #[arg(long)]
    time_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    ChatFeed,
    BattleReport,
}

impl From<PresetArg> for Preset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::ChatFeed => Preset::ChatFeed,
            PresetArg::BattleReport => Preset::BattleReport,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let options = PipelineOptions {
        config_path: args.config,
        preset: args.preset.map(Preset::from),
        screenshots: args.screenshots,
        template_dirs: args.template_dirs,
        content_dir: args.content_dir,
        ocr_command: args.ocr,
        crops_dir: args.crops,
        time_limit: args.time_limit.map(Duration::from_secs),
    };

    let report = pipeline::run(&options)?;

    match &args.output {
        Some(path) => {
            report.export_json(path)?;
            log::info!("report written to {:?}", path);
        }
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    let session = &report.session;
    log::info!(
        "{} records, final state {}, {} captures",
        session.records.len(),
        session.final_state,
        session.stats.captures
    );
    if let Some(summary) = &report.summary {
        log::info!(
            "{}/{} records parsed, total {}",
            summary.parsed,
            summary.total_records,
            format_amount(summary.total_amount, 2)
        );
    }

    if let Some(error) = &session.error {
        anyhow::bail!("session failed: {}", error_chain(error));
    }
    if session.cancelled {
        log::warn!("session was cancelled; the report is partial");
    }
    Ok(())
}
