//! Offline capture pipeline: configuration + recorded screenshots in, JSON
//! report out.

use crate::ocr::CommandRecognizer;
use anyhow::{Context, Result};
use scrollscan_core::{AmountParser, ParsedRecord, RecordSummary};
use scrollscan_cv::session::{record_channel, spawn_record_worker, CollectingSink};
use scrollscan_cv::traits::RecordSink;
use scrollscan_cv::utils::ImageUtils;
use scrollscan_cv::{
    CancellationFlag, ReplaySource, ScrollController, SessionConfig, SessionResult, TemplateKind,
    TemplateStore,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Named configuration presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    ChatFeed,
    BattleReport,
}

impl Preset {
    pub fn config(self) -> SessionConfig {
        match self {
            Preset::ChatFeed => SessionConfig::for_chat_feed(),
            Preset::BattleReport => SessionConfig::for_battle_report(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// JSON configuration; takes precedence over `preset`
    pub config_path: Option<PathBuf>,
    pub preset: Option<Preset>,
    /// Directory of screenshots replayed in file name order
    pub screenshots: PathBuf,
    /// Extra template search directories
    pub template_dirs: Vec<PathBuf>,
    /// Every image here becomes a content template
    pub content_dir: Option<PathBuf>,
    /// OCR command line; `{}` stands for the crop path
    pub ocr_command: Option<String>,
    pub crops_dir: Option<PathBuf>,
    /// Cancel the session after this long
    pub time_limit: Option<Duration>,
}

/// Everything a run produced
#[derive(Debug, Serialize)]
pub struct Report {
    pub session: SessionResult,
    pub records: Vec<ParsedRecord>,
    pub summary: Option<RecordSummary>,
}

impl Report {
    pub fn export_json(&self, output_path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;

        std::fs::write(output_path, json)
            .with_context(|| format!("Failed to write JSON to: {:?}", output_path))?;

        Ok(())
    }
}

/// Resolve the session configuration for `options`.
pub fn load_config(options: &PipelineOptions) -> Result<SessionConfig> {
    let mut config = match (&options.config_path, options.preset) {
        (Some(path), _) => SessionConfig::from_json_file(path)?,
        (None, Some(preset)) => preset.config(),
        (None, None) => SessionConfig::default(),
    };

    config.template_dirs.extend(options.template_dirs.iter().cloned());

    if let Some(dir) = &options.content_dir {
        let found = TemplateStore::new().descriptors_in_dir(dir)?;
        log::info!("{} content templates from {:?}", found.len(), dir);
        for descriptor in found {
            if !config.templates.iter().any(|t| t.name == descriptor.name) {
                config.templates.push(descriptor);
            }
        }
    }

    // Replayed screenshots are already settled
    config.scroll.settle_ms = 0;

    let markers = config
        .templates
        .iter()
        .filter(|t| t.kind != TemplateKind::Content)
        .count();
    log::debug!(
        "configuration: {} templates ({} markers), patience {}",
        config.templates.len(),
        markers,
        config.halt_patience
    );
    Ok(config)
}

/// Run one session over recorded screenshots.
pub fn run(options: &PipelineOptions) -> Result<Report> {
    let config = load_config(options)?;
    let source = ReplaySource::from_dir(&options.screenshots)?;
    let store = Arc::new(TemplateStore::new());
    let cancel = CancellationFlag::new();

    if let Some(limit) = options.time_limit {
        let flag = cancel.clone();
        std::thread::Builder::new()
            .name("scrollscan-timer".to_string())
            .spawn(move || {
                std::thread::sleep(limit);
                flag.cancel();
            })?;
    }

    let (session, records) = match &options.ocr_command {
        Some(line) => {
            let recognizer = CommandRecognizer::from_command_line(line)?;
            let (sink, receiver) = record_channel();
            let worker = spawn_record_worker(receiver, recognizer, AmountParser::new())?;

            let session = run_session(config, store, source, sink, cancel)?;
            let records = worker
                .join()
                .map_err(|_| anyhow::anyhow!("record worker panicked"))?;
            (session, records)
        }
        None => {
            let session = run_session(config, store, source, CollectingSink::new(), cancel)?;
            (session, Vec::new())
        }
    };

    if let Some(dir) = &options.crops_dir {
        save_crops(&session, dir)?;
    }

    let summary = (!records.is_empty()).then(|| RecordSummary::from_records(&records));
    Ok(Report {
        session,
        records,
        summary,
    })
}

/// Build a controller and run it; the sink is dropped afterwards so
/// channel workers see the end of the stream.
fn run_session<K: RecordSink>(
    config: SessionConfig,
    store: Arc<TemplateStore>,
    source: ReplaySource,
    sink: K,
    cancel: CancellationFlag,
) -> Result<SessionResult> {
    let mut controller =
        ScrollController::new(config, store, source, sink)?.with_cancellation(cancel);
    Ok(controller.run())
}

fn save_crops(session: &SessionResult, dir: &Path) -> Result<()> {
    for record in &session.records {
        let path = dir.join(format!("record_{:04}_{}.png", record.index, record.template));
        ImageUtils::save_image(&record.crop, &path)?;
    }
    log::info!("saved {} crops to {:?}", session.records.len(), dir);
    Ok(())
}
