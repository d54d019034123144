//! Text recognition through an external OCR command.
//!
//! The crop is written to a temporary PNG and its path appended to the
//! command line; the command's standard output is the recognized text.

use anyhow::{bail, Context};
use image::RgbaImage;
use scrollscan_cv::traits::TextRecognizer;
use std::process::Command;
use tempfile::Builder;

/// Runs e.g. `tesseract <args> <crop.png> stdout` once per record.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
    trailing_args: Vec<String>,
    confidence: f32,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            trailing_args: Vec::new(),
            confidence: 1.0,
        }
    }

    /// Split a shell-style command line on whitespace. `{}` marks where the
    /// crop path goes; without it the path is appended.
    pub fn from_command_line(line: &str) -> anyhow::Result<Self> {
        let mut words = line.split_whitespace();
        let program = words.next().context("OCR command is empty")?;

        let mut recognizer = Self::new(program);
        let mut after_path = false;
        for word in words {
            match (word, after_path) {
                ("{}", _) => after_path = true,
                (_, false) => recognizer.args.push(word.to_string()),
                (_, true) => recognizer.trailing_args.push(word.to_string()),
            }
        }
        Ok(recognizer)
    }

    /// Confidence reported for every recognized string; the command gives none.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

impl TextRecognizer for CommandRecognizer {
    fn recognize_text(&self, region: &RgbaImage) -> anyhow::Result<(String, f32)> {
        let file = Builder::new()
            .prefix("scrollscan-crop-")
            .suffix(".png")
            .tempfile()
            .context("Failed to create temporary crop file")?;
        region
            .save(file.path())
            .with_context(|| format!("Failed to write crop: {:?}", file.path()))?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(file.path())
            .args(&self.trailing_args)
            .output()
            .with_context(|| format!("Failed to run OCR command: {}", self.program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((text, self.confidence))
    }
}
