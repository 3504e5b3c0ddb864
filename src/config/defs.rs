use std::fmt;
use std::path::{Path, PathBuf};
use std::collections::HashMap;

use lazy_static::lazy_static;
use log::{debug, warn};
use thiserror::Error;

use crate::cli::Arguments;
use crate::utils::file::{is_gzipped, resolve_path};

// External software
pub const TRIM_GALORE_TAG: &str = "trim_galore";
pub const BWA_TAG: &str = "bwa";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const PICARD_TAG: &str = "picard";
pub const GATK_TAG: &str = "gatk";

pub const REQUIRED_TOOLS: &[&str] = &[TRIM_GALORE_TAG, BWA_TAG, SAMTOOLS_TAG, PICARD_TAG, GATK_TAG];


lazy_static! {
    // (major, minor) below which a warning is logged
    pub static ref MIN_TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(TRIM_GALORE_TAG, (0, 6));
        m.insert(BWA_TAG, (0, 7));
        m.insert(SAMTOOLS_TAG, (1, 10));
        m.insert(PICARD_TAG, (2, 20));
        m.insert(GATK_TAG, (4, 1));
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BwaSubcommand {
    Mem,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    View,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PicardSubcommand {
    SortSam,
    MarkDuplicates,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GatkSubcommand {
    BaseRecalibrator,
    ApplyBqsr,
}

impl fmt::Display for BwaSubcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BwaSubcommand::Mem => write!(f, "mem"),
        }
    }
}

impl fmt::Display for SamtoolsSubcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamtoolsSubcommand::View => write!(f, "view"),
            SamtoolsSubcommand::Index => write!(f, "index"),
        }
    }
}

impl fmt::Display for PicardSubcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PicardSubcommand::SortSam => write!(f, "SortSam"),
            PicardSubcommand::MarkDuplicates => write!(f, "MarkDuplicates"),
        }
    }
}

impl fmt::Display for GatkSubcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatkSubcommand::BaseRecalibrator => write!(f, "BaseRecalibrator"),
            GatkSubcommand::ApplyBqsr => write!(f, "ApplyBQSR"),
        }
    }
}

// Static Filenames
pub const TRIM_GALORE_OUT_DIR: &str = "trim_galore_outputs";
pub const INTERMEDIATES_DIR: &str = "intermediates";
pub const TRIMMED_R1_SUFFIX: &str = "_val_1.fq.gz";
pub const TRIMMED_R2_SUFFIX: &str = "_val_2.fq.gz";
pub const BWA_SAM: &str = "bwa_out.sam";
pub const BWA_BAM: &str = "bwa_out.bam";
pub const SORTED_BAM: &str = "bwa_out.sorted.bam";
pub const SORTED_BAI: &str = "bwa_out.sorted.bai";
pub const DEDUP_BAM: &str = "bwa_out.sorted.dedup.bam";
pub const DEDUP_METRICS: &str = "dedup_metrics.txt";
pub const BQSR_TABLE: &str = "bsqr_recal_file.table";
pub const BQSR_BAM: &str = "final.bam";
pub const BQSR_BAI: &str = "final.bai";

// Static Parameters
pub const PICARD_MEM_HEADROOM_GB: u64 = 2;
pub const PICARD_SORT_ORDER: &str = "coordinate";
pub const PICARD_VALIDATION_STRINGENCY: &str = "STRICT";
pub const STDERR_TAIL_LINES: usize = 20;


#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("{tool} not found: {error}")]
    ToolNotFound { tool: String, error: String },

    #[error("Failed to execute {tool}: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("{tool} exited with status {code}\n{stderr}")]
    ToolFailed { tool: String, code: String, stderr: String },

    #[error("Stage '{stage}' finished but did not produce {}", .path.display())]
    MissingOutput { stage: String, path: PathBuf },

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}


/// Validated settings for one pipeline run.
/// All paths are absolute.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub work_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub fq1: PathBuf,
    pub fq2: PathBuf,
    pub reference: PathBuf,
    pub known_sites: Vec<PathBuf>,
    /// Both inputs are gzip-compressed; trim_galore then compresses its output unprompted.
    pub inputs_gzipped: bool,
    pub tool_dir: Option<PathBuf>,
    pub picard_mem_gb: u64,
    pub args: Arguments,
}

impl RunConfig {
    /// Resolves and validates parsed arguments against `cwd`.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments.
    /// * `cwd` - Directory relative paths are resolved against.
    ///
    /// # Returns
    /// RunConfig, or PipelineError::InvalidConfig / MissingInput.
    pub fn from_args(args: Arguments, cwd: &Path) -> Result<Self, PipelineError> {
        if args.cpu == 0 {
            return Err(PipelineError::InvalidConfig("--cpu must be at least 1".to_string()));
        }
        if args.gb_alloc <= PICARD_MEM_HEADROOM_GB {
            return Err(PipelineError::InvalidConfig(format!(
                "--gb-alloc must be greater than {} (Picard headroom)",
                PICARD_MEM_HEADROOM_GB
            )));
        }
        if args.known_sites.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one --known-sites file is required for base recalibration".to_string(),
            ));
        }
        if args.out_prefix.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("--out-prefix must not be empty".to_string()));
        }

        let fq1 = existing_input(&args.fq1, cwd)?;
        let fq2 = existing_input(&args.fq2, cwd)?;
        let reference = existing_input(&args.reference, cwd)?;
        let known_sites = args
            .known_sites
            .iter()
            .map(|k| existing_input(k, cwd))
            .collect::<Result<Vec<_>, _>>()?;

        let mut inputs_gzipped = true;
        for fq in [&fq1, &fq2] {
            let gz = is_gzipped(fq).map_err(|e| PipelineError::IOError(format!("{}: {}", fq.display(), e)))?;
            debug!("{} gzipped: {}", fq.display(), gz);
            inputs_gzipped &= gz;
        }

        let dict = sequence_dictionary(&reference);
        if !dict.is_file() {
            warn!("Sequence dictionary {} not found; Picard and GATK expect it next to the reference", dict.display());
        }

        let work_dir = match &args.out_dir {
            Some(dir) => resolve_path(dir, cwd),
            None => cwd.to_path_buf(),
        };
        let tmp_dir = match &args.tmpdir {
            Some(dir) if !dir.is_empty() => resolve_path(dir, cwd),
            _ => work_dir.clone(),
        };
        let tool_dir = args.tool_dir.as_ref().map(|dir| resolve_path(dir, cwd));

        Ok(RunConfig {
            work_dir,
            tmp_dir,
            fq1,
            fq2,
            reference,
            known_sites,
            inputs_gzipped,
            tool_dir,
            picard_mem_gb: args.gb_alloc - PICARD_MEM_HEADROOM_GB,
            args,
        })
    }

    /// Program to launch for a tool tag: `<tool_dir>/<tag>` when set, else the bare tag.
    pub fn tool_program(&self, tool: &str) -> String {
        match &self.tool_dir {
            Some(dir) => dir.join(tool).to_string_lossy().into_owned(),
            None => tool.to_string(),
        }
    }
}

/// Picard and GATK look for `<name>.dict` beside `<name>.fa` or `<name>.fa.gz`.
pub fn sequence_dictionary(reference: &Path) -> PathBuf {
    let base = match reference.extension() {
        Some(ext) if ext == "gz" => reference.with_extension(""),
        _ => reference.to_path_buf(),
    };
    base.with_extension("dict")
}

fn existing_input(path: &str, cwd: &Path) -> Result<PathBuf, PipelineError> {
    let resolved = resolve_path(path, cwd);
    if resolved.is_file() {
        Ok(resolved)
    } else {
        Err(PipelineError::MissingInput(resolved))
    }
}
