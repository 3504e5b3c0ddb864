use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use tempfile::{Builder as TempDirBuilder, TempDir};

use crate::config::defs::{
    BwaSubcommand, PipelineError, RunConfig, BQSR_BAI, BQSR_BAM, BQSR_TABLE, BWA_BAM, BWA_SAM,
    DEDUP_BAM, DEDUP_METRICS, INTERMEDIATES_DIR, REQUIRED_TOOLS, SORTED_BAI, SORTED_BAM,
    TRIMMED_R1_SUFFIX, TRIMMED_R2_SUFFIX, TRIM_GALORE_OUT_DIR,
};
use crate::utils::command::{bwa, check_versions, gatk, picard, samtools, trim_galore, ToolCommand};
use crate::utils::file::{all_exist, fastq_root, remove_if_exists};
use crate::utils::streams::run_command;
use crate::utils::system::check_resources;


/// Every file the pipeline reads or writes, relative to one working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineLayout {
    pub trim_dir: PathBuf,
    pub intermediate_dir: PathBuf,
    pub trimmed_fq1: PathBuf,
    pub trimmed_fq2: PathBuf,
    pub out_sam: PathBuf,
    pub bwa_bam: PathBuf,
    pub sorted_bam: PathBuf,
    pub sorted_bai: PathBuf,
    pub dedup_bam: PathBuf,
    pub dedup_metrics: PathBuf,
    pub bqsr_table: PathBuf,
    pub bqsr_bam: PathBuf,
    pub bqsr_bai: PathBuf,
    pub output_bam: PathBuf,
    /// Picard names the index `<prefix>.bai`
    pub picard_output_bai: PathBuf,
    pub output_bai: PathBuf,
}

impl PipelineLayout {
    pub fn new(config: &RunConfig) -> Self {
        let work_dir = &config.work_dir;
        let prefix = &config.args.out_prefix;
        let trim_dir = work_dir.join(TRIM_GALORE_OUT_DIR);
        let intermediate_dir = work_dir.join(INTERMEDIATES_DIR).join(prefix);

        PipelineLayout {
            trimmed_fq1: trim_dir.join(format!("{}{}", fastq_root(&config.fq1), TRIMMED_R1_SUFFIX)),
            trimmed_fq2: trim_dir.join(format!("{}{}", fastq_root(&config.fq2), TRIMMED_R2_SUFFIX)),
            out_sam: intermediate_dir.join(BWA_SAM),
            bwa_bam: intermediate_dir.join(BWA_BAM),
            sorted_bam: intermediate_dir.join(SORTED_BAM),
            sorted_bai: intermediate_dir.join(SORTED_BAI),
            dedup_bam: intermediate_dir.join(DEDUP_BAM),
            dedup_metrics: intermediate_dir.join(DEDUP_METRICS),
            bqsr_table: intermediate_dir.join(BQSR_TABLE),
            bqsr_bam: intermediate_dir.join(BQSR_BAM),
            bqsr_bai: intermediate_dir.join(BQSR_BAI),
            output_bam: work_dir.join(format!("{}.bam", prefix)),
            picard_output_bai: work_dir.join(format!("{}.bai", prefix)),
            output_bai: work_dir.join(format!("{}.bam.bai", prefix)),
            trim_dir,
            intermediate_dir,
        }
    }

    /// Large intermediates deleted once the final BAM is in place.
    /// Trimmed reads, dedup metrics and the recalibration table are kept.
    pub fn cleanup_targets(&self) -> Vec<&Path> {
        vec![
            self.out_sam.as_path(),
            self.bwa_bam.as_path(),
            self.sorted_bam.as_path(),
            self.sorted_bai.as_path(),
            self.dedup_bam.as_path(),
            self.bqsr_bam.as_path(),
            self.bqsr_bai.as_path(),
        ]
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Trim,
    Align,
    Convert,
    Sort,
    Dedup,
    RecalibrateModel,
    RecalibrateApply,
    FinalSort,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Trim,
        Stage::Align,
        Stage::Convert,
        Stage::Sort,
        Stage::Dedup,
        Stage::RecalibrateModel,
        Stage::RecalibrateApply,
        Stage::FinalSort,
    ];

    /// Files whose presence means the stage is done. All must exist after the stage runs.
    pub fn outputs(&self, layout: &PipelineLayout) -> Vec<PathBuf> {
        match self {
            Stage::Trim => vec![layout.trimmed_fq1.clone(), layout.trimmed_fq2.clone()],
            Stage::Align => vec![layout.out_sam.clone()],
            Stage::Convert => vec![layout.bwa_bam.clone()],
            Stage::Sort => vec![layout.sorted_bam.clone()],
            Stage::Dedup => vec![layout.dedup_bam.clone()],
            Stage::RecalibrateModel => vec![layout.bqsr_table.clone()],
            Stage::RecalibrateApply => vec![layout.bqsr_bam.clone()],
            Stage::FinalSort => vec![layout.output_bam.clone()],
        }
    }

    fn needs_tmp_dir(&self) -> bool {
        matches!(self, Stage::Sort | Stage::FinalSort)
    }

    /// Builds the tool invocation for this stage.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated run settings.
    /// * `layout` - Paths for this run.
    /// * `tmp_dir` - Scratch dir for sort stages; ignored by the rest.
    pub fn command(&self, config: &RunConfig, layout: &PipelineLayout, tmp_dir: &Path) -> ToolCommand {
        let args = &config.args;
        let mut cmd = match self {
            Stage::Trim => trim_galore::command(&trim_galore::TrimGaloreConfig {
                fq1: config.fq1.clone(),
                fq2: config.fq2.clone(),
                out_dir: layout.trim_dir.clone(),
                cores: args.cpu,
                quality: args.trim_quality,
                min_length: args.min_length,
                gzip_output: !config.inputs_gzipped,
            }),
            Stage::Align => bwa::command(&bwa::BwaConfig {
                subcommand: BwaSubcommand::Mem,
                reference: config.reference.clone(),
                fq1: layout.trimmed_fq1.clone(),
                fq2: layout.trimmed_fq2.clone(),
                out_sam: layout.out_sam.clone(),
                read_group: bwa::ReadGroup::new(
                    &args.sample,
                    &args.flowcell,
                    &args.lane,
                    &args.index_sequencer,
                    &args.library_preparation,
                    &args.platform,
                ),
                threads: args.cpu,
            }),
            Stage::Convert => samtools::sam_to_bam(layout.out_sam.clone(), layout.bwa_bam.clone()),
            Stage::Sort => picard::sort_and_index(
                layout.bwa_bam.clone(),
                layout.sorted_bam.clone(),
                tmp_dir.to_path_buf(),
                config.picard_mem_gb,
            ),
            Stage::Dedup => picard::mark_duplicates(
                layout.sorted_bam.clone(),
                layout.dedup_bam.clone(),
                layout.dedup_metrics.clone(),
                config.picard_mem_gb,
            ),
            Stage::RecalibrateModel => gatk::base_recalibrator(
                layout.dedup_bam.clone(),
                &config.known_sites,
                config.reference.clone(),
                layout.bqsr_table.clone(),
            ),
            Stage::RecalibrateApply => gatk::apply_bqsr(
                layout.dedup_bam.clone(),
                layout.bqsr_table.clone(),
                layout.bqsr_bam.clone(),
            ),
            Stage::FinalSort => picard::sort_and_index(
                layout.bqsr_bam.clone(),
                layout.output_bam.clone(),
                tmp_dir.to_path_buf(),
                config.picard_mem_gb,
            ),
        };
        cmd.tool = config.tool_program(&cmd.tool);
        cmd
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Trim => "trim reads",
            Stage::Align => "align with bwa",
            Stage::Convert => "convert sam to bam",
            Stage::Sort => "sort and index bam",
            Stage::Dedup => "mark duplicates",
            Stage::RecalibrateModel => "model bqsr",
            Stage::RecalibrateApply => "apply bqsr",
            Stage::FinalSort => "sort and index final bam",
        };
        write!(f, "{}", name)
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Skipped,
    Ran,
    DryRun,
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub stages: Vec<(Stage, StageOutcome)>,
    pub removed: Vec<PathBuf>,
    pub output_bam: PathBuf,
}


/// Runs one stage unless its outputs already exist.
/// Sort stages get a fresh temp dir inside `config.tmp_dir`, removed when the stage ends.
async fn run_stage(config: &RunConfig, layout: &PipelineLayout, stage: Stage) -> Result<StageOutcome, PipelineError> {
    let outputs = stage.outputs(layout);
    if all_exist(&outputs) {
        info!("{}: {} exists. Skipping this step.", stage, outputs[0].display());
        return Ok(StageOutcome::Skipped);
    }

    if config.args.dry_run {
        let cmd = stage.command(config, layout, &config.tmp_dir);
        info!("{}: would execute: {}", stage, cmd);
        return Ok(StageOutcome::DryRun);
    }

    info!("running stage: {}", stage);
    let tmp_guard: Option<TempDir> = if stage.needs_tmp_dir() {
        fs::create_dir_all(&config.tmp_dir).map_err(|e| PipelineError::IOError(e.to_string()))?;
        let dir = TempDirBuilder::new()
            .prefix("sortsam_")
            .tempdir_in(&config.tmp_dir)
            .map_err(|e| PipelineError::IOError(e.to_string()))?;
        info!("created temporary directory {}", dir.path().display());
        Some(dir)
    } else {
        None
    };
    let tmp_dir = tmp_guard.as_ref().map(|d| d.path()).unwrap_or(config.tmp_dir.as_path());

    let cmd = stage.command(config, layout, tmp_dir);
    info!("executing command: {}", cmd);
    let stage_start = Instant::now();
    if let Err(e) = run_command(&cmd, &config.work_dir).await {
        if matches!(e, PipelineError::ToolFailed { .. }) {
            discard_partial_outputs(&outputs);
        }
        return Err(e);
    }
    debug!("{} finished in {} seconds", stage, stage_start.elapsed().as_secs());

    drop(tmp_guard);

    for output in &outputs {
        if !output.is_file() {
            return Err(PipelineError::MissingOutput {
                stage: stage.to_string(),
                path: output.clone(),
            });
        }
    }
    Ok(StageOutcome::Ran)
}


/// Deletes whatever a failed stage left behind so the next run does not skip it.
fn discard_partial_outputs(outputs: &[PathBuf]) {
    for output in outputs.iter().filter(|o| o.is_file()) {
        match fs::remove_file(output) {
            Ok(()) => info!("removed partial output {}", output.display()),
            Err(e) => warn!("could not remove partial output {}: {}", output.display(), e),
        }
    }
}


/// Moves the final index to `<prefix>.bam.bai`. Picard writes `<prefix>.bai`;
/// if neither is present the index is rebuilt with samtools.
async fn finalize_index(config: &RunConfig, layout: &PipelineLayout) -> Result<(), PipelineError> {
    if layout.output_bai.is_file() {
        debug!("{} already in place", layout.output_bai.display());
        return Ok(());
    }

    if layout.picard_output_bai.is_file() {
        info!("renaming {} to {}", layout.picard_output_bai.display(), layout.output_bai.display());
        if !config.args.dry_run {
            fs::rename(&layout.picard_output_bai, &layout.output_bai)
                .map_err(|e| PipelineError::IOError(e.to_string()))?;
        }
        return Ok(());
    }

    let mut cmd = samtools::index_bam(layout.output_bam.clone());
    cmd.tool = config.tool_program(&cmd.tool);
    if config.args.dry_run {
        info!("index: would execute: {}", cmd);
        return Ok(());
    }
    info!("no index found for {}; executing command: {}", layout.output_bam.display(), cmd);
    run_command(&cmd, &config.work_dir).await?;
    if !layout.output_bai.is_file() {
        return Err(PipelineError::MissingOutput {
            stage: "index final bam".to_string(),
            path: layout.output_bai.clone(),
        });
    }
    Ok(())
}


fn cleanup_intermediates(layout: &PipelineLayout) -> Result<Vec<PathBuf>, PipelineError> {
    info!("cleaning up large intermediates");
    let mut removed = Vec::new();
    for path in layout.cleanup_targets() {
        if remove_if_exists(path).map_err(|e| PipelineError::IOError(e.to_string()))? {
            removed.push(path.to_path_buf());
        }
    }
    Ok(removed)
}


/// Run function for the DNA-seq alignment pipeline
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// Result<PipelineReport, PipelineError>
pub async fn run(config: Arc<RunConfig>) -> Result<PipelineReport, PipelineError> {
    info!("\n-------------\n Align DNA-seq\n-------------\n");
    info!("Sample {}; working directory {}", config.args.sample, config.work_dir.display());

    check_resources(&config);

    if !config.args.skip_tool_check && !config.args.dry_run {
        check_versions(REQUIRED_TOOLS, config.tool_dir.as_deref()).await?;
    }

    let layout = PipelineLayout::new(&config);
    let mut report = PipelineReport {
        output_bam: layout.output_bam.clone(),
        ..Default::default()
    };

    if all_exist(&[&layout.output_bam, &layout.output_bai]) {
        info!("{} and its index exist. Nothing to run.", layout.output_bam.display());
        report.stages = Stage::ALL.iter().map(|s| (*s, StageOutcome::Skipped)).collect();
    } else {
        if !config.args.dry_run {
            for dir in [&layout.trim_dir, &layout.intermediate_dir] {
                fs::create_dir_all(dir).map_err(|e| PipelineError::IOError(e.to_string()))?;
            }
        }

        for stage in Stage::ALL {
            let outcome = run_stage(&config, &layout, stage).await?;
            report.stages.push((stage, outcome));
        }

        finalize_index(&config, &layout).await?;
    }

    if config.args.keep_intermediates {
        info!("keeping intermediates in {}", layout.intermediate_dir.display());
    } else if config.args.dry_run {
        for path in layout.cleanup_targets() {
            info!("would remove {}", path.display());
        }
    } else {
        report.removed = cleanup_intermediates(&layout)?;
    }

    info!("Finished: {}", layout.output_bam.display());
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::cli::Arguments;

    fn test_config(dir: &Path) -> RunConfig {
        for name in ["S1_R1.fastq.gz", "S1_R2.fastq.gz", "ref.fa", "dbsnp.vcf.gz"] {
            fs::write(dir.join(name), b"x").unwrap();
        }
        let args = Arguments {
            sample: "S1".to_string(),
            fq1: "S1_R1.fastq.gz".to_string(),
            fq2: "S1_R2.fastq.gz".to_string(),
            reference: "ref.fa".to_string(),
            known_sites: vec!["dbsnp.vcf.gz".to_string()],
            flowcell: "FC".to_string(),
            lane: "L1".to_string(),
            index_sequencer: "SEQ".to_string(),
            library_preparation: "LIB".to_string(),
            platform: "ILLUMINA".to_string(),
            out_prefix: "sample".to_string(),
            cpu: 2,
            gb_alloc: 8,
            min_length: 50,
            trim_quality: 20,
            skip_tool_check: true,
            ..Default::default()
        };
        RunConfig::from_args(args, dir).unwrap()
    }

    #[test]
    fn test_layout_paths() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let layout = PipelineLayout::new(&config);
        let root = dir.path();
        assert_eq!(layout.trimmed_fq1, root.join("trim_galore_outputs/S1_R1_val_1.fq.gz"));
        assert_eq!(layout.trimmed_fq2, root.join("trim_galore_outputs/S1_R2_val_2.fq.gz"));
        assert_eq!(layout.out_sam, root.join("intermediates/sample/bwa_out.sam"));
        assert_eq!(layout.dedup_bam, root.join("intermediates/sample/bwa_out.sorted.dedup.bam"));
        assert_eq!(layout.bqsr_table, root.join("intermediates/sample/bsqr_recal_file.table"));
        assert_eq!(layout.output_bam, root.join("sample.bam"));
        assert_eq!(layout.picard_output_bai, root.join("sample.bai"));
        assert_eq!(layout.output_bai, root.join("sample.bam.bai"));
    }

    #[test]
    fn test_cleanup_targets_keep_metrics_and_table() {
        let dir = tempdir().unwrap();
        let layout = PipelineLayout::new(&test_config(dir.path()));
        let targets = layout.cleanup_targets();
        assert_eq!(targets.len(), 7);
        assert!(!targets.contains(&layout.dedup_metrics.as_path()));
        assert!(!targets.contains(&layout.bqsr_table.as_path()));
        assert!(!targets.contains(&layout.trimmed_fq1.as_path()));
    }

    #[test]
    fn test_stage_commands_chain_outputs() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let layout = PipelineLayout::new(&config);
        let tmp = Path::new("/tmp/sortsam_x");

        let align = Stage::Align.command(&config, &layout, tmp);
        assert_eq!(align.tool, "bwa");
        assert!(align.args.contains(&layout.trimmed_fq1.to_string_lossy().into_owned()));
        assert!(align.args.contains(&"2".to_string()));

        let sort = Stage::Sort.command(&config, &layout, tmp);
        assert!(sort.args.contains(&"-Xmx6g".to_string()));
        assert!(sort.args.contains(&"TMP_DIR=/tmp/sortsam_x".to_string()));

        let apply = Stage::RecalibrateApply.command(&config, &layout, tmp);
        assert!(apply.args.contains(&layout.dedup_bam.to_string_lossy().into_owned()));
        assert!(apply.args.contains(&layout.bqsr_bam.to_string_lossy().into_owned()));

        let final_sort = Stage::FinalSort.command(&config, &layout, tmp);
        assert!(final_sort.args.contains(&format!("I={}", layout.bqsr_bam.display())));
        assert!(final_sort.args.contains(&format!("O={}", layout.output_bam.display())));
    }

    #[test]
    fn test_trim_gzips_plain_input() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(!config.inputs_gzipped);
        let layout = PipelineLayout::new(&config);
        let trim = Stage::Trim.command(&config, &layout, &config.tmp_dir);
        assert!(trim.args.contains(&"--gzip".to_string()));
        assert!(layout.trimmed_fq1.to_string_lossy().ends_with("_val_1.fq.gz"));

        let mut gz_config = config.clone();
        gz_config.inputs_gzipped = true;
        let trim = Stage::Trim.command(&gz_config, &layout, &gz_config.tmp_dir);
        assert!(!trim.args.contains(&"--gzip".to_string()));
    }

    #[test]
    fn test_stage_command_uses_tool_dir() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.tool_dir = Some(PathBuf::from("/opt/env/bin"));
        let layout = PipelineLayout::new(&config);
        assert_eq!(Stage::Dedup.command(&config, &layout, &config.tmp_dir).tool, "/opt/env/bin/picard");
        assert_eq!(Stage::RecalibrateModel.command(&config, &layout, &config.tmp_dir).tool, "/opt/env/bin/gatk");
    }

    #[test]
    fn test_discard_partial_outputs() {
        let dir = tempdir().unwrap();
        let sam = dir.path().join("bwa_out.sam");
        let absent = dir.path().join("never_written.bam");
        fs::write(&sam, b"@HD\tVN:1.6\n").unwrap();
        discard_partial_outputs(&[sam.clone(), absent.clone()]);
        assert!(!sam.exists());
        assert!(!absent.exists());
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ALL.first(), Some(&Stage::Trim));
        assert_eq!(Stage::ALL.last(), Some(&Stage::FinalSort));
        assert_eq!(Stage::Trim.to_string(), "trim reads");
    }

    #[tokio::test]
    async fn test_run_stage_skips_existing_output() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let layout = PipelineLayout::new(&config);
        fs::create_dir_all(&layout.intermediate_dir).unwrap();
        fs::write(&layout.out_sam, b"@HD").unwrap();
        let outcome = run_stage(&config, &layout, Stage::Align).await.unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_trim_requires_both_outputs_to_skip() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.args.dry_run = true;
        let layout = PipelineLayout::new(&config);
        fs::create_dir_all(&layout.trim_dir).unwrap();
        fs::write(&layout.trimmed_fq1, b"x").unwrap();
        let outcome = run_stage(&config, &layout, Stage::Trim).await.unwrap();
        assert_eq!(outcome, StageOutcome::DryRun);
    }

    #[tokio::test]
    async fn test_finalize_index_renames_picard_index() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let layout = PipelineLayout::new(&config);
        fs::write(&layout.output_bam, b"bam").unwrap();
        fs::write(&layout.picard_output_bai, b"bai").unwrap();
        finalize_index(&config, &layout).await.unwrap();
        assert!(layout.output_bai.is_file());
        assert!(!layout.picard_output_bai.exists());
    }
}
