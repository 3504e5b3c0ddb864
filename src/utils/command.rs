/// Functions and structs for building the external tool command lines

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::try_join_all;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use tokio::process::Command;

use crate::config::defs::{
    PipelineError, BWA_TAG, GATK_TAG, MIN_TOOL_VERSIONS, PICARD_TAG, SAMTOOLS_TAG, TRIM_GALORE_TAG,
};

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"v?(\d+)\.(\d+)(?:\.\d+)*").unwrap();
}


/// One external program invocation. Run directly, never through a shell.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub tool: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<I, S>(tool: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolCommand {
            tool: tool.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Renders the equivalent shell command, quoting arguments that need it.
impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tool)?;
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\\' || c == '"') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}


pub mod trim_galore {
    use std::path::PathBuf;
    use crate::config::defs::TRIM_GALORE_TAG;
    use super::{path_arg, ToolCommand};

    #[derive(Debug, Clone)]
    pub struct TrimGaloreConfig {
        pub fq1: PathBuf,
        pub fq2: PathBuf,
        pub out_dir: PathBuf,
        pub cores: usize,
        pub quality: u8,
        pub min_length: usize,
        // plain input only yields .fq.gz outputs with --gzip
        pub gzip_output: bool,
    }

    pub fn arg_generator(config: &TrimGaloreConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--phred33".to_string());
        args_vec.push("--fastqc".to_string());
        args_vec.push("--cores".to_string());
        args_vec.push(config.cores.to_string());
        args_vec.push("-q".to_string());
        args_vec.push(config.quality.to_string());
        args_vec.push("--length".to_string());
        args_vec.push(config.min_length.to_string());
        if config.gzip_output {
            args_vec.push("--gzip".to_string());
        }
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(&config.out_dir));
        args_vec.push("--paired".to_string());
        args_vec.push(path_arg(&config.fq1));
        args_vec.push(path_arg(&config.fq2));
        args_vec
    }

    pub fn command(config: &TrimGaloreConfig) -> ToolCommand {
        ToolCommand::new(TRIM_GALORE_TAG, arg_generator(config))
    }
}


pub mod bwa {
    use std::fmt;
    use std::path::PathBuf;
    use crate::config::defs::{BwaSubcommand, BWA_TAG};
    use super::{path_arg, ToolCommand};

    /// SAM read group. Rendered with literal `\t` separators, which bwa expands.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ReadGroup {
        pub id: String,
        pub platform: String,
        pub library: String,
        pub platform_unit: String,
        pub sample: String,
    }

    impl ReadGroup {
        pub fn new(
            sample: &str,
            flowcell: &str,
            lane: &str,
            index_sequencer: &str,
            library_preparation: &str,
            platform: &str,
        ) -> Self {
            ReadGroup {
                id: format!("{}.{}", flowcell, lane),
                platform: platform.to_string(),
                library: format!("{}.{}", sample, library_preparation),
                platform_unit: format!("{}.{}.{}", flowcell, lane, index_sequencer),
                sample: sample.to_string(),
            }
        }
    }

    impl fmt::Display for ReadGroup {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "@RG\\tID:{}\\tPL:{}\\tLB:{}\\tPU:{}\\tSM:{}",
                self.id, self.platform, self.library, self.platform_unit, self.sample
            )
        }
    }

    #[derive(Debug, Clone)]
    pub struct BwaConfig {
        pub subcommand: BwaSubcommand,
        pub reference: PathBuf,
        pub fq1: PathBuf,
        pub fq2: PathBuf,
        pub out_sam: PathBuf,
        pub read_group: ReadGroup,
        pub threads: usize,
    }

    pub fn arg_generator(config: &BwaConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(config.subcommand.to_string());
        args_vec.push("-t".to_string());
        args_vec.push(config.threads.to_string());
        // mark shorter split hits as secondary for Picard compatibility
        args_vec.push("-M".to_string());
        args_vec.push("-R".to_string());
        args_vec.push(config.read_group.to_string());
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(&config.out_sam));
        args_vec.push(path_arg(&config.reference));
        args_vec.push(path_arg(&config.fq1));
        args_vec.push(path_arg(&config.fq2));
        args_vec
    }

    pub fn command(config: &BwaConfig) -> ToolCommand {
        ToolCommand::new(BWA_TAG, arg_generator(config))
    }
}


pub mod samtools {
    use std::path::PathBuf;
    use crate::config::defs::{SamtoolsSubcommand, SAMTOOLS_TAG};
    use super::{path_arg, ToolCommand};

    #[derive(Debug, Clone)]
    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        pub input: PathBuf,
        pub output: Option<PathBuf>,
    }

    pub fn arg_generator(config: &SamtoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(config.subcommand.to_string());
        match config.subcommand {
            SamtoolsSubcommand::View => {
                args_vec.push("-hb".to_string());
                if let Some(output) = &config.output {
                    args_vec.push("-o".to_string());
                    args_vec.push(path_arg(output));
                }
                args_vec.push(path_arg(&config.input));
            }
            SamtoolsSubcommand::Index => {
                args_vec.push(path_arg(&config.input));
                if let Some(output) = &config.output {
                    args_vec.push(path_arg(output));
                }
            }
        }
        args_vec
    }

    pub fn command(config: &SamtoolsConfig) -> ToolCommand {
        ToolCommand::new(SAMTOOLS_TAG, arg_generator(config))
    }

    pub fn sam_to_bam(sam: PathBuf, bam: PathBuf) -> ToolCommand {
        command(&SamtoolsConfig {
            subcommand: SamtoolsSubcommand::View,
            input: sam,
            output: Some(bam),
        })
    }

    pub fn index_bam(bam: PathBuf) -> ToolCommand {
        command(&SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Index,
            input: bam,
            output: None,
        })
    }
}


pub mod picard {
    use std::path::PathBuf;
    use crate::config::defs::{PicardSubcommand, PICARD_SORT_ORDER, PICARD_TAG, PICARD_VALIDATION_STRINGENCY};
    use super::{path_arg, ToolCommand};

    #[derive(Debug, Clone)]
    pub struct PicardConfig {
        pub subcommand: PicardSubcommand,
        pub input: PathBuf,
        pub output: PathBuf,
        pub mem_gb: u64,
        // SortSam: TMP_DIR. MarkDuplicates: metrics file.
        pub aux: PathBuf,
    }

    pub fn arg_generator(config: &PicardConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(config.subcommand.to_string());
        args_vec.push(format!("-Xmx{}g", config.mem_gb));
        match config.subcommand {
            PicardSubcommand::SortSam => {
                args_vec.push("CREATE_INDEX=true".to_string());
                args_vec.push(format!("SORT_ORDER={}", PICARD_SORT_ORDER));
                args_vec.push(format!("VALIDATION_STRINGENCY={}", PICARD_VALIDATION_STRINGENCY));
                args_vec.push(format!("I={}", path_arg(&config.input)));
                args_vec.push(format!("O={}", path_arg(&config.output)));
                args_vec.push(format!("TMP_DIR={}", path_arg(&config.aux)));
            }
            PicardSubcommand::MarkDuplicates => {
                args_vec.push("REMOVE_DUPLICATES=false".to_string());
                args_vec.push(format!("I={}", path_arg(&config.input)));
                args_vec.push(format!("O={}", path_arg(&config.output)));
                args_vec.push(format!("M={}", path_arg(&config.aux)));
            }
        }
        args_vec
    }

    pub fn command(config: &PicardConfig) -> ToolCommand {
        ToolCommand::new(PICARD_TAG, arg_generator(config))
    }

    pub fn sort_and_index(input: PathBuf, output: PathBuf, tmp_dir: PathBuf, mem_gb: u64) -> ToolCommand {
        command(&PicardConfig {
            subcommand: PicardSubcommand::SortSam,
            input,
            output,
            mem_gb,
            aux: tmp_dir,
        })
    }

    pub fn mark_duplicates(input: PathBuf, output: PathBuf, metrics: PathBuf, mem_gb: u64) -> ToolCommand {
        command(&PicardConfig {
            subcommand: PicardSubcommand::MarkDuplicates,
            input,
            output,
            mem_gb,
            aux: metrics,
        })
    }
}


pub mod gatk {
    use std::path::PathBuf;
    use crate::config::defs::{GatkSubcommand, GATK_TAG};
    use super::{path_arg, ToolCommand};

    pub fn base_recalibrator(input: PathBuf, known_sites: &[PathBuf], reference: PathBuf, table: PathBuf) -> ToolCommand {
        let mut args_vec: Vec<String> = vec![GatkSubcommand::BaseRecalibrator.to_string()];
        args_vec.push("--input".to_string());
        args_vec.push(path_arg(&input));
        for site in known_sites {
            args_vec.push("--known-sites".to_string());
            args_vec.push(path_arg(site));
        }
        args_vec.push("--reference".to_string());
        args_vec.push(path_arg(&reference));
        args_vec.push("--output".to_string());
        args_vec.push(path_arg(&table));
        ToolCommand::new(GATK_TAG, args_vec)
    }

    pub fn apply_bqsr(input: PathBuf, table: PathBuf, output: PathBuf) -> ToolCommand {
        let args_vec: Vec<String> = vec![
            GatkSubcommand::ApplyBqsr.to_string(),
            "--input".to_string(),
            path_arg(&input),
            "--bqsr-recal-file".to_string(),
            path_arg(&table),
            "--emit-original-quals".to_string(),
            "true".to_string(),
            "--output".to_string(),
            path_arg(&output),
        ];
        ToolCommand::new(GATK_TAG, args_vec)
    }
}


/// Pulls the first dotted version number out of a tool's banner.
pub fn parse_version(text: &str) -> Option<String> {
    VERSION_RE
        .find(text)
        .map(|m| m.as_str().trim_start_matches('v').to_string())
}

/// Compares the major.minor of `version` against `minimum`.
/// Unparseable versions pass.
pub fn version_at_least(version: &str, minimum: (u32, u32)) -> bool {
    match VERSION_RE.captures(version) {
        Some(caps) => {
            let major: u32 = caps[1].parse().unwrap_or(0);
            let minor: u32 = caps[2].parse().unwrap_or(0);
            (major, minor) >= minimum
        }
        None => true,
    }
}


/// Confirms a tool can be launched and reports its version.
/// bwa has no version flag and exits non-zero on bare invocation, so exit status is ignored.
///
/// # Arguments
///
/// * `tool` - One of the tool tags in config::defs.
/// * `tool_dir` - Directory to launch the tool from; PATH lookup when None.
///
/// # Returns
/// Version string, or "unknown" if the banner had none.
pub async fn presence_check(tool: &str, tool_dir: Option<&Path>) -> Result<String, PipelineError> {
    let version_args: &[&str] = match tool {
        TRIM_GALORE_TAG => &["--version"],
        BWA_TAG => &[],
        SAMTOOLS_TAG => &["--version"],
        PICARD_TAG => &["SortSam", "--version"],
        GATK_TAG => &["--version"],
        _ => return Err(PipelineError::InvalidConfig(format!("Unknown tool: {}", tool))),
    };

    let program = match tool_dir {
        Some(dir) => dir.join(tool),
        None => PathBuf::from(tool),
    };
    let output = Command::new(&program)
        .args(version_args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| PipelineError::ToolNotFound {
            tool: tool.to_string(),
            error: format!("{}. Is {} installed and on PATH?", e, tool),
        })?;

    let banner = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(parse_version(&banner).unwrap_or_else(|| "unknown".to_string()))
}


/// Runs presence checks for all `tools` concurrently.
///
/// # Returns
/// tool -> version, or the first ToolNotFound.
pub async fn check_versions(tools: &[&str], tool_dir: Option<&Path>) -> Result<HashMap<String, String>, PipelineError> {
    let checks = tools.iter().map(|&tool| async move {
        presence_check(tool, tool_dir).await.map(|version| (tool, version))
    });
    let results = try_join_all(checks).await?;

    let mut versions = HashMap::new();
    for (tool, version) in results {
        info!("Found {} version {}", tool, version);
        if let Some(minimum) = MIN_TOOL_VERSIONS.get(tool) {
            if !version_at_least(&version, *minimum) {
                warn!(
                    "{} version {} is older than the tested minimum {}.{}",
                    tool, version, minimum.0, minimum.1
                );
            }
        }
        versions.insert(tool.to_string(), version);
    }
    Ok(versions)
}
