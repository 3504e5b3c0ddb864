use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "align-dnaseq", version, about = "Trim, align, dedup and recalibrate paired-end DNA-seq reads")]
pub struct Arguments {

    #[arg(help = "Sample id")]
    pub sample: String,

    #[arg(help = "FASTQ R1")]
    pub fq1: String,

    #[arg(help = "FASTQ R2")]
    pub fq2: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, help = "Reference FASTA. A .dict file must sit in the same directory.")]
    pub reference: String,

    #[clap(
        long = "known-sites",
        value_delimiter = ',',
        help = "Known sites VCF(s) for base recalibration; repeat or comma-separate"
    )]
    pub known_sites: Vec<String>,

    #[arg(long, default_value = "DUMMYFLOWCELL", help = "Flowcell used for sequencing")]
    pub flowcell: String,

    #[arg(long, default_value = "DUMMYLANE", help = "Sequencing lane")]
    pub lane: String,

    #[arg(long = "index-sequencer", default_value = "DUMMYSEQUENCER")]
    pub index_sequencer: String,

    #[arg(long = "library-preparation", default_value = "DUMMYLIB", help = "Library prep id")]
    pub library_preparation: String,

    #[arg(long, default_value = "ILLUMINA")]
    pub platform: String,

    #[arg(long = "out-prefix", default_value = "output", help = "Output prefix for the aligned, sorted and recalibrated BAM")]
    pub out_prefix: String,

    #[arg(short = 'o', long = "out-dir", help = "Working directory for all generated files. Defaults to the current directory.")]
    pub out_dir: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub cpu: usize,

    #[arg(long, help = "Parent directory for sort temp dirs. Defaults to the working directory.")]
    pub tmpdir: Option<String>,

    #[arg(long = "gb-alloc", default_value_t = 16, help = "Gigabytes of allocated memory")]
    pub gb_alloc: u64,

    #[arg(long = "min-length", default_value_t = 50)]
    pub min_length: usize,

    #[arg(long = "trim-quality", default_value_t = 20)]
    pub trim_quality: u8,

    #[arg(long = "keep-intermediates", default_value_t = false)]
    pub keep_intermediates: bool,

    #[arg(long = "dry-run", default_value_t = false, help = "Log the commands that would run without executing them")]
    pub dry_run: bool,

    #[arg(long = "skip-tool-check", default_value_t = false)]
    pub skip_tool_check: bool,

    #[arg(long = "tool-dir", help = "Directory holding trim_galore, bwa, samtools, picard and gatk. Defaults to PATH lookup.")]
    pub tool_dir: Option<String>,
}
