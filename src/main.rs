use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{error, info, LevelFilter};

use align_dnaseq::cli::parse;
use align_dnaseq::config::defs::RunConfig;
use align_dnaseq::pipelines::align_dnaseq::{run as run_pipeline, StageOutcome};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let run_config = match RunConfig::from_args(args, &dir) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid arguments: {}", e);
            std::process::exit(1);
        }
    };

    match run_pipeline(run_config).await {
        Ok(report) => {
            let ran = report.stages.iter().filter(|(_, o)| *o == StageOutcome::Ran).count();
            info!(
                "Run complete: {} of {} stages executed, {} intermediates removed, {} milliseconds.",
                ran,
                report.stages.len(),
                report.removed.len(),
                run_start.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }

    Ok(())
}
