use crate::bruteforcer::ScanDirection;
use crate::cli::args::CliArgs;
use crate::engine::MAX_QPS;
use crate::output::OutputFormat;
use crate::transform::BypassMode;

pub fn validate(args: &CliArgs) -> Result<(), String> {
    if let Some(raw) = args.scan_direction.as_deref() {
        raw.parse::<ScanDirection>()
            .map_err(|e| format!("invalid --direction: {e}"))?;
    }
    if let Some(raw) = args.bypass_mode.as_deref() {
        raw.parse::<BypassMode>()
            .map_err(|e| format!("invalid --bypass: {e}"))?;
    }
    if let Some(raw) = args.output_format.as_deref() {
        if OutputFormat::parse(raw).is_none() {
            return Err(format!("invalid --output-format '{raw}', expected text or json"));
        }
    }
    if args.scan_level == Some(0) {
        return Err("invalid --level, expected positive integer".to_string());
    }
    if let Some(rate) = args.rate {
        if rate > MAX_QPS {
            tracing::warn!(rate, "rate above {MAX_QPS} disables the limit");
        }
    }
    for (flag, value) in [
        ("--threads", args.task_threads),
        ("--lf-threads", args.lf_task_threads),
        ("--fp-threads", args.fp_threads),
    ] {
        if value == Some(0) {
            return Err(format!("invalid {flag}, expected positive integer"));
        }
    }
    if let Some(target) = args.target.as_deref() {
        reqwest::Url::parse(target).map_err(|e| format!("invalid --target '{target}': {e}"))?;
    }
    Ok(())
}
