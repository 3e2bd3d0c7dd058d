use std::sync::Arc;
use std::time::Duration;

use clap::{error::ErrorKind, Parser};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::args::CliArgs;
use crate::cli::validation;
use crate::config::{self, ConfigFile, ScanSettings};
use crate::engine::Engine;
use crate::http::ReqwestTransport;
use crate::output::{self, ChannelSink, OutputFormat, TaskRecord};
use crate::runner::{Options, Runner, ScanResult};

fn print_banner() {
    const BANNER: &str = r#"
                 __  __    ____
    ____  ____ _/ /_/ /_  / __/___  _________ ____
   / __ \/ __ `/ __/ __ \/ /_/ __ \/ ___/ __ `/ _ \
  / /_/ / /_/ / /_/ / / / __/ /_/ / /  / /_/ /  __/
 / .___/\__,_/\__/_/ /_/_/  \____/_/   \__, /\___/
/_/                                   /____/
       v0.6.0 - content discovery and bypass fuzzing
    "#;
    eprint!("{}", BANNER);
    eprintln!();
}

fn format_kv_line(label: &str, value: &str) {
    eprintln!(":: {:<18}: {}", label, value);
}

fn format_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[derive(Clone, Debug)]
struct RunConfig {
    options: Options,
    output: Option<String>,
    output_format: OutputFormat,
    collect_output: Option<String>,
    no_color: bool,
}

fn build_run_config(args: CliArgs, cfg: ConfigFile) -> Result<RunConfig, String> {
    validation::validate(&args)?;

    let mut settings = ScanSettings::default();
    settings.merge_file(&cfg);

    if let Some(v) = args.scan_level {
        settings.scan_level = v;
    }
    if let Some(raw) = args.scan_direction.as_deref() {
        settings.scan_direction = raw.parse()?;
    }
    if let Some(raw) = args.bypass_mode.as_deref() {
        settings.bypass_mode = raw.parse()?;
    }
    if args.no_dir_scan {
        settings.dir_scan = false;
    }
    if let Some(v) = args.include_method {
        settings.include_method = v;
    }
    if let Some(v) = args.exclude_suffix {
        settings.exclude_suffix = v;
    }
    if let Some(v) = args.retry_count {
        settings.retry_count = v;
    }
    if let Some(v) = args.retry_interval_ms {
        settings.retry_interval_ms = v;
    }
    if let Some(v) = args.rate {
        settings.qps_limit = v;
    }
    if let Some(v) = args.request_delay_ms {
        settings.request_delay_ms = v;
    }
    if let Some(v) = args.task_threads {
        settings.task_threads = v;
    }
    if let Some(v) = args.lf_task_threads {
        settings.lf_task_threads = v;
    }
    if let Some(v) = args.fp_threads {
        settings.fp_threads = v;
    }
    if let Some(v) = args.timeout {
        settings.timeout_secs = v;
    }
    if let Some(v) = args.proxy {
        settings.proxy = Some(v);
    }
    if let Some(v) = args.payload_set {
        settings.payload_set = v;
    }
    if args.no_follow_redirect {
        settings.follow_redirect = false;
    }
    if args.redirect_cookies_follow {
        settings.redirect_cookies_follow = true;
    }
    if args.no_redirect_host_limit {
        settings.redirect_target_host_limit = false;
    }
    if args.intercept_timeout_host {
        settings.intercept_timeout_host = true;
    }
    if args.no_replace_header {
        settings.replace_header = false;
    }
    if args.no_remove_header {
        settings.remove_header = false;
    }
    if args.payload_processing {
        settings.payload_processing = true;
    }

    let mut urls = cfg.urls.unwrap_or_default();
    urls.extend(args.url);

    let output_path = args.output.or(cfg.output).map(|p| config::expand_tilde_string(&p));
    let output_format = args
        .output_format
        .or(cfg.output_format)
        .as_deref()
        .and_then(OutputFormat::parse)
        .or_else(|| output_path.as_deref().and_then(output::infer_format_from_path))
        .unwrap_or(OutputFormat::Text);

    Ok(RunConfig {
        options: Options {
            urls,
            input_file: args.input_file.or(cfg.input_file),
            raw_request: args.raw_request,
            target: args.target,
            wordlists_dir: args.wordlists.or(cfg.wordlists),
            settings,
        },
        output: output_path,
        output_format,
        collect_output: args
            .collect_output
            .or(cfg.collect_output)
            .map(|p| config::expand_tilde_string(&p)),
        no_color: args.no_color || cfg.no_color.unwrap_or(false),
    })
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pathforge={level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_settings(run: &RunConfig) {
    let s = &run.options.settings;
    format_kv_line("Targets", &run.options.urls.len().to_string());
    if let Some(input) = run.options.input_file.as_deref() {
        format_kv_line("Input file", input);
    }
    format_kv_line(
        "Wordlists",
        run.options.wordlists_dir.as_deref().unwrap_or("(built-in)"),
    );
    format_kv_line("Payload set", &s.payload_set);
    format_kv_line(
        "Scan",
        &format!(
            "dir={} level={} direction={:?} bypass={:?}",
            format_bool(s.dir_scan),
            s.scan_level,
            s.scan_direction,
            s.bypass_mode
        ),
    );
    format_kv_line(
        "Pools",
        &format!(
            "bulk={} interactive={} fingerprint={}",
            s.task_threads, s.lf_task_threads, s.fp_threads
        ),
    );
    format_kv_line(
        "Rate",
        &format!("qps={} delay={}ms", s.qps_limit, s.request_delay_ms),
    );
    format_kv_line("Follow redirects", format_bool(s.follow_redirect));
    if let Some(proxy) = s.proxy.as_deref() {
        format_kv_line("Proxy", proxy);
    }
    if let Some(out) = run.output.as_deref() {
        format_kv_line("Output", out);
    }
    eprintln!();
}

fn progress_bar() -> Result<ProgressBar, String> {
    let pb = ProgressBar::new(1);
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(200));
    pb.set_style(
        ProgressStyle::with_template(
            ":: Progress: [{pos}/{len}] :: {per_sec} :: Duration: [{elapsed_precise}] :: {msg}",
        )
        .map_err(|e| format!("failed to build progress bar style: {e}"))?
        .progress_chars(r#"#>-"#),
    );
    Ok(pb)
}

fn spawn_progress(pb: ProgressBar, engine: Engine, done: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = tick.tick() => {
                    let p = engine.progress();
                    pb.set_length(p.submitted().max(1));
                    pb.set_position(p.completed());
                    pb.set_message(format!(
                        "bulk {}/{} :: interactive {}/{}",
                        p.bulk_completed,
                        p.bulk_submitted,
                        p.interactive_completed,
                        p.interactive_submitted
                    ));
                }
            }
        }
    })
}

fn spawn_printer(
    pb: ProgressBar,
    mut rx: mpsc::UnboundedReceiver<TaskRecord>,
    done: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Some(record) = rx.recv() => pb.println(output::format_line(&record)),
                _ = done.cancelled() => break,
            }
        }
        while let Ok(record) = rx.try_recv() {
            pb.println(output::format_line(&record));
        }
    })
}

async fn write_outputs(run: &RunConfig, result: &ScanResult) -> Result<(), String> {
    if let Some(path) = run.output.as_deref() {
        let bytes = match run.output_format {
            OutputFormat::Text => output::render_text(&result.records),
            OutputFormat::Json => output::render_json(&result.records),
        };
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| format!("failed to write output '{path}': {e}"))?;
    }
    if let Some(path) = run.collect_output.as_deref() {
        let bytes = serde_json::to_vec_pretty(&result.collected)
            .map_err(|e| format!("failed to encode collected data: {e}"))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| format!("failed to write collect output '{path}': {e}"))?;
    }
    Ok(())
}

async fn run_async(run: RunConfig) -> Result<(), String> {
    let runner = Runner::new(run.options.clone()).map_err(|e| e.to_string())?;
    let settings = &run.options.settings;
    let transport = ReqwestTransport::new(settings.timeout(), settings.proxy.as_deref())
        .map_err(|e| e.to_string())?;
    let (sink, rx) = ChannelSink::new();

    let scan = runner
        .start(Arc::new(transport), Some(Arc::new(sink)))
        .await
        .map_err(|e| e.to_string())?;

    let pb = progress_bar()?;
    let done = CancellationToken::new();
    let ticker = spawn_progress(pb.clone(), scan.engine().clone(), done.clone());
    let printer = spawn_printer(pb.clone(), rx, done.clone());

    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = scan.finish(stop).await;
    signal.abort();
    done.cancel();
    let _ = ticker.await;
    let _ = printer.await;
    pb.finish_and_clear();

    if let Some(report) = result.stopped {
        eprintln!(
            "{}",
            format!(
                ":: Interrupted :: stopped all tasks, reclaimed {} queued ({} bulk, {} interactive) ::",
                report.total(),
                report.bulk,
                report.interactive
            )
            .yellow()
        );
    }

    write_outputs(&run, &result).await?;

    if !result.fingerprints.is_empty() {
        let tags: Vec<String> = result
            .fingerprints
            .iter()
            .map(|(tag, n)| format!("{tag} ({n})"))
            .collect();
        format_kv_line("Fingerprints", &tags.join(", "));
    }
    eprintln!();
    eprintln!(
        ":: Completed :: {} requests in {}s ::",
        result.progress.completed(),
        result.elapsed.as_secs()
    );
    Ok(())
}

pub fn run_cli() -> Result<(), String> {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{e}");
                return Ok(());
            }
            _ => return Err(e.to_string()),
        },
    };
    init_logging(args.verbose);

    let cfg = match args.config.as_deref() {
        Some(path) => config::load_config(&config::expand_tilde(path), false)?,
        None => match config::default_config_path() {
            Some(path) => {
                config::ensure_default_config_file(&path)?;
                config::load_config(&path, true)?
            }
            None => ConfigFile::default(),
        },
    };

    let run = build_run_config(args, cfg)?;
    if run.no_color {
        colored::control::set_override(false);
    }
    print_banner();
    print_settings(&run);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build runtime: {e}"))?;

    rt.block_on(run_async(run))
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn cli_flags_override_config_values() {
        let args = CliArgs::parse_from([
            "pathforge",
            "-u",
            "http://example.com/a/b",
            "--level",
            "2",
            "--bypass",
            "multi",
            "--rate",
            "30",
        ]);
        let cfg: ConfigFile =
            serde_yaml::from_str("scan_level: 5\nrate: 10\nretry_count: 3\nurls:\n  - http://c.com/\n")
                .unwrap();
        let run = build_run_config(args, cfg).unwrap();
        let s = &run.options.settings;
        assert_eq!(s.scan_level, 2);
        assert_eq!(s.qps_limit, 30);
        assert_eq!(s.retry_count, 3);
        assert_eq!(s.bypass_mode, crate::transform::BypassMode::Multi);
        assert_eq!(
            run.options.urls,
            ["http://c.com/", "http://example.com/a/b"]
        );
    }

    #[test]
    fn output_format_is_inferred_from_extension() {
        let args = CliArgs::parse_from(["pathforge", "-u", "http://a.com/", "-o", "out.json"]);
        let run = build_run_config(args, ConfigFile::default()).unwrap();
        assert_eq!(run.output_format, OutputFormat::Json);

        let args = CliArgs::parse_from(["pathforge", "-u", "http://a.com/"]);
        let run = build_run_config(args, ConfigFile::default()).unwrap();
        assert_eq!(run.output_format, OutputFormat::Text);
        assert!(run.options.settings.follow_redirect);
    }
}
