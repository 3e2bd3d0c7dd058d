use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pathforge",
    version,
    about = "content-discovery and bypass fuzzing engine",
    long_about = "Pathforge expands every target into directory prefixes, combines them with payload wordlists and bypass variants, and sends the candidates through a rate-limited two-tier worker pool.\n\nExamples:\n  pathforge -u https://target.tld/admin/api/test -w ./wordlists\n  pathforge -i urls.txt --level 2 --direction right --bypass multi -o out.json\n  pathforge --raw-request req.txt --target https://target.tld/\n\nTip: Use --config to persist scan settings and keep CLI invocations short."
)]
pub struct CliArgs {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help_heading = "Output",
        help = "Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins when set."
    )]
    pub verbose: u8,

    #[arg(
        short = 'n',
        long = "no-color",
        help_heading = "Output",
        help = "Disable colored output."
    )]
    pub no_color: bool,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "FILE",
        help_heading = "Output",
        help = "Write results to a file."
    )]
    pub output: Option<String>,

    #[arg(
        short = 'A',
        long = "output-format",
        value_name = "FORMAT",
        help_heading = "Output",
        help = "Output format (text or json). Inferred from the output extension when omitted."
    )]
    pub output_format: Option<String>,

    #[arg(
        long = "collect-output",
        value_name = "FILE",
        help_heading = "Output",
        help = "Write collected file names, paths and parameters to a JSON file."
    )]
    pub collect_output: Option<String>,

    #[arg(
        short = 'u',
        long = "url",
        value_name = "URL",
        action = ArgAction::Append,
        help_heading = "Input",
        help = "Target URL (repeatable)."
    )]
    pub url: Vec<String>,

    #[arg(
        short = 'i',
        long = "input-file",
        value_name = "FILE",
        help_heading = "Input",
        help = "Load target URLs from a file (one per line)."
    )]
    pub input_file: Option<String>,

    #[arg(
        long = "raw-request",
        value_name = "FILE",
        requires = "target",
        help_heading = "Input",
        help = "Send a raw HTTP request from a file as a send-origin exchange."
    )]
    pub raw_request: Option<String>,

    #[arg(
        long = "target",
        value_name = "URL",
        help_heading = "Input",
        help = "Service (scheme://host[:port]) the raw request is sent to."
    )]
    pub target: Option<String>,

    #[arg(
        short = 'w',
        long = "wordlists",
        value_name = "DIR",
        help_heading = "Input",
        help = "Wordlist directory (payloads/<set>.txt, bypass_prefix.txt, host_deny.txt, ...)."
    )]
    pub wordlists: Option<String>,

    #[arg(
        short = 'C',
        long = "config",
        value_name = "FILE",
        help_heading = "Input",
        help = "Path to config file (defaults to ~/.pathforge/config.yml)."
    )]
    pub config: Option<String>,

    #[arg(
        long = "payload-set",
        value_name = "NAME",
        help_heading = "Scan",
        help = "Payload set to scan with (file stem under payloads/)."
    )]
    pub payload_set: Option<String>,

    #[arg(
        short = 'l',
        long = "level",
        value_name = "N",
        help_heading = "Scan",
        help = "Directory levels to scan under (default 99)."
    )]
    pub scan_level: Option<usize>,

    #[arg(
        short = 'd',
        long = "direction",
        value_name = "DIR",
        help_heading = "Scan",
        help = "Which end of the path the level is counted from (left or right)."
    )]
    pub scan_direction: Option<String>,

    #[arg(
        long = "no-dir-scan",
        help_heading = "Scan",
        help = "Only scan the request path itself, not its parent directories."
    )]
    pub no_dir_scan: bool,

    #[arg(
        short = 'b',
        long = "bypass",
        value_name = "MODE",
        help_heading = "Scan",
        help = "Bypass mode (none, single or multi)."
    )]
    pub bypass_mode: Option<String>,

    #[arg(
        short = 'm',
        long = "include-method",
        value_name = "METHODS",
        help_heading = "Filters",
        help = "Only scan proxied requests with these methods ('|'-delimited)."
    )]
    pub include_method: Option<String>,

    #[arg(
        short = 'x',
        long = "exclude-suffix",
        value_name = "SUFFIXES",
        help_heading = "Filters",
        help = "Do not re-send original requests with these path suffixes ('|'-delimited)."
    )]
    pub exclude_suffix: Option<String>,

    #[arg(
        long = "retry",
        value_name = "N",
        help_heading = "HTTP",
        help = "Retries after a failed send (default 0)."
    )]
    pub retry_count: Option<u32>,

    #[arg(
        long = "retry-interval",
        value_name = "MS",
        help_heading = "HTTP",
        help = "Delay between retries in milliseconds."
    )]
    pub retry_interval_ms: Option<u64>,

    #[arg(
        short = 'r',
        long = "rate",
        value_name = "QPS",
        help_heading = "Performance",
        help = "Bulk request rate limit per second (0 or above 9999 disables)."
    )]
    pub rate: Option<u32>,

    #[arg(
        long = "delay",
        value_name = "MS",
        help_heading = "Performance",
        help = "Fixed spacing between bulk requests in milliseconds."
    )]
    pub request_delay_ms: Option<u64>,

    #[arg(
        short = 't',
        long = "threads",
        value_name = "N",
        help_heading = "Performance",
        help = "Bulk pool workers (default 50)."
    )]
    pub task_threads: Option<usize>,

    #[arg(
        long = "lf-threads",
        value_name = "N",
        help_heading = "Performance",
        help = "Low-frequency pool workers (default 25)."
    )]
    pub lf_task_threads: Option<usize>,

    #[arg(
        long = "fp-threads",
        value_name = "N",
        help_heading = "Performance",
        help = "Fingerprint pool workers (default 10)."
    )]
    pub fp_threads: Option<usize>,

    #[arg(
        short = 'T',
        long = "timeout",
        value_name = "SECONDS",
        help_heading = "HTTP",
        help = "Per-request timeout in seconds."
    )]
    pub timeout: Option<u64>,

    #[arg(
        short = 'p',
        long = "proxy",
        value_name = "URL",
        help_heading = "HTTP",
        help = "Upstream HTTP proxy URL (e.g. http://127.0.0.1:8080)."
    )]
    pub proxy: Option<String>,

    #[arg(
        long = "no-follow-redirect",
        help_heading = "Redirects",
        help = "Do not follow 3xx responses."
    )]
    pub no_follow_redirect: bool,

    #[arg(
        long = "redirect-cookies",
        help_heading = "Redirects",
        help = "Carry Set-Cookie values into the followed request."
    )]
    pub redirect_cookies_follow: bool,

    #[arg(
        long = "no-redirect-host-limit",
        help_heading = "Redirects",
        help = "Follow redirects to hosts outside the allow/deny lists."
    )]
    pub no_redirect_host_limit: bool,

    #[arg(
        long = "intercept-timeout-host",
        help_heading = "HTTP",
        help = "Stop sending to a host once every attempt against it has failed."
    )]
    pub intercept_timeout_host: bool,

    #[arg(
        long = "no-replace-header",
        help_heading = "Headers",
        help = "Do not apply headers.txt replacements."
    )]
    pub no_replace_header: bool,

    #[arg(
        long = "no-remove-header",
        help_heading = "Headers",
        help = "Do not apply remove_headers.txt removals."
    )]
    pub no_remove_header: bool,

    #[arg(
        long = "payload-processing",
        help_heading = "Processing",
        help = "Apply the processing rules from the config file to every request."
    )]
    pub payload_processing: bool,
}
