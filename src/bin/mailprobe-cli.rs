use std::fs;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use mailprobe::{
    classify_transcript, CommandTimeouts, ProxyConfig, TranscriptOutcome, Verdict, Verifier,
    VerifyOptions,
};

#[derive(Parser)]
#[command(name = "mailprobe-cli", about = "SMTP mailbox deliverability probing")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,

    /// mirror the diagnostics log to stdout
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe addresses against the given MX hosts
    Verify {
        /// addresses to verify (or use --stdin)
        emails: Vec<String>,

        /// read addresses from stdin, one per line
        #[arg(long)]
        stdin: bool,

        /// MX host, repeatable
        #[arg(long = "mx", value_name = "HOST", required = true)]
        mxs: Vec<String>,

        /// MAIL FROM identity; pass an empty string for a null reverse-path
        #[arg(long, default_value = "user@localhost")]
        sender: String,

        #[arg(long, default_value_t = 25)]
        port: u16,

        /// connect/banner timeout in seconds
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,

        /// probe a random mailbox per domain to detect catch-all behaviour
        #[arg(long)]
        catchall: bool,

        /// count catch-all domains as undeliverable
        #[arg(long)]
        catchall_invalid: bool,

        /// count 450/451/452 greylisting as rejection
        #[arg(long)]
        greylist_invalid: bool,

        /// count communication failures as deliverable
        #[arg(long)]
        comm_failure_valid: bool,

        /// count connection failures as deliverable
        #[arg(long)]
        conn_failure_valid: bool,

        /// HTTP-CONNECT proxy as host:port
        #[arg(long, value_name = "HOST:PORT")]
        proxy: Option<String>,

        /// print results as JSON (requires the with-serde feature)
        #[arg(long)]
        json: bool,
    },
    /// Classify a recorded tunneled-session transcript
    ClassifyTranscript {
        /// transcript file, one line per event
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match cli.cmd {
        Commands::Verify {
            emails,
            stdin,
            mxs,
            sender,
            port,
            connect_timeout,
            catchall,
            catchall_invalid,
            greylist_invalid,
            comm_failure_valid,
            conn_failure_valid,
            proxy,
            json,
        } => {
            let mut emails = emails;
            if stdin {
                for line in io::stdin().lock().lines() {
                    let line = line.context("reading addresses from stdin")?;
                    let line = line.trim();
                    if !line.is_empty() {
                        emails.push(line.to_string());
                    }
                }
            }
            if emails.is_empty() {
                bail!("no addresses given (pass them as arguments or use --stdin)");
            }

            let proxy = proxy.as_deref().map(parse_proxy).transpose()?;
            let options = VerifyOptions {
                port,
                sender,
                timeouts: CommandTimeouts {
                    connected: Duration::from_secs(connect_timeout),
                    ..CommandTimeouts::default()
                },
                catchall_test: catchall,
                catchall_is_valid: !catchall_invalid,
                no_comm_is_valid: comm_failure_valid,
                no_conn_is_valid: conn_failure_valid,
                greylisted_considered_valid: !greylist_invalid,
                debug: cli.debug,
                proxy,
                ..VerifyOptions::default()
            };

            let mut verifier = Verifier::new(options);
            let results = verifier.verify(&emails, &mxs);

            if json {
                #[cfg(feature = "with-serde")]
                {
                    println!("{}", serde_json::to_string_pretty(&results)?);
                    return Ok(());
                }
                #[cfg(not(feature = "with-serde"))]
                bail!("--json requires building with the with-serde feature");
            }

            for (address, verdict) in results.entries() {
                let deliverable = results.is_deliverable(address).unwrap_or(false);
                println!(
                    "{address}\t{}\t{}",
                    if deliverable {
                        "deliverable"
                    } else {
                        "undeliverable"
                    },
                    describe(verdict)
                );
            }
            if let Some(err) = &results.mail_error {
                eprintln!("last failure: {err}");
            }
            Ok(())
        }
        Commands::ClassifyTranscript { file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let lines: Vec<&str> = text.lines().collect();
            match classify_transcript(&lines) {
                TranscriptOutcome::Accepted(line) => println!("accepted: {line}"),
                TranscriptOutcome::Rejected => println!("rejected"),
                TranscriptOutcome::Failure { kind, detail } => {
                    println!("failure ({kind:?}): {detail}")
                }
            }
            Ok(())
        }
    }
}

fn parse_proxy(spec: &str) -> Result<ProxyConfig> {
    let (host, port) = spec
        .rsplit_once(':')
        .with_context(|| format!("proxy '{spec}' is not host:port"))?;
    if host.is_empty() {
        bail!("proxy '{spec}' has an empty host");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("proxy port in '{spec}' is not a number"))?;
    Ok(ProxyConfig {
        host: host.to_string(),
        port,
    })
}

fn describe(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Accepted(raw) => format!("accepted: {}", raw.trim_end()),
        Verdict::Rejected => "rejected".to_string(),
        Verdict::Greylisted(raw) => format!("greylisted: {}", raw.trim_end()),
        Verdict::CatchAll => "catch-all domain".to_string(),
        Verdict::Inconclusive { detail, .. } => format!("inconclusive: {detail}"),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_proxy;

    #[test]
    fn parses_proxy_spec() {
        let proxy = parse_proxy("squid.internal:3128").expect("parse");
        assert_eq!(proxy.host, "squid.internal");
        assert_eq!(proxy.port, 3128);
    }

    #[test]
    fn rejects_bad_proxy_specs() {
        assert!(parse_proxy("no-port").is_err());
        assert!(parse_proxy(":3128").is_err());
        assert!(parse_proxy("host:notaport").is_err());
    }
}
