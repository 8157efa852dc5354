//! Report on the bans recorded in a vilain log
//!
//! Usage: `vilainreport /var/log/daemon` or `zcat daemon.*.gz | vilainreport`

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use vilain::report::Report;

#[derive(Parser)]
#[command(name = "vilainreport")]
#[command(version, about = "Summarize the bans found in a vilain log")]
struct Cli {
    /// Log file to read (default: stdin)
    file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let input: Box<dyn BufRead> = match &cli.file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin().lock())),
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    run(input, &mut out)?;
    out.flush()?;
    Ok(())
}

fn run<R: BufRead, W: Write>(mut input: R, out: &mut W) -> Result<()> {
    let mut report = Report::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        report.feed(line.trim_end(), out)?;
    }
    report.finish(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_reads_lines() {
        let log = b"2024-05-01 09:12:00  INFO vilain: Blacklisting 10.0.0.5, reason ssh, return code:0\n\xff garbage\n";
        let mut out = Vec::new();
        run(&log[..], &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("### Date 2024-05-01"));
        assert!(out.contains("09:12:00 blacklist IP 10.0.0.5 (ssh)"));
    }
}
