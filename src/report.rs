//! Ban report built from the daemon log
//!
//! Reads the `Blacklisting ...` lines written by the aggregator and prints a
//! per-day listing followed by per-probe, hourly and top-attacker counters.

use regex::Regex;
use std::collections::HashMap;
use std::io::{self, Write};

const BAN_LINE: &str = r"^(\d+)-(\d+)-(\d+) (\d+):(\d+):(\d+).*Blacklisting (\d+\.\d+\.\d+\.\d+), reason (.*), return";

/// One ban found in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub day: String,
    pub hour: String,
    pub time: String,
    pub ip: String,
    pub reason: String,
}

/// Counter that remembers the order keys first appeared in
#[derive(Debug, Default, Clone)]
pub struct Counter {
    order: Vec<String>,
    counts: HashMap<String, u64>,
}

impl Counter {
    pub fn inc(&mut self, key: &str) {
        match self.counts.get_mut(key) {
            Some(n) => *n += 1,
            None => {
                self.order.push(key.to_string());
                self.counts.insert(key.to_string(), 1);
            }
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn reset(&mut self) {
        self.order.clear();
        self.counts.clear();
    }

    /// Keys by decreasing count, first-seen order between ties
    pub fn top(&self) -> Vec<(&str, u64)> {
        let mut items: Vec<(&str, u64)> = self
            .order
            .iter()
            .map(|k| (k.as_str(), self.get(k)))
            .collect();
        items.sort_by(|a, b| b.1.cmp(&a.1));
        items
    }
}

pub fn plural(noun: &str, count: u64) -> String {
    if count > 1 {
        format!("{}s", noun)
    } else {
        noun.to_string()
    }
}

/// Streaming report: feed it log lines, then call [`Report::finish`]
pub struct Report {
    pattern: Regex,
    last_day: Option<String>,
    daily: Counter,
    global: Counter,
    hourly: Counter,
    top: Counter,
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(BAN_LINE).expect("ban line pattern is valid"),
            last_day: None,
            daily: Counter::default(),
            global: Counter::default(),
            hourly: Counter::default(),
            top: Counter::default(),
        }
    }

    pub fn parse_line(&self, line: &str) -> Option<BanRecord> {
        let caps = self.pattern.captures(line)?;
        Some(BanRecord {
            day: format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]),
            hour: caps[4].to_string(),
            time: format!("{}:{}:{}", &caps[4], &caps[5], &caps[6]),
            ip: caps[7].to_string(),
            reason: caps[8].to_string(),
        })
    }

    /// Process one log line; lines that are not bans are ignored
    pub fn feed<W: Write>(&mut self, line: &str, out: &mut W) -> io::Result<()> {
        let Some(record) = self.parse_line(line) else {
            return Ok(());
        };

        if self.last_day.as_deref() != Some(record.day.as_str()) {
            writeln!(out)?;
            self.write_daily(out)?;
            self.daily.reset();
            writeln!(out, "\n### Date {}", record.day)?;
            self.last_day = Some(record.day.clone());
        }

        writeln!(
            out,
            "{} blacklist IP {} ({})",
            record.time, record.ip, record.reason
        )?;

        self.daily.inc(&record.reason);
        self.global.inc(&record.reason);
        self.hourly.inc(&record.hour);
        self.top.inc(&record.ip);
        Ok(())
    }

    /// Print the counters of the last day and the summary sections
    pub fn finish<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out)?;
        self.write_daily(out)?;

        writeln!(out, "\n### Attacks per probe")?;
        for reason in self.global.keys() {
            let count = self.global.get(reason);
            writeln!(out, "Probe '{}': {} {}", reason, count, plural("attack", count))?;
        }

        writeln!(out, "\n### Hourly repartition")?;
        let mut hours: Vec<&String> = self.hourly.keys().iter().collect();
        hours.sort();
        for hour in hours {
            let next = hour.parse::<u32>().map(|h| h + 1).unwrap_or(0);
            writeln!(out, "Hour {} - {:02}: {}", hour, next, self.hourly.get(hour))?;
        }

        writeln!(out, "\n### Top attackers")?;
        for (ip, count) in self.top.top() {
            if count < 2 {
                break;
            }
            writeln!(out, "IP {:<16}: {}", ip, count)?;
        }
        Ok(())
    }

    fn write_daily<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for reason in self.daily.keys() {
            let count = self.daily.get(reason);
            writeln!(out, "Probe '{}': {} {}", reason, count, plural("attack", count))?;
        }
        Ok(())
    }
}
