use anyhow::Result;
use clap::Parser;
use fxhash::{FxHashMap, FxHashSet};
use lockdep::{Events, LogEntry, read_log};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Lockdep - summarise the event log of a lock-order validation run"
)]
struct Cli {
    /// Path to the log file
    log_file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let entries = read_log(&cli.log_file)?;
    print!("{}", summarize(&entries));
    Ok(())
}

fn summarize(entries: &[LogEntry]) -> String {
    let mut counts: FxHashMap<Events, usize> = FxHashMap::default();
    let mut locks = FxHashSet::default();
    let mut threads = FxHashSet::default();
    for entry in entries {
        *counts.entry(entry.event).or_default() += 1;
        locks.insert(entry.lock);
        threads.insert(entry.thread_id);
    }

    let mut out = String::new();
    out.push_str(&format!("{} events\n", entries.len()));
    for event in [
        Events::Acquire,
        Events::Release,
        Events::CondvarWait,
        Events::CondvarSignal,
        Events::Denied,
    ] {
        out.push_str(&format!(
            "  {:<14}{}\n",
            format!("{event:?}"),
            counts.get(&event).copied().unwrap_or(0)
        ));
    }
    out.push_str(&format!("{} distinct locks, {} threads\n", locks.len(), threads.len()));

    for denial in entries.iter().filter(|e| e.event == Events::Denied) {
        let kind = denial.kind.map_or_else(|| "lock".to_string(), |k| k.to_string());
        out.push_str(&format!(
            "DENIED thread {} acquiring {kind} {:#x}",
            denial.thread_id, denial.lock
        ));
        if let Some(held) = denial.peer {
            out.push_str(&format!(" while holding {held:#x}"));
        }
        if !denial.cycle.is_empty() {
            let path: Vec<String> = denial
                .cycle
                .iter()
                .chain(std::iter::once(&denial.lock))
                .map(|addr| format!("{addr:#x}"))
                .collect();
            out.push_str(&format!(": {}", path.join(" -> ")));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockdep::LockKind;

    #[test]
    fn test_summary_counts_and_denials() {
        let entries = vec![
            LogEntry::new(1, 0xa0, Some(LockKind::Mutex), Events::Acquire),
            LogEntry::new(1, 0xb0, Some(LockKind::Mutex), Events::Acquire),
            LogEntry::new(1, 0xb0, Some(LockKind::Mutex), Events::Release),
            LogEntry::new(2, 0xa0, Some(LockKind::Mutex), Events::Denied)
                .with_peer(0xb0)
                .with_cycle(vec![0xa0, 0xb0]),
        ];

        let summary = summarize(&entries);
        assert!(summary.starts_with("4 events\n"));
        assert!(summary.contains("Acquire       2"));
        assert!(summary.contains("Denied        1"));
        assert!(summary.contains("2 distinct locks, 2 threads"));
        assert!(summary.contains(
            "DENIED thread 2 acquiring mutex 0xa0 while holding 0xb0: 0xa0 -> 0xb0 -> 0xa0"
        ));
    }
}
