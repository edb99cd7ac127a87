use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use ahash::RandomState;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use super::{header::Slot, stats::StatsSnapshot};
use crate::{error::ReportIoError, serialize::serde_usize, util::num::kib};

/// One block that was still allocated when the report was taken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakEntry {
    pub slot: Slot,
    /// The payload pointer, as handed to the caller
    #[serde(with = "serde_usize")]
    pub address: *const (),
    pub size: usize,
    pub type_tag: Option<String>,
    pub file: Option<String>,
    pub line: u32,
}

/// Totals for one type tag, see [`LeakReport::by_tag`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagTotals {
    pub blocks: usize,
    pub bytes: usize,
}

/// The allocator counters plus, in diagnostic mode, every live block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub stats: StatsSnapshot,
    /// Whether `entries` is meaningful. Without diagnostics the allocator
    /// doesn't know where its blocks are.
    pub diagnostics: bool,
    pub entries: Vec<LeakEntry>,
}

impl LeakReport {
    pub fn has_leaks(&self) -> bool {
        self.stats.has_leaks()
    }

    /// Live blocks grouped by type tag. Untagged blocks are counted under
    /// `None`.
    pub fn by_tag(&self) -> HashMap<Option<&str>, TagTotals, RandomState> {
        let mut totals = HashMap::with_hasher(RandomState::new());
        for entry in &self.entries {
            let tag: &mut TagTotals = totals.entry(entry.type_tag.as_deref()).or_default();
            tag.blocks += 1;
            tag.bytes += entry.size;
        }
        totals
    }

    pub fn write_to_file<P>(&self, path: P) -> Result<(), ReportIoError>
    where
        P: AsRef<Path>,
    {
        let mut file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut file, self)?;
        file.flush()?;
        Ok(())
    }

    pub fn from_file<P>(path: P) -> Result<Self, ReportIoError>
    where
        P: AsRef<Path>,
    {
        let file = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(file)?)
    }
}

impl fmt::Display for LeakEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "address {:#x}, {} bytes ({}), allocated in: {}({})",
            self.address as usize,
            self.size,
            self.type_tag.as_deref().unwrap_or("untagged"),
            self.file.as_deref().unwrap_or("unknown"),
            self.line,
        )
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.stats;
        writeln!(f, "allocations: {}", stats.allocations_total)?;
        writeln!(f, "reallocations: {}", stats.reallocations_total)?;
        writeln!(f, "high water mark: {} KiB", kib(stats.high_water_mark))?;
        if !self.has_leaks() {
            return writeln!(f, "no leaks");
        }
        writeln!(
            f,
            "memory leak detected: {} bytes in {} blocks not released",
            stats.bytes_live, stats.allocations_live
        )?;
        if self.diagnostics {
            for entry in &self.entries {
                writeln!(f, "  {entry}")?;
            }
            writeln!(f, "dump complete ({} leaks)", self.entries.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(slot: Slot, size: usize, tag: Option<&str>) -> LeakEntry {
        LeakEntry {
            slot,
            address: (0x1000 + slot * 0x100) as *const (),
            size,
            type_tag: tag.map(str::to_owned),
            file: Some("src/main.rs".to_owned()),
            line: 10 + slot as u32,
        }
    }

    fn report() -> LeakReport {
        LeakReport {
            stats: StatsSnapshot {
                bytes_live: 56,
                high_water_mark: 4096,
                allocations_total: 9,
                allocations_live: 3,
                reallocations_total: 1,
            },
            diagnostics: true,
            entries: vec![
                entry(0, 16, Some("Mesh")),
                entry(2, 32, Some("Mesh")),
                entry(5, 8, None),
            ],
        }
    }

    #[test]
    fn by_tag_groups_entries() {
        let report = report();
        let totals = report.by_tag();
        assert_eq!(totals[&Some("Mesh")], TagTotals { blocks: 2, bytes: 48 });
        assert_eq!(totals[&None], TagTotals { blocks: 1, bytes: 8 });
    }

    #[test]
    fn display_lists_every_leak() {
        let text = report().to_string();
        assert!(text.contains("high water mark: 4 KiB"));
        assert!(text.contains("56 bytes in 3 blocks"));
        assert!(text.contains("address 0x1200, 32 bytes (Mesh), allocated in: src/main.rs(12)"));
        assert!(text.contains("(untagged)"));
        assert!(text.contains("dump complete (3 leaks)"));
    }

    #[test]
    fn clean_report_says_so() {
        let report = LeakReport {
            stats: StatsSnapshot::default(),
            diagnostics: false,
            entries: Vec::new(),
        };
        assert!(!report.has_leaks());
        assert!(report.to_string().ends_with("no leaks\n"));
    }

    #[test]
    fn survives_a_trip_through_a_file() {
        let path = std::env::temp_dir().join(format!("tagheap-report-{}.json", std::process::id()));
        let report = report();
        report.write_to_file(&path).unwrap();
        let read = LeakReport::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(read, report);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = LeakReport::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ReportIoError::Io(_)));
    }
}
