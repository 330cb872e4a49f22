//! External (spill-to-disk) sort for keyed byte payloads.
//!
//! # Responsibility
//! - Accept `(key, value)` pairs in any order under a memory budget.
//! - Spill stable-sorted batches to temporary files once the budget is
//!   exceeded, then merge every run into one ascending stream.
//!
//! # Invariants
//! - Output order is ascending by key, stable for equal keys, duplicates
//!   preserved; identical for any budget.
//! - Spill files are unlinked when their handle drops, on every path.

use log::debug;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub type SortResult<T> = Result<T, SortError>;

#[derive(Debug)]
pub enum SortError {
    Io(io::Error),
    /// Spill file content does not match the record framing.
    Corrupt(String),
}

impl Display for SortError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "spill file io error: {err}"),
            Self::Corrupt(message) => write!(f, "corrupt spill run: {message}"),
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<io::Error> for SortError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

type Entry = (String, Vec<u8>);

/// Sorter accumulating entries in memory up to `budget_bytes`.
#[derive(Debug)]
pub struct ExternalSorter {
    budget_bytes: usize,
    spill_dir: Option<PathBuf>,
    buffer: Vec<Entry>,
    buffered_bytes: usize,
    runs: Vec<File>,
}

impl ExternalSorter {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            spill_dir: None,
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
        }
    }

    /// Places spill runs under `dir` instead of the system temp directory.
    pub fn with_spill_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.spill_dir = dir;
        self
    }

    pub fn push(&mut self, key: String, value: Vec<u8>) -> SortResult<()> {
        self.buffered_bytes += key.len() + value.len();
        self.buffer.push((key, value));
        if self.buffered_bytes > self.budget_bytes {
            self.spill()?;
        }
        Ok(())
    }

    /// Number of runs written to disk so far.
    pub fn spill_count(&self) -> usize {
        self.runs.len()
    }

    fn spill(&mut self) -> SortResult<()> {
        let mut batch = std::mem::take(&mut self.buffer);
        let bytes = std::mem::replace(&mut self.buffered_bytes, 0);
        batch.sort_by(|a, b| a.0.cmp(&b.0));

        let mut file = match &self.spill_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        {
            let mut writer = BufWriter::new(&mut file);
            for (key, value) in &batch {
                write_frame(&mut writer, key.as_bytes())?;
                write_frame(&mut writer, value)?;
            }
            writer.flush()?;
        }
        file.seek(SeekFrom::Start(0))?;
        self.runs.push(file);
        debug!(
            "event=sort_spill module=serial status=ok run={} entries={} bytes={}",
            self.runs.len(),
            batch.len(),
            bytes
        );
        Ok(())
    }

    /// Merges every run and the in-memory tail into one ascending stream.
    pub fn finish(mut self) -> SortResult<SortedStream> {
        let mut tail = std::mem::take(&mut self.buffer);
        tail.sort_by(|a, b| a.0.cmp(&b.0));

        let mut sources: Vec<RunSource> = self
            .runs
            .drain(..)
            .map(|file| RunSource::Spilled(BufReader::new(file)))
            .collect();
        sources.push(RunSource::Memory(tail.into_iter()));

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (run, source) in sources.iter_mut().enumerate() {
            if let Some((key, value)) = source.next_entry()? {
                heap.push(Reverse(HeapEntry { key, value, run }));
            }
        }
        Ok(SortedStream { sources, heap })
    }
}

fn write_frame(writer: &mut impl Write, bytes: &[u8]) -> SortResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| SortError::Corrupt(format!("entry of {} bytes is too large", bytes.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Reads one length-prefixed frame; `None` on clean end of run.
fn read_frame(reader: &mut impl Read) -> SortResult<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    reader
        .read_exact(&mut bytes)
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => SortError::Corrupt("truncated frame".to_string()),
            _ => SortError::Io(err),
        })?;
    Ok(Some(bytes))
}

enum RunSource {
    Spilled(BufReader<File>),
    Memory(std::vec::IntoIter<Entry>),
}

impl RunSource {
    fn next_entry(&mut self) -> SortResult<Option<Entry>> {
        match self {
            Self::Memory(entries) => Ok(entries.next()),
            Self::Spilled(reader) => {
                let Some(key) = read_frame(reader)? else {
                    return Ok(None);
                };
                let key = String::from_utf8(key)
                    .map_err(|_| SortError::Corrupt("key is not utf-8".to_string()))?;
                let value = read_frame(reader)?
                    .ok_or_else(|| SortError::Corrupt(format!("missing value for key `{key}`")))?;
                Ok(Some((key, value)))
            }
        }
    }
}

struct HeapEntry {
    key: String,
    value: Vec<u8>,
    run: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Runs are chronological, so breaking key ties by run keeps the merge
    // stable.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.run.cmp(&other.run))
    }
}

/// Ascending merged stream; owns the spill files until dropped.
pub struct SortedStream {
    sources: Vec<RunSource>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl Iterator for SortedStream {
    type Item = SortResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(entry) = self.heap.pop()?;
        match self.sources[entry.run].next_entry() {
            Ok(Some((key, value))) => self.heap.push(Reverse(HeapEntry {
                key,
                value,
                run: entry.run,
            })),
            Ok(None) => {}
            Err(err) => {
                self.heap.clear();
                return Some(Err(err));
            }
        }
        Some(Ok((entry.key, entry.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::ExternalSorter;

    fn shuffled_keys() -> Vec<String> {
        (0..100).map(|i| format!("{:02}", (i * 37) % 100)).collect()
    }

    fn collect(sorter: ExternalSorter) -> Vec<(String, Vec<u8>)> {
        sorter
            .finish()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn spilled_sort_matches_in_memory_sort() {
        let mut in_memory = ExternalSorter::new(usize::MAX);
        let mut spilling = ExternalSorter::new(200);
        for key in shuffled_keys() {
            let value = format!("value-{key}").into_bytes();
            in_memory.push(key.clone(), value.clone()).unwrap();
            spilling.push(key, value).unwrap();
        }
        assert_eq!(in_memory.spill_count(), 0);
        assert!(spilling.spill_count() >= 4);

        let expected = collect(in_memory);
        let actual = collect(spilling);
        assert_eq!(actual, expected);
        let keys: Vec<_> = actual.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys.first(), Some(&"00"));
        assert_eq!(keys.last(), Some(&"99"));
        assert_eq!(keys.len(), 100);
    }

    #[test]
    fn equal_keys_keep_insertion_order_across_runs() {
        let mut sorter = ExternalSorter::new(0);
        for tag in 0..5u8 {
            sorter.push("same".to_string(), vec![tag]).unwrap();
        }
        let values: Vec<_> = collect(sorter).into_iter().map(|(_, value)| value[0]).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_and_single_inputs() {
        assert!(collect(ExternalSorter::new(16)).is_empty());

        let mut sorter = ExternalSorter::new(0);
        sorter.push("only".to_string(), b"x".to_vec()).unwrap();
        assert_eq!(collect(sorter), vec![("only".to_string(), b"x".to_vec())]);
    }
}
