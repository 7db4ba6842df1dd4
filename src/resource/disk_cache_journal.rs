// Append-only text journal for the disk cache. The header pins the format, app version and value
// count; each following line records one state transition for a key. Replay rebuilds the index
// and recency order; a rewrite replaces the whole file atomically via `journal.tmp`.
use super::cache_key::CacheKey;
use crate::error::{CacheError, Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub(super) const JOURNAL_FILE: &str = "journal";
pub(super) const JOURNAL_TMP_FILE: &str = "journal.tmp";
pub(super) const JOURNAL_BACKUP_FILE: &str = "journal.bkp";

pub(super) const MAGIC: &str = "imagefetch.DiskCache";
pub(super) const FORMAT_VERSION: &str = "1";

const DIRTY: &str = "DIRTY";
const CLEAN: &str = "CLEAN";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct JournalHeader {
  pub app_version: u32,
  pub value_count: usize,
}

impl JournalHeader {
  fn lines(&self) -> Vec<String> {
    vec![
      MAGIC.to_string(),
      FORMAT_VERSION.to_string(),
      self.app_version.to_string(),
      self.value_count.to_string(),
      String::new(),
    ]
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Record {
  Dirty(CacheKey),
  Clean(CacheKey, Vec<u64>),
  Remove(CacheKey),
  Read(CacheKey),
}

impl Record {
  fn parse(line: &str, value_count: usize) -> std::result::Result<Record, String> {
    let mut parts = line.split(' ');
    let op = parts.next().unwrap_or_default();
    let key = parts
      .next()
      .ok_or_else(|| format!("missing key after {op}"))?
      .parse::<CacheKey>()
      .map_err(|err| err.to_string())?;
    let record = match op {
      DIRTY => Record::Dirty(key),
      REMOVE => Record::Remove(key),
      READ => Record::Read(key),
      CLEAN => {
        let lengths = parts
          .by_ref()
          .map(|raw| raw.parse::<u64>().map_err(|_| format!("invalid length {raw:?}")))
          .collect::<std::result::Result<Vec<_>, _>>()?;
        if lengths.len() != value_count {
          return Err(format!(
            "expected {value_count} lengths, found {}",
            lengths.len()
          ));
        }
        return Ok(Record::Clean(key, lengths));
      }
      other => return Err(format!("unknown operation {other:?}")),
    };
    if parts.next().is_some() {
      return Err(format!("trailing data after {op}"));
    }
    Ok(record)
  }

  fn write_line<W: Write>(&self, out: &mut W) -> io::Result<()> {
    match self {
      Record::Dirty(key) => writeln!(out, "{DIRTY} {key}"),
      Record::Remove(key) => writeln!(out, "{REMOVE} {key}"),
      Record::Read(key) => writeln!(out, "{READ} {key}"),
      Record::Clean(key, lengths) => {
        write!(out, "{CLEAN} {key}")?;
        for len in lengths {
          write!(out, " {len}")?;
        }
        writeln!(out)
      }
    }
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct ReplaySummary {
  pub records: usize,
  /// The last line was cut off mid-write; the journal should be rewritten.
  pub truncated_tail: bool,
}

/// Replays `path`, handing each record to `apply` in file order.
///
/// A header that differs from `expected` yields [`CacheError::VersionMismatch`]; a complete line
/// that does not parse yields [`CacheError::CorruptJournal`]. An unterminated final line is the
/// signature of a crash mid-append and is skipped.
pub(super) fn replay<F>(path: &Path, expected: JournalHeader, mut apply: F) -> Result<ReplaySummary>
where
  F: FnMut(Record),
{
  let mut reader = BufReader::new(File::open(path)?);
  let mut buf = Vec::new();

  let expected_lines = expected.lines();
  let mut found = Vec::with_capacity(expected_lines.len());
  for _ in 0..expected_lines.len() {
    buf.clear();
    if reader.read_until(b'\n', &mut buf)? == 0 {
      break;
    }
    found.push(String::from_utf8_lossy(trim_newline(&buf)).into_owned());
  }
  if found != expected_lines {
    return Err(Error::Cache(CacheError::VersionMismatch {
      expected: expected_lines,
      found,
    }));
  }

  let mut summary = ReplaySummary::default();
  let mut line_no = expected_lines.len();
  loop {
    buf.clear();
    if reader.read_until(b'\n', &mut buf)? == 0 {
      break;
    }
    line_no += 1;
    if buf.last() != Some(&b'\n') {
      summary.truncated_tail = true;
      break;
    }
    let line = std::str::from_utf8(trim_newline(&buf)).map_err(|_| CacheError::CorruptJournal {
      line: line_no,
      reason: "not valid UTF-8".to_string(),
    })?;
    let record = Record::parse(line, expected.value_count).map_err(|reason| {
      CacheError::CorruptJournal {
        line: line_no,
        reason,
      }
    })?;
    apply(record);
    summary.records += 1;
  }
  Ok(summary)
}

/// Reads the header of the journal at `path` without validating any records. `None` when the
/// file is missing or was not written by this cache format.
pub(super) fn read_header(path: &Path) -> io::Result<Option<JournalHeader>> {
  let file = match File::open(path) {
    Ok(file) => file,
    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(err) => return Err(err),
  };
  let mut lines = BufReader::new(file).lines();
  let mut next = || lines.next().transpose();
  if next()?.as_deref() != Some(MAGIC) || next()?.as_deref() != Some(FORMAT_VERSION) {
    return Ok(None);
  }
  let app_version = next()?.and_then(|v| v.parse::<u32>().ok());
  let value_count = next()?.and_then(|v| v.parse::<usize>().ok());
  Ok(match (app_version, value_count) {
    (Some(app_version), Some(value_count)) => Some(JournalHeader {
      app_version,
      value_count,
    }),
    _ => None,
  })
}

fn trim_newline(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

/// Writes a complete journal (header plus `records`) to `path`, replacing any existing file.
pub(super) fn write_journal<I>(path: &Path, header: JournalHeader, records: I) -> io::Result<()>
where
  I: IntoIterator<Item = Record>,
{
  let file = OpenOptions::new()
    .create(true)
    .write(true)
    .truncate(true)
    .open(path)?;
  let mut out = BufWriter::new(file);
  for line in header.lines() {
    writeln!(out, "{line}")?;
  }
  for record in records {
    record.write_line(&mut out)?;
  }
  out.flush()?;
  out.get_ref().sync_all()
}

/// Buffered appender for an existing journal.
#[derive(Debug)]
pub(super) struct JournalWriter {
  out: BufWriter<File>,
}

impl JournalWriter {
  pub(super) fn open_append(path: &Path) -> io::Result<Self> {
    let file = OpenOptions::new().append(true).open(path)?;
    Ok(Self {
      out: BufWriter::new(file),
    })
  }

  /// Buffers `record`; it reaches the file on the next [`flush`](Self::flush).
  pub(super) fn append(&mut self, record: &Record) -> io::Result<()> {
    record.write_line(&mut self.out)
  }

  pub(super) fn append_and_flush(&mut self, record: &Record) -> io::Result<()> {
    self.append(record)?;
    self.flush()
  }

  pub(super) fn flush(&mut self) -> io::Result<()> {
    self.out.flush()
  }

  pub(super) fn sync(&mut self) -> io::Result<()> {
    self.out.flush()?;
    self.out.get_ref().sync_data()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  const HEADER: JournalHeader = JournalHeader {
    app_version: 3,
    value_count: 2,
  };

  fn key(name: &str) -> CacheKey {
    CacheKey::for_source(name)
  }

  fn collect(path: &Path, header: JournalHeader) -> Result<(Vec<Record>, ReplaySummary)> {
    let mut records = Vec::new();
    let summary = replay(path, header, |r| records.push(r))?;
    Ok((records, summary))
  }

  #[test]
  fn written_journal_replays_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE);
    let written = vec![
      Record::Dirty(key("a")),
      Record::Clean(key("a"), vec![3, 4]),
      Record::Read(key("a")),
      Record::Remove(key("a")),
    ];
    write_journal(&path, HEADER, written.clone()).unwrap();

    let mut writer = JournalWriter::open_append(&path).unwrap();
    writer.append_and_flush(&Record::Dirty(key("b"))).unwrap();

    let (records, summary) = collect(&path, HEADER).unwrap();
    let mut expected = written;
    expected.push(Record::Dirty(key("b")));
    assert_eq!(records, expected);
    assert!(!summary.truncated_tail);
  }

  #[test]
  fn header_lines_are_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE);
    write_journal(&path, HEADER, Vec::new()).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text, "imagefetch.DiskCache\n1\n3\n2\n\n");
  }

  #[test]
  fn read_header_skips_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE);
    assert_eq!(read_header(&path).unwrap(), None);
    write_journal(&path, HEADER, vec![Record::Dirty(key("a"))]).unwrap();
    assert_eq!(read_header(&path).unwrap(), Some(HEADER));
    fs::write(&path, "libcore.io.DiskLruCache\n1\n3\n2\n\n").unwrap();
    assert_eq!(read_header(&path).unwrap(), None);
  }

  #[test]
  fn header_mismatch_is_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE);
    write_journal(&path, HEADER, Vec::new()).unwrap();
    let newer = JournalHeader {
      app_version: 4,
      ..HEADER
    };
    let err = collect(&path, newer).unwrap_err();
    assert!(matches!(
      err,
      Error::Cache(CacheError::VersionMismatch { .. })
    ));
  }

  #[test]
  fn malformed_line_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE);
    write_journal(&path, HEADER, Vec::new()).unwrap();
    let mut text = fs::read_to_string(&path).unwrap();
    text.push_str(&format!("CLEAN {} 12\n", key("a")));
    fs::write(&path, text).unwrap();
    let err = collect(&path, HEADER).unwrap_err();
    assert!(matches!(
      err,
      Error::Cache(CacheError::CorruptJournal { line: 6, .. })
    ));
  }

  #[test]
  fn unterminated_tail_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(JOURNAL_FILE);
    write_journal(&path, HEADER, vec![Record::Dirty(key("a"))]).unwrap();
    let mut text = fs::read_to_string(&path).unwrap();
    text.push_str("CLEAN 0123");
    fs::write(&path, text).unwrap();
    let (records, summary) = collect(&path, HEADER).unwrap();
    assert_eq!(records, vec![Record::Dirty(key("a"))]);
    assert!(summary.truncated_tail);
  }
}
