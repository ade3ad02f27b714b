//! Turning raw alignment files into a stream of read ids, one per alignment.
//!
//! Two line dialects are understood:
//!
//! * RUM output, `seq.<digits>[a|b]<tab>...`. A forward mate (`a`) directly followed by the
//!   reverse mate (`b`) of the same read is one alignment.
//! * Pre-counted lines, `<count> <read_id>`, as produced by `uniq -c`. Each line stands for
//!   `count` alignments of the read.

use crate::errors::AlnDistError;
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use itertools::Either;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Files making up a RUM output directory, in the order they are read.
pub const RUM_RUN_FILES: [&str; 2] = ["RUM_Unique", "RUM_NU"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MateSuffix {
    A,
    B,
}

/// One parsed input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccurrenceRecord {
    pub read_id: u64,
    pub mate_suffix: Option<MateSuffix>,
    /// Alignments this line stands for.
    pub occurrences: u64,
}

impl OccurrenceRecord {
    fn single(read_id: u64, mate_suffix: Option<MateSuffix>) -> Self {
        OccurrenceRecord {
            read_id,
            mate_suffix,
            occurrences: 1,
        }
    }
}

/// Parses one line (without its line terminator). `None` means the line is not recognized.
pub trait RecordParser {
    fn parse(&self, line: &str) -> Option<OccurrenceRecord>;
}

/// `seq.<digits>[a|b]...`
#[derive(Debug, Clone, Copy, Default)]
pub struct RumParser;

impl RecordParser for RumParser {
    fn parse(&self, line: &str) -> Option<OccurrenceRecord> {
        let rest = line.strip_prefix("seq.")?;
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let read_id = rest[..digits].parse().ok()?;
        let mate = match rest.as_bytes().get(digits) {
            Some(b'a') => Some(MateSuffix::A),
            Some(b'b') => Some(MateSuffix::B),
            Some(c) if c.is_ascii_whitespace() => None,
            None => None,
            Some(_) => return None,
        };
        Some(OccurrenceRecord::single(read_id, mate))
    }
}

/// `<count> <read_id>`
#[derive(Debug, Clone, Copy, Default)]
pub struct CountParser;

impl RecordParser for CountParser {
    fn parse(&self, line: &str) -> Option<OccurrenceRecord> {
        let mut fields = line.split_ascii_whitespace();
        let occurrences = fields.next()?.parse().ok()?;
        let read_id = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(OccurrenceRecord {
            read_id,
            mate_suffix: None,
            occurrences,
        })
    }
}

/// Picks the dialect per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoParser;

impl RecordParser for AutoParser {
    fn parse(&self, line: &str) -> Option<OccurrenceRecord> {
        if line.starts_with("seq.") {
            RumParser.parse(line)
        } else {
            CountParser.parse(line)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookback {
    None,
    SawA(u64),
}

/// Lazy, single-pass stream of read ids from one file.
///
/// Holds at most one record of lookback: a forward mate waiting to see whether the next line is
/// its reverse mate.
pub struct SequenceIdExtractor<R, P = AutoParser> {
    reader: R,
    parser: P,
    path: PathBuf,
    buf: String,
    line: u64,
    progress_interval: u64,
    lookback: Lookback,
    /// A record read while resolving the lookback, processed on the next call.
    stashed: Option<OccurrenceRecord>,
    /// Read id and number of copies still to emit for a pre-counted line.
    repeat: Option<(u64, u64)>,
    done: bool,
}

impl SequenceIdExtractor<Box<dyn BufRead + Send>, AutoParser> {
    /// Open `path`, decompressing it if it ends in `.gz`.
    pub fn open(path: &Path, progress_interval: u64) -> Result<Self> {
        let file = File::open(path).with_context(|| path.display().to_string())?;
        let reader: Box<dyn BufRead + Send> =
            if path.extension().is_some_and(|ext| ext == "gz") {
                Box::new(BufReader::new(MultiGzDecoder::new(file)))
            } else {
                Box::new(BufReader::new(file))
            };
        Ok(SequenceIdExtractor::new(reader, AutoParser, path)
            .with_progress_interval(progress_interval))
    }
}

impl<R: BufRead, P: RecordParser> SequenceIdExtractor<R, P> {
    /// `path` only labels errors and progress messages.
    pub fn new(reader: R, parser: P, path: impl Into<PathBuf>) -> Self {
        SequenceIdExtractor {
            reader,
            parser,
            path: path.into(),
            buf: String::new(),
            line: 0,
            progress_interval: 0,
            lookback: Lookback::None,
            stashed: None,
            repeat: None,
            done: false,
        }
    }

    pub fn with_progress_interval(mut self, progress_interval: u64) -> Self {
        self.progress_interval = progress_interval;
        self
    }

    /// Number of lines read so far.
    pub fn lines_read(&self) -> u64 {
        self.line
    }

    /// Next record in the file, skipping blank lines. `Ok(None)` at end of input.
    fn read_record(&mut self) -> Result<Option<OccurrenceRecord>> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_line(&mut self.buf)
                .with_context(|| {
                    format!("reading line {} of {}", self.line + 1, self.path.display())
                })?;
            if n == 0 {
                return Ok(None);
            }
            self.line += 1;
            if self.progress_interval > 0 && self.line % self.progress_interval == 0 {
                info!("{}: {} lines", self.path.display(), self.line);
            }

            let text = self.buf.trim_end_matches(['\n', '\r']);
            if text.is_empty() {
                continue;
            }
            return match self.parser.parse(text) {
                Some(record) => Ok(Some(record)),
                None => Err(AlnDistError::MalformedRecord {
                    path: self.path.clone(),
                    line: self.line,
                    text: text.to_string(),
                }
                .into()),
            };
        }
    }

    /// Next `(read_id, occurrences)` pair. A mate pair or an unpaired line is one occurrence, a
    /// pre-counted line is all of its occurrences at once.
    fn next_occurrence(&mut self) -> Result<Option<(u64, u64)>> {
        if let Some((read_id, remaining)) = self.repeat.take() {
            if remaining > 0 {
                return Ok(Some((read_id, remaining)));
            }
        }
        loop {
            let record = match self.stashed.take() {
                Some(record) => Some(record),
                None => self.read_record()?,
            };
            let Some(record) = record else {
                // A forward mate at the very end still counts.
                return Ok(match std::mem::replace(&mut self.lookback, Lookback::None) {
                    Lookback::SawA(read_id) => Some((read_id, 1)),
                    Lookback::None => None,
                });
            };

            match (self.lookback, record.mate_suffix) {
                (Lookback::SawA(pending), Some(MateSuffix::B)) if pending == record.read_id => {
                    self.lookback = Lookback::None;
                    return Ok(Some((pending, 1)));
                }
                (Lookback::SawA(pending), _) => {
                    self.lookback = Lookback::None;
                    self.stashed = Some(record);
                    return Ok(Some((pending, 1)));
                }
                (Lookback::None, Some(MateSuffix::A)) => {
                    self.lookback = Lookback::SawA(record.read_id);
                }
                (Lookback::None, _) if record.occurrences == 0 => {}
                (Lookback::None, _) => return Ok(Some((record.read_id, record.occurrences))),
            }
        }
    }

    fn next_id(&mut self) -> Result<Option<u64>> {
        if let Some((read_id, remaining)) = self.repeat {
            if remaining > 0 {
                self.repeat = Some((read_id, remaining - 1));
                return Ok(Some(read_id));
            }
            self.repeat = None;
        }
        Ok(self.next_occurrence()?.map(|(read_id, occurrences)| {
            self.repeat = Some((read_id, occurrences - 1));
            read_id
        }))
    }

    /// Stop after the first error or the end of input.
    fn fused<T>(&mut self, next: fn(&mut Self) -> Result<Option<T>>) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        match next(self) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    /// Yield `(read_id, occurrences)` pairs instead of one id per alignment, so a pre-counted
    /// line costs one step however large its count.
    pub fn occurrences(self) -> Occurrences<R, P> {
        Occurrences(self)
    }
}

impl<R: BufRead, P: RecordParser> Iterator for SequenceIdExtractor<R, P> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fused(Self::next_id)
    }
}

/// See [`SequenceIdExtractor::occurrences`].
pub struct Occurrences<R, P = AutoParser>(SequenceIdExtractor<R, P>);

impl<R: BufRead, P: RecordParser> Iterator for Occurrences<R, P> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.fused(SequenceIdExtractor::<R, P>::next_occurrence)
    }
}

/// The files holding one run's alignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInput {
    files: Vec<PathBuf>,
}

impl RunInput {
    /// A single file, or a RUM output directory containing `RUM_Unique` and `RUM_NU`.
    pub fn resolve(path: &Path) -> Result<Self> {
        if path.is_dir() {
            let files = RUM_RUN_FILES
                .iter()
                .map(|&file| {
                    let candidate = path.join(file);
                    if candidate.is_file() {
                        Ok(candidate)
                    } else {
                        Err(AlnDistError::MissingRunFile {
                            dir: path.to_path_buf(),
                            file,
                        })
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(RunInput { files })
        } else if path.is_file() {
            Ok(RunInput {
                files: vec![path.to_path_buf()],
            })
        } else {
            Err(AlnDistError::MissingRun(path.to_path_buf()).into())
        }
    }

    pub fn from_files(files: Vec<PathBuf>) -> Self {
        RunInput { files }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Read ids of every file in order. Mate pairs never span files.
    pub fn read_ids(&self, progress_interval: u64) -> impl Iterator<Item = Result<u64>> + '_ {
        self.extractors(progress_interval).flat_map(|extractor| match extractor {
            Ok(extractor) => Either::Left(extractor),
            Err(e) => Either::Right(std::iter::once(Err(e))),
        })
    }

    /// `(read_id, occurrences)` pairs of every file in order.
    pub fn occurrences(
        &self,
        progress_interval: u64,
    ) -> impl Iterator<Item = Result<(u64, u64)>> + '_ {
        self.extractors(progress_interval).flat_map(|extractor| match extractor {
            Ok(extractor) => Either::Left(extractor.occurrences()),
            Err(e) => Either::Right(std::iter::once(Err(e))),
        })
    }

    fn extractors(
        &self,
        progress_interval: u64,
    ) -> impl Iterator<Item = Result<SequenceIdExtractor<Box<dyn BufRead + Send>>>> + '_ {
        self.files.iter().map(move |path| {
            info!("Loading reads from {}", path.display());
            SequenceIdExtractor::open(path, progress_interval)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use pretty_assertions::assert_eq;
    use std::io::{Cursor, Write};

    fn ids(text: &str) -> Result<Vec<u64>> {
        SequenceIdExtractor::new(Cursor::new(text.to_string()), AutoParser, "test").collect()
    }

    #[test]
    fn test_rum_parser() {
        assert_eq!(
            RumParser.parse("seq.12a\tchr1\t100-150\t+"),
            Some(OccurrenceRecord::single(12, Some(MateSuffix::A)))
        );
        assert_eq!(
            RumParser.parse("seq.7b\tchr2"),
            Some(OccurrenceRecord::single(7, Some(MateSuffix::B)))
        );
        assert_eq!(
            RumParser.parse("seq.7\tchr2"),
            Some(OccurrenceRecord::single(7, None))
        );
        assert_eq!(RumParser.parse("seq.99"), Some(OccurrenceRecord::single(99, None)));
        assert_eq!(RumParser.parse("seq.a\tchr2"), None);
        assert_eq!(RumParser.parse("seq.12x\tchr2"), None);
        assert_eq!(RumParser.parse("read.12a"), None);
    }

    #[test]
    fn test_count_parser() {
        assert_eq!(
            CountParser.parse("      3 12"),
            Some(OccurrenceRecord {
                read_id: 12,
                mate_suffix: None,
                occurrences: 3
            })
        );
        assert_eq!(CountParser.parse("3"), None);
        assert_eq!(CountParser.parse("3 12 9"), None);
        assert_eq!(CountParser.parse("-3 12"), None);
        assert_eq!(CountParser.parse("three 12"), None);
    }

    #[test]
    fn test_mate_pair_collapses() -> Result<()> {
        assert_eq!(ids("seq.5a X\nseq.5b Y\n")?, vec![5]);
        Ok(())
    }

    #[test]
    fn test_lookback_transitions() -> Result<()> {
        let text = "seq.1a\tchr1\n\
                    seq.2b\tchr1\n\
                    seq.3a\tchr1\n\
                    seq.3a\tchr2\n\
                    seq.3b\tchr2\n\
                    seq.4\tchr1\n\
                    seq.4\tchr1\n\
                    seq.5b\tchr1\n\
                    seq.6a\tchr1\n";
        // 1 unpaired forward, 2 lone reverse, 3 forward then a pair, 4 twice, 5 lone reverse,
        // 6 forward pending at end of input.
        assert_eq!(ids(text)?, vec![1, 2, 3, 3, 4, 4, 5, 6]);
        Ok(())
    }

    #[test]
    fn test_pending_forward_then_count_line() -> Result<()> {
        assert_eq!(ids("seq.8a\n2 8\n")?, vec![8, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_counted_dialect() -> Result<()> {
        assert_eq!(ids("2 10\n1 3\n\n0 4\n3 10\n")?, vec![10, 10, 3, 10, 10, 10]);
        Ok(())
    }

    #[test]
    fn test_occurrences_keep_counts_whole() -> Result<()> {
        let text = "seq.8a\nseq.8b\nseq.9a\n5000000000 7\n0 4\nseq.2\n";
        let pairs: Vec<(u64, u64)> =
            SequenceIdExtractor::new(Cursor::new(text), AutoParser, "test")
                .occurrences()
                .collect::<Result<_>>()?;
        assert_eq!(pairs, vec![(8, 1), (9, 1), (7, 5_000_000_000), (2, 1)]);

        let max = format!("{} 3\n", u64::MAX);
        let pairs: Vec<(u64, u64)> =
            SequenceIdExtractor::new(Cursor::new(max), AutoParser, "test")
                .occurrences()
                .collect::<Result<_>>()?;
        assert_eq!(pairs, vec![(3, u64::MAX)]);
        Ok(())
    }

    #[test]
    fn test_occurrences_after_partial_expansion() -> Result<()> {
        let mut extractor =
            SequenceIdExtractor::new(Cursor::new("4 6\nseq.1\n"), AutoParser, "test");
        assert_eq!(extractor.next().transpose()?, Some(6));
        let rest: Vec<(u64, u64)> = extractor.occurrences().collect::<Result<_>>()?;
        assert_eq!(rest, vec![(6, 3), (1, 1)]);
        Ok(())
    }

    #[test]
    fn test_malformed_record_is_fatal() {
        let input = Cursor::new("seq.1\nseq.2\ngarbage\nseq.3\n");
        let mut extractor = SequenceIdExtractor::new(input, AutoParser, "run.txt");
        assert_eq!(extractor.next().unwrap().unwrap(), 1);
        assert_eq!(extractor.next().unwrap().unwrap(), 2);
        let err = extractor.next().unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<AlnDistError>(),
            Some(&AlnDistError::MalformedRecord {
                path: "run.txt".into(),
                line: 3,
                text: "garbage".into()
            })
        );
        assert!(extractor.next().is_none());
    }

    #[test]
    fn test_error_while_forward_pending() {
        let mut extractor =
            SequenceIdExtractor::new(Cursor::new("seq.1a\n???\n"), AutoParser, "run.txt");
        assert!(extractor.next().unwrap().is_err());
        assert!(extractor.next().is_none());
    }

    #[test]
    fn test_crlf_and_lines_read() -> Result<()> {
        let mut extractor =
            SequenceIdExtractor::new(Cursor::new("seq.1a\r\nseq.1b\r\n"), AutoParser, "crlf");
        assert_eq!(extractor.by_ref().collect::<Result<Vec<_>>>()?, vec![1]);
        assert_eq!(extractor.lines_read(), 2);
        Ok(())
    }

    #[test]
    fn test_run_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("RUM_Unique"), "seq.1a\tx\nseq.1b\tx\nseq.2\tx\n")?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"seq.2\ty\nseq.3a\ty\n")?;
        let nu = tmp.path().join("RUM_NU.gz");
        std::fs::write(&nu, gz.finish()?)?;

        // Directories need the uncompressed names.
        let err = RunInput::resolve(tmp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlnDistError>(),
            Some(AlnDistError::MissingRunFile { file: "RUM_NU", .. })
        ));

        let run = RunInput::from_files(vec![tmp.path().join("RUM_Unique"), nu]);
        let ids: Vec<u64> = run.read_ids(0).collect::<Result<_>>()?;
        assert_eq!(ids, vec![1, 2, 2, 3]);
        let pairs: Vec<(u64, u64)> = run.occurrences(0).collect::<Result<_>>()?;
        assert_eq!(pairs, vec![(1, 1), (2, 1), (2, 1), (3, 1)]);

        std::fs::copy(tmp.path().join("RUM_Unique"), tmp.path().join("RUM_NU"))?;
        let run = RunInput::resolve(tmp.path())?;
        assert_eq!(run.files().len(), 2);
        assert_eq!(run.read_ids(1).count(), 4);
        Ok(())
    }

    #[test]
    fn test_missing_run() {
        let err = RunInput::resolve(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlnDistError>(),
            Some(AlnDistError::MissingRun(_))
        ));
    }
}
