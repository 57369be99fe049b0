use crate::error::StorageError;
use crate::torrent::FileEntry;

/// A contiguous part of a global byte range that falls inside a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub file: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps the torrent's global byte space onto its files, laid end to end in order.
#[derive(Debug, Clone)]
pub struct FileLayout {
    /// Global offset at which each file starts
    starts: Vec<u64>,
    lengths: Vec<u64>,
    total: u64,
}

impl FileLayout {
    pub fn new(files: &[FileEntry]) -> Self {
        let mut starts = Vec::with_capacity(files.len());
        let mut total = 0;
        for file in files {
            starts.push(total);
            total += file.length;
        }
        Self {
            starts,
            lengths: files.iter().map(|file| file.length).collect(),
            total,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Spans covering `length` bytes starting at `offset`, in file order. Zero-length files
    /// never appear in the result.
    pub fn resolve(&self, offset: u64, length: u64) -> Result<Vec<Span>, StorageError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.total)
            .ok_or(StorageError::OutOfRange {
                offset,
                length,
                total: self.total,
            })?;

        // Last file starting at or before `offset`
        let first = self
            .starts
            .partition_point(|start| *start <= offset)
            .saturating_sub(1);

        let mut spans = Vec::new();
        let mut current = offset;
        for file in first..self.starts.len() {
            if current == end {
                break;
            }
            let file_end = self.starts[file] + self.lengths[file];
            if current >= file_end {
                continue;
            }
            let take = (end - current).min(file_end - current);
            spans.push(Span {
                file,
                file_offset: current - self.starts[file],
                length: take,
            });
            current += take;
        }
        Ok(spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(lengths: &[(&str, u64)]) -> FileLayout {
        let files: Vec<_> = lengths
            .iter()
            .map(|(path, length)| FileEntry::new(*path, *length))
            .collect();
        FileLayout::new(&files)
    }

    fn span(file: usize, file_offset: u64, length: u64) -> Span {
        Span {
            file,
            file_offset,
            length,
        }
    }

    #[test]
    fn range_spanning_three_files() {
        let layout = layout(&[("a", 80), ("b", 32), ("c", 32), ("d", 32)]);

        assert_eq!(
            layout.resolve(64, 64).unwrap(),
            vec![span(0, 64, 16), span(1, 0, 32), span(2, 0, 16)]
        );
    }

    #[test]
    fn range_within_one_file() {
        let layout = layout(&[("a", 80), ("b", 32)]);

        assert_eq!(layout.resolve(90, 10).unwrap(), vec![span(1, 10, 10)]);
        assert_eq!(layout.resolve(0, 80).unwrap(), vec![span(0, 0, 80)]);
    }

    #[test]
    fn range_starting_on_file_boundary() {
        let layout = layout(&[("a", 16), ("b", 16), ("c", 16)]);

        assert_eq!(
            layout.resolve(16, 32).unwrap(),
            vec![span(1, 0, 16), span(2, 0, 16)]
        );
    }

    #[test]
    fn empty_files_are_skipped() {
        let layout = layout(&[("a", 8), ("empty", 0), ("b", 8)]);

        assert_eq!(
            layout.resolve(4, 8).unwrap(),
            vec![span(0, 4, 4), span(2, 0, 4)]
        );
        assert_eq!(layout.resolve(8, 4).unwrap(), vec![span(2, 0, 4)]);
    }

    #[test]
    fn range_past_end_is_rejected() {
        let layout = layout(&[("a", 8)]);

        assert!(matches!(
            layout.resolve(4, 8),
            Err(StorageError::OutOfRange {
                offset: 4,
                length: 8,
                total: 8
            })
        ));
        assert!(layout.resolve(8, 0).unwrap().is_empty());
    }
}
