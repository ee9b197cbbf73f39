//! Turns a sequence-number range into the list of archive extents that
//! cover it.

use super::replay_index::{ReadOutcome, ReplayIndexReader, ReplayRecord};

/// A contiguous extent to stream from one archive recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingRange {
    pub recording_id: u32,
    pub begin_position: u64,
    pub length: u64,
    pub expected_message_count: u64,
}

/// Inclusive sequence bound. `sequence_number = None` with `sequence_index`
/// set means "latest in that index epoch".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceBound {
    pub sequence_index: u32,
    pub sequence_number: u64,
}

impl SequenceBound {
    fn le(&self, other: &SequenceBound) -> bool {
        (self.sequence_index, self.sequence_number) <= (other.sequence_index, other.sequence_number)
    }

    fn gt(&self, other: &SequenceBound) -> bool {
        (self.sequence_index, self.sequence_number) > (other.sequence_index, other.sequence_number)
    }
}

/// `end = None` means "stream to the newest record" (the `LATEST` sentinel).
pub struct ReplayQuery;

impl ReplayQuery {
    /// Scans `reader` from its oldest live record and produces the ordered,
    /// coalesced [`RecordingRange`] list covering `[begin, end]`.
    pub fn query(
        mut reader: ReplayIndexReader,
        begin: SequenceBound,
        end: Option<SequenceBound>,
    ) -> Vec<RecordingRange> {
        reader.seek_to_oldest();
        let mut ranges: Vec<RecordingRange> = Vec::new();
        let mut seen_sequence_numbers: Vec<u64> = Vec::new();

        loop {
            match reader.next() {
                ReadOutcome::Record(rec) => {
                    let rec_bound = SequenceBound {
                        sequence_index: rec.sequence_index,
                        sequence_number: rec.sequence_number,
                    };
                    if rec_bound.le(&begin) && rec_bound != begin {
                        continue;
                    }
                    if let Some(end) = end {
                        if rec_bound.gt(&end) {
                            break;
                        }
                    }
                    push_record(&mut ranges, &rec);
                    if !seen_sequence_numbers.contains(&rec.sequence_number) {
                        seen_sequence_numbers.push(rec.sequence_number);
                    }
                }
                ReadOutcome::Empty => break,
                ReadOutcome::Lapped => {
                    // The portion we lapped past is gone from the index;
                    // continue from wherever the cursor resynced to.
                    continue;
                }
            }
        }

        for r in &mut ranges {
            r.expected_message_count = seen_sequence_numbers.len() as u64;
        }
        ranges
    }

    /// Returns, for the highest observed `sequence_index`, the earliest
    /// still-live position per `recording_id` — used to prune archive
    /// recordings that are no longer reachable by any future replay.
    pub fn start_positions(mut reader: ReplayIndexReader) -> Vec<(u32, u64)> {
        reader.seek_to_oldest();
        let mut highest_index = 0u32;
        let mut earliest: Vec<(u32, u64)> = Vec::new();

        loop {
            match reader.next() {
                ReadOutcome::Record(rec) => {
                    if rec.sequence_index > highest_index {
                        highest_index = rec.sequence_index;
                        earliest.clear();
                    }
                    if rec.sequence_index == highest_index {
                        match earliest.iter_mut().find(|(id, _)| *id == rec.recording_id) {
                            Some((_, pos)) => {
                                if rec.stream_position < *pos {
                                    *pos = rec.stream_position;
                                }
                            }
                            None => earliest.push((rec.recording_id, rec.stream_position)),
                        }
                    }
                }
                ReadOutcome::Empty => break,
                ReadOutcome::Lapped => continue,
            }
        }
        earliest
    }
}

fn push_record(ranges: &mut Vec<RecordingRange>, rec: &ReplayRecord) {
    match ranges.last_mut() {
        Some(last) if last.recording_id == rec.recording_id => {
            last.length = (rec.stream_position + rec.length as u64) - last.begin_position;
        }
        _ => ranges.push(RecordingRange {
            recording_id: rec.recording_id,
            begin_position: rec.stream_position,
            length: rec.length as u64,
            expected_message_count: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::replay_index::ReplayIndexWriter;
    use tempfile::tempdir;

    fn bound(idx: u32, num: u64) -> SequenceBound {
        SequenceBound {
            sequence_index: idx,
            sequence_number: num,
        }
    }

    #[test]
    fn coalesces_same_recording_into_one_range() {
        let dir = tempdir().unwrap();
        let writer = ReplayIndexWriter::create(dir.path(), 1, "out", 16).unwrap();
        for i in 1..=5u64 {
            writer.append(ReplayRecord {
                stream_position: (i - 1) * 64,
                sequence_index: 0,
                sequence_number: i,
                recording_id: 7,
                length: 64,
            });
        }
        let ranges = ReplayQuery::query(writer.reader(), bound(0, 2), Some(bound(0, 4)));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].recording_id, 7);
        assert_eq!(ranges[0].begin_position, 64);
        assert_eq!(ranges[0].expected_message_count, 3);
    }

    #[test]
    fn splits_on_recording_id_change() {
        let dir = tempdir().unwrap();
        let writer = ReplayIndexWriter::create(dir.path(), 2, "out", 16).unwrap();
        writer.append(ReplayRecord {
            stream_position: 0,
            sequence_index: 0,
            sequence_number: 1,
            recording_id: 1,
            length: 10,
        });
        writer.append(ReplayRecord {
            stream_position: 10,
            sequence_index: 0,
            sequence_number: 2,
            recording_id: 2,
            length: 10,
        });
        let ranges = ReplayQuery::query(writer.reader(), bound(0, 1), None);
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn start_positions_only_considers_latest_sequence_index() {
        let dir = tempdir().unwrap();
        let writer = ReplayIndexWriter::create(dir.path(), 3, "out", 16).unwrap();
        writer.append(ReplayRecord {
            stream_position: 0,
            sequence_index: 0,
            sequence_number: 1,
            recording_id: 1,
            length: 10,
        });
        writer.append(ReplayRecord {
            stream_position: 100,
            sequence_index: 1,
            sequence_number: 1,
            recording_id: 2,
            length: 10,
        });
        let starts = ReplayQuery::start_positions(writer.reader());
        assert_eq!(starts, vec![(2, 100)]);
    }
}
