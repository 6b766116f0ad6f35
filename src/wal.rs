use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::Event;

/// One durable ledger entry. `lsn` strictly increases through the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: u64,
    pub event: Event,
}

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &WalRecord) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: WalRecord][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    last_lsn: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`. `last_lsn` is the highest
    /// sequence number already in the file (0 for a fresh log).
    pub fn open(path: &Path, last_lsn: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            last_lsn,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync. Used by tests only; production goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<u64> {
        let lsn = self.append_buffered(event)?;
        self.flush_sync()?;
        Ok(lsn)
    }

    /// Buffer one event under the next lsn. Nothing is durable until `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<u64> {
        let record = WalRecord {
            lsn: self.last_lsn + 1,
            event: event.clone(),
        };
        encode_record(&mut self.writer, &record)?;
        self.last_lsn = record.lsn;
        self.appends_since_compact += 1;
        Ok(record.lsn)
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_lsn(&self) -> u64 {
        self.last_lsn
    }

    /// Write a snapshot to the temp file, numbering records after `last_lsn`
    /// so sequence numbers are never reused. Returns the new last lsn.
    pub fn write_compact_file(path: &Path, events: &[Event], last_lsn: u64) -> io::Result<u64> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        let mut lsn = last_lsn;
        for event in events {
            lsn += 1;
            encode_record(
                &mut writer,
                &WalRecord {
                    lsn,
                    event: event.clone(),
                },
            )?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(lsn)
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self, last_lsn: u64) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.last_lsn = last_lsn;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let last = Self::write_compact_file(&self.path, events, self.last_lsn)?;
        self.swap_compact_file(last)
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records.
    /// Truncated/corrupt trailing entries, and anything after an lsn that
    /// fails to increase, are discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<WalRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records: Vec<WalRecord> = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            let record = match bincode::deserialize::<WalRecord>(&payload) {
                Ok(record) => record,
                Err(_) => break,
            };
            if let Some(prev) = records.last()
                && record.lsn <= prev.lsn
            {
                break;
            }
            records.push(record);
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConsultantSchedule, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn schedule_event(id: Ulid) -> Event {
        Event::ScheduleReplaced {
            schedule: ConsultantSchedule::new(id, "UTC"),
        }
    }

    fn events(records: &[WalRecord]) -> Vec<Event> {
        records.iter().map(|r| r.event.clone()).collect()
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let cid = Ulid::new();
        let written = vec![
            schedule_event(cid),
            Event::AbsenceReported {
                id: Ulid::new(),
                consultant_id: cid,
            },
        ];

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            assert_eq!(wal.append(&written[0]).unwrap(), 1);
            assert_eq!(wal.append(&written[1]).unwrap(), 2);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].lsn, 1);
        assert_eq!(replayed[1].lsn, 2);
        assert_eq!(events(&replayed), written);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_continues_lsn() {
        let path = tmp_path("reopen_lsn.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&schedule_event(Ulid::new())).unwrap();
        }
        let last = Wal::replay(&path).unwrap().last().unwrap().lsn;
        {
            let mut wal = Wal::open(&path, last).unwrap();
            assert_eq!(wal.append(&schedule_event(Ulid::new())).unwrap(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = schedule_event(Ulid::new());
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&event).unwrap();
        }

        // Partial length + some bytes of a second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event, event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let record = WalRecord {
            lsn: 1,
            event: Event::ConsultantRemoved { id: Ulid::new() },
        };
        {
            let payload = bincode::serialize(&record).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_non_increasing_lsn() {
        let path = tmp_path("lsn_regress.wal");
        let _ = fs::remove_file(&path);

        {
            let mut f = BufWriter::new(File::create(&path).unwrap());
            for lsn in [1, 2, 2, 3] {
                encode_record(
                    &mut f,
                    &WalRecord {
                        lsn,
                        event: schedule_event(Ulid::new()),
                    },
                )
                .unwrap();
            }
            f.flush().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.iter().map(|r| r.lsn).collect::<Vec<_>>(), vec![1, 2]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let cid = Ulid::new();
        let mut final_schedule = ConsultantSchedule::new(cid, "Europe/Berlin");
        final_schedule.buffer_minutes = 15;

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for i in 0..20u32 {
                let mut s = ConsultantSchedule::new(cid, "Europe/Berlin");
                s.buffer_minutes = i;
                wal.append(&Event::ScheduleReplaced { schedule: s }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![Event::ScheduleReplaced {
            schedule: final_schedule,
        }];
        {
            let mut wal = Wal::open(&path, 20).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.last_lsn(), 21);
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(events(&replayed), compacted);
        assert_eq!(replayed[0].lsn, 21);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let cid = Ulid::new();
        let compacted = vec![schedule_event(cid)];
        let blackout_schedule = {
            let mut s = ConsultantSchedule::new(cid, "UTC");
            s.insert_blackout(crate::model::Blackout {
                id: Ulid::new(),
                span: Span::new(1000, 2000),
                kind: crate::model::BlackoutKind::Block,
                label: None,
            });
            s
        };
        let new_event = Event::ScheduleReplaced {
            schedule: blackout_schedule,
        };

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&compacted[0]).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(&new_event).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].event, compacted[0]);
        assert_eq!(replayed[1].event, new_event);
        assert!(replayed[0].lsn < replayed[1].lsn);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let written: Vec<Event> = (0..5).map(|_| schedule_event(Ulid::new())).collect();

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for e in &written {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(events(&Wal::replay(&path).unwrap()), written);

        let _ = fs::remove_file(&path);
    }
}
