use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::WalRecord;

/// Encode one record as `[u32: len][bincode payload][u32: crc32]`.
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

/// Append-only write-ahead log of commit records.
///
/// Format per entry: `[u32: len][bincode: WalRecord][u32: crc32]`.
/// The length prefix plus CRC means a crash mid-write leaves a
/// truncated tail that replay silently discards.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one record and fsync. Tests only — the engine goes through
    /// `append_buffered` + `flush_sync` so concurrent commits share a sync.
    #[cfg(test)]
    pub fn append(&mut self, record: &WalRecord) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer one record without flushing. Call `flush_sync` once per
    /// batch to durably commit everything buffered so far.
    pub fn append_buffered(&mut self, record: &WalRecord) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a compacted WAL (normally a single snapshot record) to a
    /// temp file and fsync it. Slow I/O phase — runs before the swap.
    pub fn write_compact_file(path: &Path, records: &[WalRecord]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomically rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call. Tests only.
    #[cfg(test)]
    pub fn compact(&mut self, records: &[WalRecord]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk. Stops at the first truncated or
    /// corrupt entry; everything before it is returned.
    pub fn replay(path: &Path) -> io::Result<Vec<WalRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

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
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<WalRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("greenbox_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn opening_commit(opens_at: Option<Ms>) -> WalRecord {
        WalRecord::Commit(Commit {
            at: 100,
            actor: Actor::system(),
            change: Change::OpeningChanged { opens_at },
            audit: Vec::new(),
            notices: Vec::new(),
        })
    }

    fn provision_record(ids: &[BoxId]) -> WalRecord {
        WalRecord::Commit(Commit {
            at: 50,
            actor: Actor::system(),
            change: Change::Provisioned {
                boxes: ids
                    .iter()
                    .map(|&id| PlanterBox {
                        id,
                        name: format!("Box {id}"),
                        greenhouse: "Kronen".into(),
                        state: BoxState::Available,
                        reserved_label: None,
                        updated_at: 50,
                    })
                    .collect(),
            },
            audit: Vec::new(),
            notices: Vec::new(),
        })
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let records = vec![provision_record(&[1, 2]), opening_commit(Some(9000))];

        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, records);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_truncated_tail() {
        let path = tmp_path("truncated.wal");
        let _ = fs::remove_file(&path);

        let record = provision_record(&[1]);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&record).unwrap();
        }

        // Garbage bytes simulating a crash mid-append.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![record]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let _ = fs::remove_file(&path);

        let payload = bincode::serialize(&opening_commit(None)).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_replays() {
        let path = tmp_path("compact.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&provision_record(&[1, 2, 3])).unwrap();
            for i in 0..20 {
                wal.append(&opening_commit(Some(i))).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = WalRecord::Snapshot(Snapshot {
            boxes: vec![PlanterBox {
                id: 1,
                name: "Box 1".into(),
                greenhouse: "Kronen".into(),
                state: BoxState::Available,
                reserved_label: None,
                updated_at: 50,
            }],
            registrations: Vec::new(),
            waitlist: Vec::new(),
            audit: Vec::new(),
            notices: Vec::new(),
            opens_at: Some(19),
        });

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&snapshot)).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_after_compact() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let snapshot = WalRecord::Snapshot(Snapshot {
            boxes: Vec::new(),
            registrations: Vec::new(),
            waitlist: Vec::new(),
            audit: Vec::new(),
            notices: Vec::new(),
            opens_at: None,
        });
        let tail = opening_commit(Some(777));

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&opening_commit(None)).unwrap();
            wal.compact(std::slice::from_ref(&snapshot)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&tail).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![snapshot, tail]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_flush_together() {
        let path = tmp_path("buffered.wal");
        let _ = fs::remove_file(&path);

        let records: Vec<WalRecord> = (0..5).map(|i| opening_commit(Some(i))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append_buffered(r).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), records);
        let _ = fs::remove_file(&path);
    }
}
