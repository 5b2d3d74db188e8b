use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame layout: `[u32 le: payload len][bincode payload][u32 le: crc32 of payload]`.
fn write_frame(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first (clean end or torn tail).
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact frame, or `None` at end of file or at the first torn/corrupt frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

/// Append-only lesson journal. Nothing reaches engine state without first landing here.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Buffer one record. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.out, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    /// Every intact record in order. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.path.with_extension("wal.snapshot")
    }

    /// Replace the journal with `snapshot`: write a sibling file, fsync, rename over, reopen.
    pub fn rewrite(&mut self, snapshot: &[Event]) -> io::Result<()> {
        let tmp = self.snapshot_path();
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for event in snapshot {
                write_frame(&mut out, event)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        // Anything still buffered belongs to records already in the snapshot.
        self.out.flush()?;
        fs::rename(&tmp, &self.path)?;
        self.out = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessond_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn published(tutor_id: Ulid, hour: u8) -> Event {
        Event::SlotsPublished {
            tutor_id,
            date: 20157,
            hours: vec![hour],
        }
    }

    #[test]
    fn records_survive_reopen() {
        let path = journal_path("reopen.wal");
        let tutor = Ulid::new();
        let events = vec![
            Event::TutorRegistered { id: tutor, hourly_rate: 4_000 },
            published(tutor, 10),
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = journal_path("torn.wal");
        let event = Event::TutorRegistered { id: Ulid::new(), hourly_rate: 1 };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&event).unwrap();
            wal.flush_sync().unwrap();
        }
        // Length word promising 64 bytes, then only 3 of them.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&64u32.to_le_bytes()).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = journal_path("bad_crc.wal");
        let good = Event::TutorRegistered { id: Ulid::new(), hourly_rate: 1 };
        let bad = published(Ulid::new(), 9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&good).unwrap();
            wal.flush_sync().unwrap();
        }
        let payload = bincode::serialize(&bad).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&payload).unwrap();
        f.write_all(&0xBAD0_C0DEu32.to_le_bytes()).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = journal_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn rewrite_shrinks_and_accepts_appends() {
        let path = journal_path("rewrite.wal");
        let tutor = Ulid::new();
        let registered = Event::TutorRegistered { id: tutor, hourly_rate: 3_000 };
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&registered).unwrap();
        for hour in 0..20 {
            wal.append_buffered(&published(tutor, hour)).unwrap();
            wal.append_buffered(&Event::SlotsWithdrawn {
                tutor_id: tutor,
                date: 20157,
                hours: vec![hour],
            })
            .unwrap();
        }
        wal.flush_sync().unwrap();
        let before = fs::metadata(&path).unwrap().len();

        wal.rewrite(std::slice::from_ref(&registered)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let next = published(tutor, 8);
        wal.append_buffered(&next).unwrap();
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![registered, next]);
    }
}
