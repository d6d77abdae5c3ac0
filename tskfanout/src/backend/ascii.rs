//! The ASCII backend: `"<key> <value> <time>\n"`, to stdout or an optionally
//! compressed file. No batching, no retention — every record is written and flushed
//! immediately, the way the teacher's `net::buffer::Buffer::egress` drains eagerly
//! rather than holding data back.

use super::{Backend, BackendId, BulkResolution, KpState};
use crate::error::{Result, TimeseriesError};
use crate::kp::KeyPackage;
use crate::logging::{info, Logger};
use clap::{Arg, Command};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Stdout, Write};
use std::path::Path;

const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Where ASCII records are written.
enum Sink {
    Stdout(Stdout),
    Plain(BufWriter<File>),
    Gzip(Box<GzEncoder<BufWriter<File>>>),
    Xz(Box<xz2::write::XzEncoder<BufWriter<File>>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(w) => w.write(buf),
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
            Sink::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(w) => w.flush(),
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
            Sink::Xz(w) => w.flush(),
        }
    }
}

fn open_sink(path: &str, level: u32) -> Result<Sink> {
    let file = File::create(path).map_err(TimeseriesError::Io)?;
    let writer = BufWriter::new(file);

    let sink = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("gz") => Sink::Gzip(Box::new(GzEncoder::new(writer, Compression::new(level)))),
        Some("xz") => Sink::Xz(Box::new(xz2::write::XzEncoder::new(writer, level))),
        _ => Sink::Plain(writer),
    };

    Ok(sink)
}

pub struct AsciiBackend {
    enabled: bool,
    sink: Option<Sink>,
    /// Timestamp passed to `set_bulk_init`, carried through to each `set_bulk_by_id`
    /// call since ASCII has no batch format of its own — it just repeats `set_single`.
    bulk_time: u32,
    log: Logger,
}

impl AsciiBackend {
    pub fn new(log: Logger) -> AsciiBackend {
        AsciiBackend { enabled: false, sink: None, bulk_time: 0, log }
    }

    fn write_record(&mut self, key: &str, value: u64, time: u32) -> Result<()> {
        let sink = self.sink.get_or_insert_with(|| Sink::Stdout(io::stdout()));
        writeln!(sink, "{key} {value} {time}").map_err(TimeseriesError::Io)?;
        sink.flush().map_err(TimeseriesError::Io)
    }
}

impl Backend for AsciiBackend {
    fn id(&self) -> BackendId {
        BackendId::Ascii
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn init(&mut self, argv: &[String]) -> Result<()> {
        let matches = Command::new("ascii")
            .no_binary_name(true)
            .arg(Arg::new("level").short('c'))
            .arg(Arg::new("file").short('f'))
            .try_get_matches_from(argv)
            .map_err(|e| TimeseriesError::Config(format!("ascii backend: {e}")))?;

        let level: u32 = match matches.get_one::<String>("level") {
            Some(s) => s
                .parse()
                .map_err(|_| TimeseriesError::Config(format!("ascii backend: invalid -c level `{s}`")))?,
            None => DEFAULT_COMPRESSION_LEVEL,
        };
        if level > 9 {
            return Err(TimeseriesError::Config(format!("ascii backend: -c level {level} out of range 0-9")));
        }

        self.sink = match matches.get_one::<String>("file") {
            Some(path) => Some(open_sink(path, level)?),
            None => None,
        };

        self.enabled = true;
        info!(self.log, "ascii backend enabled"; "file" => matches.get_one::<String>("file").cloned());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush().map_err(TimeseriesError::Io)?;
        }
        self.enabled = false;
        Ok(())
    }

    fn resolve_key(&mut self, key: &str) -> Result<Vec<u8>> {
        Ok(key.as_bytes().to_vec())
    }

    fn resolve_key_bulk(&mut self, keys: &[&str]) -> Result<(Vec<Vec<u8>>, BulkResolution)> {
        let ids = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        Ok((ids, BulkResolution { ids: false }))
    }

    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<()> {
        self.write_record(key, value, time)
    }

    fn set_single_by_id(&mut self, id: &[u8], value: u64, time: u32) -> Result<()> {
        let key = std::str::from_utf8(id)
            .map_err(|_| TimeseriesError::Resolve { backend: "ascii", key: String::from_utf8_lossy(id).into_owned() })?;
        self.write_record(key, value, time)
    }

    fn set_bulk_init(&mut self, _key_cnt: usize, time: u32) -> Result<()> {
        self.bulk_time = time;
        Ok(())
    }

    fn set_bulk_by_id(&mut self, id: &[u8], value: u64) -> Result<()> {
        self.set_single_by_id(id, value, self.bulk_time)
    }

    fn kp_init(&mut self) -> Option<KpState> {
        None
    }

    fn kp_free(&mut self, _state: Option<KpState>) {}

    fn kp_flush(&mut self, kp: &mut KeyPackage, time: u32) -> Result<()> {
        // ASCII has no faster path than repeated singles (per the design doc).
        let rows: Vec<(String, u64)> =
            kp.iter_enabled().map(|(_, row)| (row.key().to_string(), row.value())).collect();
        for (key, value) in rows {
            self.write_record(&key, value, time)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn writes_the_spec_worked_example() {
        let dir = std::env::temp_dir().join(format!("tskfanout-ascii-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.txt");

        let mut backend = AsciiBackend::new(crate::logging::discard());
        backend.init(&["-f".into(), path.to_str().unwrap().into()]).unwrap();
        backend.set_single("x", 7, 1234567890).unwrap();
        backend.shutdown().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "x 7 1234567890\n");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn resolve_key_is_identity() {
        let mut backend = AsciiBackend::new(crate::logging::discard());
        assert_eq!(backend.resolve_key("hello").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn bulk_writes_behave_as_repeated_singles() {
        let dir = std::env::temp_dir().join(format!("tskfanout-ascii-bulk-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.txt");

        let mut backend = AsciiBackend::new(crate::logging::discard());
        backend.init(&["-f".into(), path.to_str().unwrap().into()]).unwrap();
        backend.set_bulk_init(2, 42).unwrap();
        backend.set_bulk_by_id(b"a", 1).unwrap();
        backend.set_bulk_by_id(b"b", 2).unwrap();
        backend.shutdown().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a 1 42\nb 2 42\n");

        fs::remove_dir_all(&dir).unwrap();
    }
}
