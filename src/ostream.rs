//////////////////////////////////////////////////////////////
/// Output channel
///
/// One buffer shared by every instance. Each write appends a whole record under
/// the lock, so records from different producers never interleave and records
/// from one producer keep their emission order.
///
///     header   u32 little endian: producer id (bits 0..12), kind (12..16), payload size (16..32)
///     payload  `size` bytes, zero padded to a multiple of 4
///
/// A record that does not fit in the remaining space is dropped and counted.
/// The host drains after every instance has gone idle; draining empties the buffer.
///
use crate::error::{ForthError, Result};
use crate::kernel::align;
use parking_lot::Mutex;
use std::fmt::Write;

pub const MAX_PRODUCER: usize = 0xFFF;
const HEADER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Int = 1,
    Hex = 2,
    Float = 3,
    Str = 4,
}

impl Kind {
    fn from_bits(bits: u32) -> Option<Kind> {
        match bits {
            1 => Some(Kind::Int),
            2 => Some(Kind::Hex),
            3 => Some(Kind::Float),
            4 => Some(Kind::Str),
            _ => None,
        }
    }
}

/// A decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub producer: usize,
    pub kind: Kind,
    pub data: Vec<u8>,
}

impl Record {
    /// Render the payload the way the console shows it
    pub fn text(&self) -> String {
        let word = |d: &[u8]| -> [u8; 4] {
            let mut w = [0u8; 4];
            for (i, b) in d.iter().take(4).enumerate() {
                w[i] = *b;
            }
            w
        };
        match self.kind {
            Kind::Int => format!("{} ", i32::from_le_bytes(word(&self.data))),
            Kind::Hex => format!("{:x} ", i32::from_le_bytes(word(&self.data))),
            Kind::Float => format!("{} ", f32::from_le_bytes(word(&self.data))),
            Kind::Str => String::from_utf8_lossy(&self.data).into_owned(),
        }
    }
}

struct Obuf {
    buf: Vec<u8>,
    dropped: usize,
}

/// The shared tagged-record buffer
pub struct OutputChannel {
    state: Mutex<Obuf>,
    capacity: usize,
}

impl OutputChannel {
    pub fn new(capacity: usize) -> OutputChannel {
        OutputChannel {
            state: Mutex::new(Obuf {
                buf: Vec::with_capacity(capacity),
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Append one record atomically, or drop it if the buffer cannot take it
    pub fn write(&self, producer: usize, kind: Kind, payload: &[u8]) -> Result<()> {
        let size = payload.len();
        let need = HEADER + align(size);
        let mut obuf = self.state.lock();
        if size > u16::MAX as usize || obuf.buf.len() + need > self.capacity {
            obuf.dropped += 1;
            return Err(ForthError::OutputChannelOverflow { size: need });
        }
        let header = (producer & MAX_PRODUCER) as u32 | (kind as u32) << 12 | (size as u32) << 16;
        obuf.buf.extend_from_slice(&header.to_le_bytes());
        obuf.buf.extend_from_slice(payload);
        let padded = obuf.buf.len() + align(size) - size;
        obuf.buf.resize(padded, 0);
        Ok(())
    }

    pub fn write_int(&self, producer: usize, n: i32) -> Result<()> {
        self.write(producer, Kind::Int, &n.to_le_bytes())
    }

    pub fn write_hex(&self, producer: usize, n: i32) -> Result<()> {
        self.write(producer, Kind::Hex, &n.to_le_bytes())
    }

    pub fn write_float(&self, producer: usize, n: f32) -> Result<()> {
        self.write(producer, Kind::Float, &n.to_le_bytes())
    }

    pub fn write_str(&self, producer: usize, s: &str) -> Result<()> {
        self.write(producer, Kind::Str, s.as_bytes())
    }

    /// Decode everything written so far and reset the write cursor
    pub fn drain(&self) -> Vec<Record> {
        let mut obuf = self.state.lock();
        let records = decode(&obuf.buf);
        obuf.buf.clear();
        records
    }

    /// Records dropped for lack of space since the channel was created
    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    /// Size of the buffer in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Walk a raw buffer, stopping at the first malformed header
pub fn decode(buf: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut at = 0;
    while at + HEADER <= buf.len() {
        let header = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let producer = (header & MAX_PRODUCER as u32) as usize;
        let size = (header >> 16) as usize;
        let Some(kind) = Kind::from_bits((header >> 12) & 0xF) else {
            break;
        };
        let start = at + HEADER;
        let Some(data) = buf.get(start..start + size) else {
            break;
        };
        records.push(Record {
            producer,
            kind,
            data: data.to_vec(),
        });
        at = start + align(size);
    }
    records
}

/// Turn drained records into console text. With `tag` set, each change of
/// producer starts a line prefixed by the producer id.
///
pub fn render(records: &[Record], tag: bool) -> String {
    let mut out = String::new();
    let mut last = None;
    for r in records {
        if tag && last != Some(r.producer) {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            let _ = write!(out, "[{}] ", r.producer);
            last = Some(r.producer);
        }
        out.push_str(&r.text());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_record_layout() {
        let ch = OutputChannel::new(64);
        ch.write_str(5, "hi!").unwrap();
        assert_eq!(ch.state.lock().buf.len(), 8); // header plus 3 bytes padded to 4
        ch.write_int(5, 9).unwrap();
        assert_eq!(ch.state.lock().buf.len(), 16);
        let records = ch.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, Kind::Str);
        assert_eq!(records[0].producer, 5);
        assert_eq!(records[0].text(), "hi!");
        assert_eq!(records[1].text(), "9 ");
        assert!(ch.drain().is_empty());
    }

    #[test]
    fn test_header_bits() {
        let ch = OutputChannel::new(64);
        ch.write_hex(0xABC, 255).unwrap();
        let state = ch.state.lock();
        let header = u32::from_le_bytes([state.buf[0], state.buf[1], state.buf[2], state.buf[3]]);
        assert_eq!(header & 0xFFF, 0xABC);
        assert_eq!((header >> 12) & 0xF, Kind::Hex as u32);
        assert_eq!(header >> 16, 4);
    }

    #[test]
    fn test_kinds_render() {
        let ch = OutputChannel::new(128);
        ch.write_int(0, -3).unwrap();
        ch.write_hex(0, 255).unwrap();
        ch.write_float(0, 2.5).unwrap();
        ch.write_str(0, "\n").unwrap();
        assert_eq!(render(&ch.drain(), false), "-3 ff 2.5 \n");
    }

    #[test]
    fn test_overflow_drops_record() {
        let ch = OutputChannel::new(16);
        ch.write_int(0, 1).unwrap();
        let err = ch.write_str(0, "too long").unwrap_err();
        assert!(matches!(err, ForthError::OutputChannelOverflow { size: 12 }));
        assert!(!err.is_fatal());
        assert_eq!(ch.dropped(), 1);
        ch.write_int(0, 2).unwrap(); // a smaller record still fits
        let texts: Vec<String> = ch.drain().iter().map(Record::text).collect();
        assert_eq!(texts, vec!["1 ", "2 "]);
    }

    #[test]
    fn test_render_tags_producers() {
        let records = vec![
            Record { producer: 0, kind: Kind::Int, data: 1i32.to_le_bytes().to_vec() },
            Record { producer: 0, kind: Kind::Int, data: 2i32.to_le_bytes().to_vec() },
            Record { producer: 3, kind: Kind::Str, data: b"x".to_vec() },
        ];
        assert_eq!(render(&records, true), "[0] 1 2 \n[3] x");
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let ch = Arc::new(OutputChannel::new(64 * 1024));
        let handles: Vec<_> = (0..4)
            .map(|id| {
                let ch = Arc::clone(&ch);
                thread::spawn(move || {
                    for n in 0..200 {
                        ch.write_int(id, n).unwrap();
                        ch.write_str(id, "abcde").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let records = ch.drain();
        assert_eq!(records.len(), 4 * 400);
        for id in 0..4 {
            let mine: Vec<&Record> = records.iter().filter(|r| r.producer == id).collect();
            for (n, pair) in mine.chunks(2).enumerate() {
                assert_eq!(pair[0].text(), format!("{n} "));
                assert_eq!(pair[1].text(), "abcde");
            }
        }
    }
}
