//! Flux dump files: captured revolutions of one track on disk.
//!
//! # Layout
//!
//! All fields little-endian.
//!
//! | Field | Type | Notes |
//! |-------|------|-------|
//! | magic | `[u8; 4]` | `FLXD` |
//! | version | u32 | [`VERSION`] |
//! | capture id | `[u8; 16]` | UUID of the capture |
//! | tick_hz | f64 | sampling clock |
//! | cylinder | u8 | |
//! | head | u8 | |
//! | revolutions | u32 | at most [`MAX_REVOLUTIONS`] |
//!
//! followed by, for every revolution:
//!
//! | Field | Type |
//! |-------|------|
//! | index offset | u64 (ticks) |
//! | interval count | u32 |
//! | intervals | `count × u32` (ticks) |
//!
//! Structural problems (bad magic, zero intervals, absurd counts) come back as
//! `io::ErrorKind::InvalidData`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::flux::FluxRevolution;
use crate::options::MAX_REVOLUTIONS;

pub const MAGIC: &[u8; 4] = b"FLXD";
pub const VERSION: u32 = 1;
/// Refuse revolutions claiming more transitions than this.
pub const MAX_INTERVALS: u32 = 1 << 24;

#[derive(Debug, Clone, PartialEq)]
pub struct FluxDump {
    pub capture_id:  Uuid,
    pub tick_hz:     f64,
    pub cylinder:    u8,
    pub head:        u8,
    pub revolutions: Vec<FluxRevolution>,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl FluxDump {
    pub fn new(tick_hz: f64, cylinder: u8, head: u8, revolutions: Vec<FluxRevolution>) -> Self {
        Self { capture_id: Uuid::new_v4(), tick_hz, cylinder, head, revolutions }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        if self.revolutions.len() > MAX_REVOLUTIONS {
            return Err(invalid(format!("{} revolutions exceed the limit of {MAX_REVOLUTIONS}", self.revolutions.len())));
        }
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(VERSION)?;
        writer.write_all(self.capture_id.as_bytes())?;
        writer.write_f64::<LittleEndian>(self.tick_hz)?;
        writer.write_u8(self.cylinder)?;
        writer.write_u8(self.head)?;
        writer.write_u32::<LittleEndian>(self.revolutions.len() as u32)?;
        for rev in &self.revolutions {
            writer.write_u64::<LittleEndian>(rev.index_offset())?;
            writer.write_u32::<LittleEndian>(rev.len() as u32)?;
            for &t in rev.intervals() {
                writer.write_u32::<LittleEndian>(t)?;
            }
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid("not a flux dump: bad magic"));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(invalid(format!("unsupported dump version {version}")));
        }
        let mut id = [0u8; 16];
        reader.read_exact(&mut id)?;
        let tick_hz  = reader.read_f64::<LittleEndian>()?;
        let cylinder = reader.read_u8()?;
        let head     = reader.read_u8()?;
        let count    = reader.read_u32::<LittleEndian>()? as usize;
        if count > MAX_REVOLUTIONS {
            return Err(invalid(format!("{count} revolutions exceed the limit of {MAX_REVOLUTIONS}")));
        }

        let mut revolutions = Vec::with_capacity(count);
        for _ in 0..count {
            let index_offset = reader.read_u64::<LittleEndian>()?;
            let n = reader.read_u32::<LittleEndian>()?;
            if n > MAX_INTERVALS {
                return Err(invalid(format!("revolution claims {n} intervals")));
            }
            let mut intervals = vec![0u32; n as usize];
            reader.read_u32_into::<LittleEndian>(&mut intervals)?;
            let rev = FluxRevolution::new(intervals, tick_hz).map_err(|e| invalid(e.to_string()))?;
            revolutions.push(rev.with_index_offset(index_offset));
        }

        Ok(Self { capture_id: Uuid::from_bytes(id), tick_hz, cylinder, head, revolutions })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write(&mut w)?;
        w.flush()
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Self::read(BufReader::new(File::open(path)?))
    }
}
