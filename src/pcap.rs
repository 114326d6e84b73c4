//! pcap writer for D channel traffic.
//!
//! Frames are written as LINKTYPE_LAPD, which wireshark decodes down to
//! Q.931. The format is simple enough that there's no need for libpcap.
//!
//! Files are always little endian.
//!
//! * https://wiki.wireshark.org/Development/LibpcapFileFormat
//! * https://www.tcpdump.org/linktypes.html
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Result;

// Little endian magic.
const MAGIC: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65535;
pub const LINKTYPE_LAPD: u32 = 203;

fn write_u16(mut w: impl Write, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32(mut w: impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Writes LAPD frames, buffered. A crash can lose the last few.
pub struct PcapWriter {
    w: BufWriter<Box<dyn Write + Send>>,
}

impl PcapWriter {
    /// Start a capture on any writer.
    pub fn new(w: Box<dyn Write + Send>) -> Result<Self> {
        let mut w = BufWriter::new(w);
        w.write_all(&MAGIC)?;
        write_u16(&mut w, VERSION_MAJOR)?;
        write_u16(&mut w, VERSION_MINOR)?;
        // GMT offset and timestamp accuracy.
        write_u32(&mut w, 0)?;
        write_u32(&mut w, 0)?;
        write_u32(&mut w, SNAPLEN)?;
        write_u32(&mut w, LINKTYPE_LAPD)?;
        Ok(Self { w })
    }

    /// Create a new pcap file. Fails if the file already exists.
    pub fn create(filename: impl AsRef<Path>) -> Result<Self> {
        let f = std::fs::File::options()
            .write(true)
            .create_new(true)
            .open(filename)?;
        Self::new(Box::new(f))
    }

    /// Add a frame, timestamped now.
    ///
    /// After a failed write the file is broken, the record is only
    /// partially there.
    pub fn write(&mut self, frame: &[u8]) -> Result<()> {
        let len = u32::try_from(frame.len())?;
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
        // TODO: pcap seconds run out in 2106, switch to pcapng before then.
        write_u32(&mut self.w, now.as_secs() as u32)?;
        write_u32(&mut self.w, now.subsec_micros())?;
        write_u32(&mut self.w, len)?;
        write_u32(&mut self.w, len)?;
        self.w.write_all(frame)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}

impl Drop for PcapWriter {
    fn drop(&mut self) {
        let _ = self.w.flush();
    }
}
