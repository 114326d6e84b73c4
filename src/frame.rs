//! LAPD (Q.921) and LAPB (X.75) frame headers.
//!
//! Only the address and control fields are handled here. The information
//! field stays in the [`crate::buffer::Buf`] it arrived in, behind the
//! header length returned by [`Frame::parse`].
use anyhow::{Error, Result};

/// Call control signalling.
pub const SAPI_CALLCTRL: u8 = 0;
/// Layer 2 management (TEI assignment).
pub const SAPI_TEIMGR: u8 = 63;
pub const TEI_BROADCAST: u8 = 127;

/// X.75 single link addresses.
pub const LAPB_A: u8 = 0x03;
pub const LAPB_B: u8 = 0x01;

// Unnumbered frames. Ending in 11.
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABM: u8 = 0b001_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABME: u8 = 0b011_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_UI: u8 = 0b000_0_00_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_DISC: u8 = 0b010_0_00_11;
pub const CONTROL_DM: u8 = 0b0000_1111;
pub const CONTROL_UA: u8 = 0b0110_0011;
pub const CONTROL_FRMR: u8 = 0b1000_0111;

// Supervisory frames. Ending in 01.
pub const CONTROL_RR: u8 = 0b0000_0001;
pub const CONTROL_RNR: u8 = 0b0000_0101;
pub const CONTROL_REJ: u8 = 0b0000_1001;

// Masks.
pub const CONTROL_POLL: u8 = 0b0001_0000;
pub const NR_MASK: u8 = 0b1110_0000;
pub const TYPE_MASK: u8 = 0b0000_0011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// Two octet Q.921 address.
    Lapd { sapi: u8, tei: u8, cr: bool },
    /// One octet X.75 address, [`LAPB_A`] or [`LAPB_B`].
    Lapb(u8),
}

impl Address {
    fn len(&self) -> usize {
        match self {
            Address::Lapd { .. } => 2,
            Address::Lapb(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I { ns: u8, nr: u8, poll: bool },
    Rr { nr: u8, pf: bool },
    Rnr { nr: u8, pf: bool },
    Rej { nr: u8, pf: bool },
    Sabm { poll: bool },
    Sabme { poll: bool },
    Ua { fin: bool },
    Disc { poll: bool },
    Dm { fin: bool },
    Frmr { fin: bool },
    Ui { poll: bool },
}

impl FrameType {
    /// Poll or final bit, whichever this frame carries.
    #[must_use]
    pub fn pf(&self) -> bool {
        match *self {
            FrameType::I { poll, .. } => poll,
            FrameType::Rr { pf, .. } | FrameType::Rnr { pf, .. } | FrameType::Rej { pf, .. } => pf,
            FrameType::Sabm { poll }
            | FrameType::Sabme { poll }
            | FrameType::Disc { poll }
            | FrameType::Ui { poll } => poll,
            FrameType::Ua { fin } | FrameType::Dm { fin } | FrameType::Frmr { fin } => fin,
        }
    }

    /// N(R) of I and supervisory frames.
    #[must_use]
    pub fn nr(&self) -> Option<u8> {
        match *self {
            FrameType::I { nr, .. }
            | FrameType::Rr { nr, .. }
            | FrameType::Rnr { nr, .. }
            | FrameType::Rej { nr, .. } => Some(nr),
            _ => None,
        }
    }

    fn control_len(&self, extended: bool) -> usize {
        match self {
            FrameType::I { .. }
            | FrameType::Rr { .. }
            | FrameType::Rnr { .. }
            | FrameType::Rej { .. }
                if extended =>
            {
                2
            }
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub addr: Address,
    pub kind: FrameType,
}

fn pf_bit(b: bool) -> u8 {
    if b {
        CONTROL_POLL
    } else {
        0
    }
}

impl Frame {
    #[must_use]
    pub fn header_len(&self, extended: bool) -> usize {
        self.addr.len() + self.kind.control_len(extended)
    }

    /// Serialize address and control field.
    ///
    /// `extended` selects modulo 128 sequence numbering for I and
    /// supervisory frames.
    #[must_use]
    pub fn serialize(&self, extended: bool) -> Vec<u8> {
        let mut ret = Vec::with_capacity(4);
        match self.addr {
            Address::Lapd { sapi, tei, cr } => {
                ret.push((sapi << 2) | if cr { 2 } else { 0 });
                ret.push((tei << 1) | 1);
            }
            Address::Lapb(a) => ret.push(a),
        }
        let supervisory = |ret: &mut Vec<u8>, ctl: u8, nr: u8, pf: bool| {
            if extended {
                ret.push(ctl);
                ret.push((nr << 1) | u8::from(pf));
            } else {
                ret.push(ctl | pf_bit(pf) | ((nr << 5) & NR_MASK));
            }
        };
        match self.kind {
            FrameType::Rr { nr, pf } => supervisory(&mut ret, CONTROL_RR, nr, pf),
            FrameType::Rnr { nr, pf } => supervisory(&mut ret, CONTROL_RNR, nr, pf),
            FrameType::Rej { nr, pf } => supervisory(&mut ret, CONTROL_REJ, nr, pf),
            FrameType::I { ns, nr, poll } => {
                if extended {
                    ret.push(ns << 1);
                    ret.push((nr << 1) | u8::from(poll));
                } else {
                    ret.push(pf_bit(poll) | ((nr << 5) & NR_MASK) | ((ns << 1) & 0b0000_1110));
                }
            }
            FrameType::Sabm { poll } => ret.push(CONTROL_SABM | pf_bit(poll)),
            FrameType::Sabme { poll } => ret.push(CONTROL_SABME | pf_bit(poll)),
            FrameType::Ua { fin } => ret.push(CONTROL_UA | pf_bit(fin)),
            FrameType::Disc { poll } => ret.push(CONTROL_DISC | pf_bit(poll)),
            FrameType::Dm { fin } => ret.push(CONTROL_DM | pf_bit(fin)),
            FrameType::Frmr { fin } => ret.push(CONTROL_FRMR | pf_bit(fin)),
            FrameType::Ui { poll } => ret.push(CONTROL_UI | pf_bit(poll)),
        }
        ret
    }

    /// Parse the header of a received frame.
    ///
    /// Returns the frame and the offset of the information field.
    pub fn parse(bytes: &[u8], extended: bool, lapb: bool) -> Result<(Self, usize)> {
        let addr = if lapb {
            match bytes.first() {
                Some(&a) if a == LAPB_A || a == LAPB_B => Address::Lapb(a),
                Some(a) => return Err(Error::msg(format!("invalid X.75 address {a:#04x}"))),
                None => return Err(Error::msg("empty frame")),
            }
        } else {
            if bytes.len() < 2 {
                return Err(Error::msg(format!("frame too short: {} bytes", bytes.len())));
            }
            if bytes[0] & 1 != 0 || bytes[1] & 1 == 0 {
                return Err(Error::msg(format!(
                    "invalid address extension bits {:#04x} {:#04x}",
                    bytes[0], bytes[1]
                )));
            }
            Address::Lapd {
                sapi: bytes[0] >> 2,
                cr: bytes[0] & 2 != 0,
                tei: bytes[1] >> 1,
            }
        };
        let off = addr.len();
        let Some(&control) = bytes.get(off) else {
            return Err(Error::msg("frame has no control field"));
        };
        let second = || {
            bytes
                .get(off + 1)
                .copied()
                .ok_or_else(|| Error::msg("frame too short for extended control"))
        };
        let kind = match control & TYPE_MASK {
            0 | 2 => {
                if extended {
                    let c2 = second()?;
                    FrameType::I {
                        ns: control >> 1,
                        nr: c2 >> 1,
                        poll: c2 & 1 != 0,
                    }
                } else {
                    FrameType::I {
                        ns: (control >> 1) & 7,
                        nr: (control >> 5) & 7,
                        poll: control & CONTROL_POLL != 0,
                    }
                }
            }
            1 => {
                let (ctl, nr, pf) = if extended {
                    let c2 = second()?;
                    (control, c2 >> 1, c2 & 1 != 0)
                } else {
                    (
                        control & !NR_MASK & !CONTROL_POLL,
                        (control >> 5) & 7,
                        control & CONTROL_POLL != 0,
                    )
                };
                match ctl {
                    CONTROL_RR => FrameType::Rr { nr, pf },
                    CONTROL_RNR => FrameType::Rnr { nr, pf },
                    CONTROL_REJ => FrameType::Rej { nr, pf },
                    c => return Err(Error::msg(format!("unsupported supervisory frame {c:#04x}"))),
                }
            }
            _ => {
                let pf = control & CONTROL_POLL != 0;
                match control & !CONTROL_POLL {
                    CONTROL_SABME => FrameType::Sabme { poll: pf },
                    CONTROL_SABM => FrameType::Sabm { poll: pf },
                    CONTROL_UA => FrameType::Ua { fin: pf },
                    CONTROL_DISC => FrameType::Disc { poll: pf },
                    CONTROL_DM => FrameType::Dm { fin: pf },
                    CONTROL_FRMR => FrameType::Frmr { fin: pf },
                    CONTROL_UI => FrameType::Ui { poll: pf },
                    c => return Err(Error::msg(format!("control {c:#010b} not implemented"))),
                }
            }
        };
        let frame = Frame { addr, kind };
        Ok((frame, frame.header_len(extended)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lapd_sabme() -> Result<()> {
        let f = Frame {
            addr: Address::Lapd {
                sapi: SAPI_CALLCTRL,
                tei: 64,
                cr: false,
            },
            kind: FrameType::Sabme { poll: true },
        };
        assert_eq!(f.serialize(true), vec![0x00, 0x81, 0x7f]);
        assert_eq!(Frame::parse(&[0x00, 0x81, 0x7f], true, false)?, (f, 3));
        Ok(())
    }

    #[test]
    fn lapd_extended_iframe() -> Result<()> {
        // Network to user: C/R set on commands.
        let bytes = [0x02, 0x81, 0x04, 0x07, 0x08, 0x01];
        let (f, off) = Frame::parse(&bytes, true, false)?;
        assert_eq!(
            f,
            Frame {
                addr: Address::Lapd {
                    sapi: 0,
                    tei: 64,
                    cr: true
                },
                kind: FrameType::I {
                    ns: 2,
                    nr: 3,
                    poll: true
                },
            }
        );
        assert_eq!(off, 4);
        assert_eq!(&f.serialize(true)[..], &bytes[..4]);
        Ok(())
    }

    #[test]
    fn lapd_extended_supervisory() -> Result<()> {
        let f = Frame {
            addr: Address::Lapd {
                sapi: 0,
                tei: 64,
                cr: true,
            },
            kind: FrameType::Rej { nr: 100, pf: true },
        };
        let b = f.serialize(true);
        assert_eq!(b, vec![0x02, 0x81, CONTROL_REJ, 201]);
        assert_eq!(Frame::parse(&b, true, false)?.0, f);
        assert_eq!(f.kind.nr(), Some(100));
        assert!(f.kind.pf());
        Ok(())
    }

    #[test]
    fn lapb_modulo8() -> Result<()> {
        let f = Frame {
            addr: Address::Lapb(LAPB_A),
            kind: FrameType::I {
                ns: 5,
                nr: 6,
                poll: false,
            },
        };
        let b = f.serialize(false);
        assert_eq!(b, vec![0x03, 0b1100_1010]);
        assert_eq!(Frame::parse(&b, false, true)?, (f, 2));

        let (rr, _) = Frame::parse(&[0x01, 0b1011_0001], false, true)?;
        assert_eq!(rr.kind, FrameType::Rr { nr: 5, pf: true });
        let (sabm, _) = Frame::parse(&[0x03, 0x3f], false, true)?;
        assert_eq!(sabm.kind, FrameType::Sabm { poll: true });
        Ok(())
    }

    #[test]
    fn tei_request_ui() -> Result<()> {
        let (f, off) = Frame::parse(&[0xfc, 0xff, 0x03, 0x0f], true, false)?;
        assert_eq!(
            f.addr,
            Address::Lapd {
                sapi: SAPI_TEIMGR,
                tei: TEI_BROADCAST,
                cr: false
            }
        );
        assert_eq!(f.kind, FrameType::Ui { poll: false });
        assert_eq!(off, 3);
        Ok(())
    }

    #[test]
    fn bad_frames() {
        assert!(Frame::parse(&[], true, false).is_err());
        assert!(Frame::parse(&[0x00], true, false).is_err());
        // EA bit set in the first octet.
        assert!(Frame::parse(&[0x01, 0x81, 0x7f], true, false).is_err());
        // No control field.
        assert!(Frame::parse(&[0x00, 0x81], true, false).is_err());
        // Extended I frame missing its second control octet.
        assert!(Frame::parse(&[0x00, 0x81, 0x00], true, false).is_err());
        // SREJ is not supported.
        assert!(Frame::parse(&[0x00, 0x81, 0x0d, 0x00], true, false).is_err());
        assert!(Frame::parse(&[0x07, 0x3f], false, true).is_err());
    }
}
