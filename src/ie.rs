//! Q.931 and 1TR6 information elements.
//!
//! Only the handful of elements call setup needs are built and decoded:
//! numbers, channel identification, bearer capability / service indicator,
//! cause, call state and 1TR6 charging.
use crate::channel::CallParams;
use log::warn;

pub const IE_CAUSE: u8 = 0x08;
pub const IE_CALL_STATE: u8 = 0x14;
pub const IE_CHANNEL_ID: u8 = 0x18;
pub const IE_BEARER: u8 = 0x04;
pub const IE_FACILITY: u8 = 0x20;
pub const IE_CALLING: u8 = 0x6c;
pub const IE_CALLED: u8 = 0x70;

/// 1TR6 codeset 6.
pub const IE_SERVICE_IND: u8 = 0x01;
pub const IE_CHARGING: u8 = 0x02;

/// Numbering type unknown, ISDN numbering plan.
const NUMBER_PLAN: u8 = 0x81;

/// Channel identification: basic interface, any channel.
const ANY_CHANNEL: u8 = 0x83;

pub const CAUSE_NORMAL: u8 = 16;
pub const CAUSE_STATUS_ENQUIRY: u8 = 30;

/// One element found by [`Ies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ie<'a> {
    pub codeset: u8,
    pub id: u8,
    /// Contents, empty for single octet elements.
    pub data: &'a [u8],
}

/// Iterate the elements of a message, following codeset shifts.
pub struct Ies<'a> {
    bytes: &'a [u8],
    pos: usize,
    locked: u8,
    next: Option<u8>,
}

#[must_use]
pub fn iter(bytes: &[u8]) -> Ies<'_> {
    Ies {
        bytes,
        pos: 0,
        locked: 0,
        next: None,
    }
}

impl<'a> Iterator for Ies<'a> {
    type Item = Ie<'a>;

    fn next(&mut self) -> Option<Ie<'a>> {
        loop {
            let &id = self.bytes.get(self.pos)?;
            if id & 0xf0 == 0x90 {
                self.pos += 1;
                if id & 0x08 != 0 {
                    self.next = Some(id & 0x07);
                } else {
                    self.locked = id & 0x07;
                }
                continue;
            }
            let codeset = self.next.take().unwrap_or(self.locked);
            if id & 0x80 != 0 {
                self.pos += 1;
                return Some(Ie {
                    codeset,
                    id,
                    data: &[],
                });
            }
            let len = usize::from(*self.bytes.get(self.pos + 1)?);
            let start = self.pos + 2;
            let data = self.bytes.get(start..start + len)?;
            self.pos = start + len;
            return Some(Ie { codeset, id, data });
        }
    }
}

#[must_use]
pub fn find(bytes: &[u8], codeset: u8, id: u8) -> Option<&[u8]> {
    iter(bytes)
        .find(|ie| ie.codeset == codeset && ie.id == id)
        .map(|ie| ie.data)
}

/// Append an element. The length octet caps contents at 255 octets, the
/// rest is cut off.
pub fn put(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    let len = u8::try_from(data.len()).unwrap_or(u8::MAX);
    if usize::from(len) < data.len() {
        warn!("ie {id:#04x}: {} octets truncated to {len}", data.len());
    }
    out.push(id);
    out.push(len);
    out.extend_from_slice(&data[..usize::from(len)]);
}

/// Locking shift. Every element after this is in `codeset`.
pub fn put_shift(out: &mut Vec<u8>, codeset: u8) {
    out.push(0x90 | (codeset & 0x07));
}

pub fn put_number(out: &mut Vec<u8>, id: u8, digits: &str) {
    let mut data = vec![NUMBER_PLAN];
    data.extend(digits.bytes().map(|d| d & 0x7f));
    put(out, id, &data);
}

pub fn put_channel_any(out: &mut Vec<u8>) {
    put(out, IE_CHANNEL_ID, &[ANY_CHANNEL]);
}

#[must_use]
pub fn number(data: &[u8]) -> Option<String> {
    let &first = data.first()?;
    // Octet 3a (presentation) follows when the extension bit is clear.
    let skip = if first & 0x80 != 0 { 1 } else { 2 };
    let digits = data.get(skip..)?;
    Some(digits.iter().map(|&d| char::from(d & 0x7f)).collect())
}

/// B channel bitmask, 1 = B1, 2 = B2, 3 = any.
#[must_use]
pub fn channel_id(data: &[u8]) -> Option<u8> {
    data.first().map(|c| c & 0x03)
}

/// Cause value, skipping the optional recommendation octet.
#[must_use]
pub fn cause(data: &[u8]) -> Option<u8> {
    let &first = data.first()?;
    let at = if first & 0x80 != 0 { 1 } else { 2 };
    data.get(at).map(|c| c & 0x7f)
}

#[must_use]
pub fn cause_ie(cause: u8) -> [u8; 2] {
    // Location: user.
    [0x80, 0x80 | cause]
}

/// E-DSS1 bearer capability for a 1TR6 style service indicator.
#[must_use]
pub fn bearer_for_si(si1: u8) -> &'static [u8] {
    match si1 {
        // Speech.
        1 => &[0x80, 0x90, 0xa3],
        // 3.1 kHz audio.
        2 => &[0x90, 0x90, 0xa3],
        // Unrestricted digital information.
        _ => &[0x88, 0x90],
    }
}

#[must_use]
pub fn si_for_bearer(data: &[u8]) -> Option<u8> {
    data.first().map(|b| match b & 0x7f {
        0x00 => 1,
        0x10 => 2,
        _ => 7,
    })
}

/// 1TR6 charging information: accounting type, then decimal digits.
#[must_use]
pub fn charge(data: &[u8]) -> Option<u32> {
    let digits = data.get(1..)?;
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u32, |acc, &d| {
        let d = char::from(d & 0x7f).to_digit(10)?;
        acc.checked_mul(10)?.checked_add(d)
    })
}

/// 1TR6 SPV facilities: select, then activate.
#[must_use]
pub fn spv_facilities(para: &CallParams) -> [[u8; 4]; 2] {
    [[0, 0x41, para.si1, para.si2], [0, 0x0e, para.si1, para.si2]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts() {
        let mut b = vec![];
        put_number(&mut b, IE_CALLED, "123");
        // Non-locking shift applies to the next element only.
        b.push(0x9e);
        put(&mut b, IE_CHARGING, &[0x30, b'5']);
        put(&mut b, IE_CAUSE, &cause_ie(16));
        put_shift(&mut b, 6);
        put(&mut b, IE_SERVICE_IND, &[7, 0]);
        b.push(0xa1);
        let got: Vec<_> = iter(&b).map(|ie| (ie.codeset, ie.id)).collect();
        assert_eq!(
            got,
            vec![
                (0, IE_CALLED),
                (6, IE_CHARGING),
                (0, IE_CAUSE),
                (6, IE_SERVICE_IND),
                (6, 0xa1)
            ]
        );
        assert_eq!(find(&b, 6, IE_SERVICE_IND), Some(&[7u8, 0][..]));
        assert_eq!(find(&b, 0, IE_SERVICE_IND), None);
        assert_eq!(charge(find(&b, 6, IE_CHARGING).unwrap()), Some(5));
    }

    #[test]
    fn truncated_stops() {
        let b = [IE_CALLED, 5, 0x81, b'1'];
        assert_eq!(iter(&b).count(), 0);
        assert_eq!(iter(&[IE_CAUSE]).count(), 0);
    }

    #[test]
    fn oversized_element_cut() {
        let mut b = vec![];
        put(&mut b, IE_CALLED, &[b'1'; 300]);
        assert_eq!(b.len(), 257);
        assert_eq!(b[1], 255);
        assert_eq!(find(&b, 0, IE_CALLED).map(<[u8]>::len), Some(255));
    }

    #[test]
    fn numbers() {
        let mut b = vec![];
        put_number(&mut b, IE_CALLING, "0301234");
        assert_eq!(b[..3], [IE_CALLING, 8, 0x81]);
        assert_eq!(number(find(&b, 0, IE_CALLING).unwrap()).as_deref(), Some("0301234"));
        // With presentation octet.
        assert_eq!(number(&[0x01, 0x80, b'9', b'9']).as_deref(), Some("99"));
        assert_eq!(number(&[]), None);
    }

    #[test]
    fn bearer_map() {
        for si in [1, 2, 7] {
            assert_eq!(si_for_bearer(bearer_for_si(si)), Some(si));
        }
        // Anything unknown is data.
        assert_eq!(bearer_for_si(5), bearer_for_si(7));
    }

    #[test]
    fn causes() {
        assert_eq!(cause(&cause_ie(CAUSE_STATUS_ENQUIRY)), Some(30));
        assert_eq!(cause(&[0x00, 0x1f, 0x90]), Some(16));
        assert_eq!(cause(&[]), None);
        assert_eq!(channel_id(&[0x89]), Some(1));
    }

    #[test]
    fn charging() {
        assert_eq!(charge(&[0x31, b'1', b'2']), Some(12));
        assert_eq!(charge(&[0x31]), None);
        assert_eq!(charge(&[0x31, b'x']), None);
    }
}
