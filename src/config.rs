//! Driver configuration.

/// D-channel signalling protocol of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DProtocol {
    /// Q.931 / ETS 300 102 (EDSS1).
    Ets,
    /// German national 1TR6.
    Tr6,
}

/// B-channel layer 2 protocol, selected per channel with `SetL2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BProto {
    /// X.75 single link procedure with I frames.
    X75,
    /// Raw HDLC frames.
    Hdlc,
    /// Transparent octet stream.
    Transparent,
}

impl BProto {
    /// Map the isdn4linux `ISDN_PROTO_L2_*` numbers.
    #[must_use]
    pub fn from_l2(n: u32) -> Option<Self> {
        match n {
            0 => Some(BProto::X75),
            3 => Some(BProto::Hdlc),
            4 => Some(BProto::Transparent),
            _ => None,
        }
    }
}

/// Data link parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct L2Params {
    /// Modulo 128 sequence numbers instead of modulo 8.
    pub extended: bool,
    /// Maximum number of unacknowledged I frames (k).
    pub window: u8,
    pub t200: u64,
    pub t203: u64,
    pub n200: u32,
}

impl L2Params {
    #[must_use]
    pub fn modulus(&self) -> u8 {
        if self.extended {
            128
        } else {
            8
        }
    }
}

/// Link connection timers, in ms.
#[derive(Debug, Clone, PartialEq)]
pub struct LcTimings {
    /// Guard while waiting for layer 1 to come up.
    pub activate_guard: u64,
    /// Settling time between layer 1 up and layer 2 establishment.
    pub settle: u64,
    /// Guard while waiting for layer 2 establishment.
    pub establish_guard: u64,
}

/// Debug mask bits, see [`Config::debug`].
pub const DEBUG_CALLC: u32 = 1;
pub const DEBUG_LC: u32 = 2;
pub const DEBUG_L2: u32 = 4;
pub const DEBUG_L3: u32 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of cards. Each card has two B channels.
    pub cards: usize,
    pub protocol: DProtocol,
    /// Fixed TEI, or None for automatic assignment.
    pub tei: Option<u8>,
    /// TEI request retransmission timer and retry count.
    pub t202: u64,
    pub n202: u32,
    pub d_l2: L2Params,
    pub b_l2: L2Params,
    pub lc: LcTimings,
    pub pool_buffers: usize,
    pub pool_buffer_size: usize,
    /// B-channel protocol a channel starts out with.
    pub l2_protocol: BProto,
    /// Initial debug mask for all channels.
    pub debug: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cards: 1,
            protocol: DProtocol::Ets,
            tei: None,
            t202: 2000,
            n202: 3,
            d_l2: L2Params {
                extended: true,
                window: 1,
                t200: 1000,
                t203: 10000,
                n200: 3,
            },
            b_l2: L2Params {
                extended: false,
                window: 7,
                t200: 1000,
                t203: 10000,
                n200: 3,
            },
            lc: LcTimings {
                activate_guard: 1000,
                settle: 40,
                establish_guard: 5000,
            },
            pool_buffers: 64,
            pool_buffer_size: 2048,
            l2_protocol: BProto::X75,
            debug: 0,
        }
    }
}
