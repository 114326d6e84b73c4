//! ISDN basic rate driver core.
//!
//! Call control, the D-channel signalling stack (Q.921 LAPD with TEI
//! management, Q.931 E-DSS1 or 1TR6) and the B-channel data stack (X.75,
//! HDLC or transparent) for cards with two B channels each. Layer 1 is
//! whatever implements [`Phy`]; a KISS-framed serial link comes with the
//! crate, both blocking ([`SerialPhy`]) and on tokio ([`r#async`]).
//!
//! Everything hangs off a [`Driver`]: commands and layer 1 indications go
//! in, status events, received data and layer 1 requests come out.
pub mod buffer;
pub mod callc;
pub mod channel;
pub mod config;
pub mod driver;
pub mod frame;
pub mod fsm;
pub mod ie;
pub mod l2;
pub mod l3;
pub mod lc;
pub mod pcap;
pub mod serial;
pub mod tei;
pub mod timer;

pub mod r#async;

pub use callc::DialString;
pub use channel::{L1Mode, Status, StatusEvent};
pub use config::{BProto, Config, DProtocol};
pub use driver::{Command, Driver, L1Chan, PhInd, Phy};
pub use pcap::PcapWriter;
pub use serial::{SerialPhy, SerialReader};
