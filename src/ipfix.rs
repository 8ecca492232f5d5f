//! IPFIX packet encoding for PSKReporter.
//!
//! Layout of one packet, big-endian throughout:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | header: 0x000A | length | export_time | seq | obs_domain      |  16 bytes
//! +--------------------------------------------------------------+
//! | [descriptors: receiver 0x9992, sender 0x64AF, sender 0x62A7]  |  optional
//! +--------------------------------------------------------------+
//! | receiver record 0x9992 (callsign, locator, program, antenna)   |
//! +--------------------------------------------------------------+
//! | sender record 0x64AF / 0x62A7 ...                             |  0..n
//! +--------------------------------------------------------------+
//! ```
//!
//! Every record is padded to a 4-byte boundary and its length patched after
//! padding. The header length is patched last.

/// IPFIX protocol version.
pub const IPFIX_VERSION: u16 = 0x000A;

/// Size of the packet header.
pub const HEADER_LEN: usize = 16;

/// Largest UDP payload PSKReporter accepts.
pub const MAX_UDP_PAYLOAD: usize = 1342;

/// Packets stop taking sender records once they reach this size.
pub const PACKET_BUDGET: usize = MAX_UDP_PAYLOAD - 100;

/// Template id of the receiver-info record.
pub const RECEIVER_TEMPLATE: u16 = 0x9992;

/// Template id of sender records carrying a locator.
pub const SENDER_WITH_LOCATOR_TEMPLATE: u16 = 0x64AF;

/// Template id of sender records without a locator.
pub const SENDER_WITHOUT_LOCATOR_TEMPLATE: u16 = 0x62A7;

/// Options template for receiverCallsign, receiverLocator,
/// decodingSoftware and antennaInformation.
pub const RECEIVER_DESCRIPTOR: [u8; 44] = [
    0x00, 0x03, 0x00, 0x2C, 0x99, 0x92, 0x00, 0x04, 0x00, 0x00, //
    0x80, 0x02, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x04, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x08, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x09, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x00, 0x00,
];

/// Template for senderCallsign, frequency, sNR, mode, senderLocator,
/// informationSource and flowStartSeconds.
pub const SENDER_WITH_LOCATOR_DESCRIPTOR: [u8; 60] = [
    0x00, 0x02, 0x00, 0x3C, 0x64, 0xAF, 0x00, 0x07, //
    0x80, 0x01, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x05, 0x00, 0x04, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x0A, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x03, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x0B, 0x00, 0x01, 0x00, 0x00, 0x76, 0x8F, //
    0x00, 0x96, 0x00, 0x04,
];

/// Same as [`SENDER_WITH_LOCATOR_DESCRIPTOR`] minus senderLocator.
pub const SENDER_WITHOUT_LOCATOR_DESCRIPTOR: [u8; 52] = [
    0x00, 0x02, 0x00, 0x34, 0x62, 0xA7, 0x00, 0x06, //
    0x80, 0x01, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x05, 0x00, 0x04, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x0A, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
    0x80, 0x0B, 0x00, 0x01, 0x00, 0x00, 0x76, 0x8F, //
    0x00, 0x96, 0x00, 0x04,
];

/// informationSource value for automatically extracted reports.
const INFO_SOURCE_AUTOMATIC: u8 = 0x01;

/// The receiving station, sent once per packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverInfo {
    pub callsign: String,
    pub locator: String,
    pub program: String,
    pub antenna: String,
}

/// One sender record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub callsign: String,
    /// Frequency in Hz; truncated to 32 bits on the wire.
    pub frequency: u64,
    pub snr: i32,
    pub mode: String,
    /// Empty selects the without-locator template.
    pub locator: String,
    /// Decode time in Unix seconds.
    pub flow_start: u32,
}

/// Per-packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub export_time: u32,
    pub sequence: u32,
    pub observation_domain: u32,
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u8::MAX as usize - 1);
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[..len]);
}

/// Pad `record` to a 4-byte boundary and write its length at bytes [2..4].
fn seal_record(mut record: Vec<u8>) -> Vec<u8> {
    while record.len() % 4 != 0 {
        record.push(0);
    }
    let len = record.len() as u16;
    record[2..4].copy_from_slice(&len.to_be_bytes());
    record
}

/// Encode the receiver-info record.
pub fn encode_receiver_record(info: &ReceiverInfo) -> Vec<u8> {
    let mut rec = Vec::with_capacity(64);
    rec.extend_from_slice(&RECEIVER_TEMPLATE.to_be_bytes());
    rec.extend_from_slice(&[0, 0]);
    put_string(&mut rec, &info.callsign);
    put_string(&mut rec, &info.locator);
    put_string(&mut rec, &info.program);
    put_string(&mut rec, &info.antenna);
    seal_record(rec)
}

/// Encode one sender record.
pub fn encode_sender_record(report: &SenderReport) -> Vec<u8> {
    let template = if report.locator.is_empty() {
        SENDER_WITHOUT_LOCATOR_TEMPLATE
    } else {
        SENDER_WITH_LOCATOR_TEMPLATE
    };

    let mut rec = Vec::with_capacity(48);
    rec.extend_from_slice(&template.to_be_bytes());
    rec.extend_from_slice(&[0, 0]);
    put_string(&mut rec, &report.callsign);
    rec.extend_from_slice(&(report.frequency as u32).to_be_bytes());
    rec.push(report.snr.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8);
    put_string(&mut rec, &report.mode);
    if !report.locator.is_empty() {
        put_string(&mut rec, &report.locator);
    }
    rec.push(INFO_SOURCE_AUTOMATIC);
    rec.extend_from_slice(&report.flow_start.to_be_bytes());
    seal_record(rec)
}

/// Incremental packet assembly.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    buf: Vec<u8>,
    records: usize,
}

impl PacketBuilder {
    /// Start a packet with header, optional descriptors and receiver record.
    pub fn new(header: PacketHeader, with_descriptors: bool, receiver: &ReceiverInfo) -> Self {
        let mut buf = Vec::with_capacity(MAX_UDP_PAYLOAD);
        buf.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&header.export_time.to_be_bytes());
        buf.extend_from_slice(&header.sequence.to_be_bytes());
        buf.extend_from_slice(&header.observation_domain.to_be_bytes());

        if with_descriptors {
            buf.extend_from_slice(&RECEIVER_DESCRIPTOR);
            buf.extend_from_slice(&SENDER_WITH_LOCATOR_DESCRIPTOR);
            buf.extend_from_slice(&SENDER_WITHOUT_LOCATOR_DESCRIPTOR);
        }

        buf.extend_from_slice(&encode_receiver_record(receiver));
        Self { buf, records: 0 }
    }

    /// Append a sender record unless the packet is already at its budget.
    ///
    /// The first record is always accepted so every packet makes progress.
    pub fn try_push(&mut self, report: &SenderReport) -> bool {
        let rec = encode_sender_record(report);
        if self.records > 0 && self.buf.len() + rec.len() > PACKET_BUDGET {
            return false;
        }
        self.buf.extend_from_slice(&rec);
        self.records += 1;
        true
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Patch the header length and return the packet bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
        self.buf
    }
}

/// Pack as many of `reports` as fit into one packet.
///
/// Returns the packet and the number of reports consumed.
pub fn build_packet(
    header: PacketHeader,
    with_descriptors: bool,
    receiver: &ReceiverInfo,
    reports: &[SenderReport],
) -> (Vec<u8>, usize) {
    let mut builder = PacketBuilder::new(header, with_descriptors, receiver);
    for report in reports {
        if !builder.try_push(report) {
            break;
        }
    }
    let consumed = builder.records();
    (builder.finish(), consumed)
}
