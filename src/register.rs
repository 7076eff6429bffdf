use bitfield_struct::bitfield;

use crate::utils::{GetBit, BLOCK_LEN};

pub(crate) const R1_READY_STATE: u8 = 0x00;
pub(crate) const R1_IDLE_STATE: u8 = 0x01;

/// Start of a block payload: single read/write, CSD/CID reads.
pub(crate) const START_BLOCK_TOKEN: u8 = 0xFE;
/// Start of a block payload inside a multi-block write.
pub(crate) const START_MULTI_BLOCK_TOKEN: u8 = 0xFC;
/// Terminates a multi-block write.
pub(crate) const STOP_TRANSMISSION_TOKEN: u8 = 0xFD;

pub(crate) const RESPONSE_TOKEN_MASK: u8 = 0x0E;
pub(crate) const ERROR_TOKEN_MASK: u8 = 0xF0;

pub(crate) const CSD_LEN: usize = 16;
pub(crate) const CID_LEN: usize = 16;
pub(crate) const CRC_LEN: usize = 2;

/// First byte of every response. Bit 7 is always clear; bit 0 stays set
/// while the card is still in the idle state.
#[bitfield(u8, order = Msb)]
pub struct R1 {
    reserved: bool,
    pub parameter_error: bool,
    pub address_error: bool,
    pub erase_sequence_error: bool,
    pub com_crc_error: bool,
    pub illegal_command: bool,
    pub erase_reset: bool,
    pub in_idle_state: bool,
}

/// Operating Conditions Register, carried in the payload of an R3
/// response to CMD58.
#[bitfield(u32, order = Msb)]
pub struct Ocr {
    /// Card power-up routine finished.
    pub power_up_done: bool,
    /// Card Capacity Status; set on block-addressed (SDHC/SDXC) cards.
    /// Only valid once `power_up_done` is set.
    pub ccs: bool,
    #[bits(6)]
    reserved: u8,
    /// Supported supply range, one bit per 0.1V step from 2.7V to 3.6V.
    #[bits(9)]
    pub voltage_window: u16,
    #[bits(15)]
    reserved2: u16,
}

impl Ocr {
    /// OCR bytes as they arrive behind the R1 byte, MSB first.
    pub fn from_response(bytes: [u8; 4]) -> Self {
        Ocr::from(u32::from_be_bytes(bytes))
    }
}

/// Token replacing the start-of-block token when a read fails inside the
/// card. Identified by its zero high nibble.
#[bitfield(u8, order = Msb)]
pub struct DataErrorToken {
    #[bits(4)]
    reserved: u8,
    pub out_of_range: bool,
    pub card_ecc_failed: bool,
    pub cc_error: bool,
    pub error: bool,
}

/// Status nibble of the data-response token the card returns after each
/// written block.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum WriteResponse {
    Accepted,
    CrcError,
    WriteError,
    Unknown(u8),
}

impl WriteResponse {
    pub fn decode(token: u8) -> Self {
        match token & RESPONSE_TOKEN_MASK {
            0x04 => WriteResponse::Accepted,
            0x0A => WriteResponse::CrcError,
            0x0C => WriteResponse::WriteError,
            other => WriteResponse::Unknown(other),
        }
    }
}

/// Card-Specific Data register, V2.0 layout.
#[derive(Debug, Copy, Clone)]
pub struct Csd([u8; CSD_LEN]);

impl Csd {
    pub fn new(raw: [u8; CSD_LEN]) -> Self {
        Csd(raw)
    }

    /// 22-bit C_SIZE field: the low 6 bits of byte 7 ahead of bytes 8
    /// and 9.
    pub fn c_size(&self) -> u32 {
        ((self.0[7] as u32 & 0x3F) << 16) | ((self.0[8] as u32) << 8) | self.0[9] as u32
    }

    /// Usable capacity in bytes: (C_SIZE + 1) * 512 KiB.
    pub fn capacity_bytes(&self) -> u64 {
        (self.c_size() as u64 + 1) * ((BLOCK_LEN as u64) << 10)
    }
}

// mid:u8,
// oid:u16,
// pnm:u40,
// prv:u8,
// psn:u32,
// reserved:u4,
// mdt:u12,
// crc:u7,
// zero:u1,

/// Card Identification register.
#[derive(Debug, Copy, Clone)]
pub struct Cid(u128);

impl Cid {
    pub fn new(raw: [u8; CID_LEN]) -> Self {
        Cid(u128::from_be_bytes(raw))
    }

    pub fn mid(&self) -> u8 {
        self.0.get_bits(120, 127) as u8
    }

    pub fn psn(&self) -> u32 {
        self.0.get_bits(24, 55) as u32
    }

    #[cfg(feature = "alloc")]
    pub fn oid(&self) -> alloc::string::String {
        use alloc::string::ToString;
        let oid = self.0.get_bits(104, 119) as u16; // 2 chars
        core::str::from_utf8(&oid.to_be_bytes())
            .unwrap_or("??")
            .to_string()
    }

    #[cfg(feature = "alloc")]
    pub fn pnm(&self) -> alloc::string::String {
        use alloc::string::ToString;
        let pnm = self.0.get_bits(64, 103) as u64; // 5 chars
        core::str::from_utf8(&pnm.to_be_bytes()[3..8])
            .unwrap_or("?????")
            .to_string()
    }

    #[cfg(feature = "alloc")]
    pub fn prv(&self) -> alloc::string::String {
        let major = self.0.get_bits(60, 63) as u8;
        let minor = self.0.get_bits(56, 59) as u8;
        alloc::format!("{}.{}", major, minor)
    }

    #[cfg(feature = "alloc")]
    pub fn mdt(&self) -> alloc::string::String {
        let year = self.0.get_bits(12, 19) as usize;
        let month = self.0.get_bits(8, 11) as u8;
        alloc::format!("{}-{}", year + 2000, month)
    }

    #[cfg(feature = "alloc")]
    pub fn fmt(&self) -> alloc::string::String {
        alloc::format!(
            "mid:{} oid:{} pnm:{} prv:{} psn:{} mdt:{}",
            self.mid(),
            self.oid(),
            self.pnm(),
            self.prv(),
            self.psn(),
            self.mdt()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r1_bits() {
        let r1 = R1::from(0x01);
        assert!(r1.in_idle_state());
        assert!(!r1.illegal_command());
        let r1 = R1::from(0x05);
        assert!(r1.in_idle_state());
        assert!(r1.illegal_command());
    }

    #[test]
    fn test_ocr_ccs() {
        let ocr = Ocr::from_response([0xC0, 0xFF, 0x80, 0x00]);
        assert!(ocr.power_up_done());
        assert!(ocr.ccs());
        let ocr = Ocr::from_response([0x80, 0xFF, 0x80, 0x00]);
        assert!(ocr.power_up_done());
        assert!(!ocr.ccs());
    }

    #[test]
    fn test_write_response_decode() {
        assert_eq!(WriteResponse::decode(0xE5), WriteResponse::Accepted);
        assert_eq!(WriteResponse::decode(0x05), WriteResponse::Accepted);
        assert_eq!(WriteResponse::decode(0x0B), WriteResponse::CrcError);
        assert_eq!(WriteResponse::decode(0x0D), WriteResponse::WriteError);
        assert_eq!(WriteResponse::decode(0x01), WriteResponse::Unknown(0x00));
    }

    #[test]
    fn test_data_error_token() {
        let token = DataErrorToken::from(0x04);
        assert!(token.card_ecc_failed());
        assert!(!token.out_of_range());
        let token = DataErrorToken::from(0x08);
        assert!(token.out_of_range());
    }

    #[test]
    fn test_csd_capacity() {
        // c_size 8191 -> (8191 + 1) * 512 KiB = 4 GiB
        let mut raw = [0u8; CSD_LEN];
        raw[7] = 0x00;
        raw[8] = 0x1F;
        raw[9] = 0xFF;
        let csd = Csd::new(raw);
        assert_eq!(csd.c_size(), 8191);
        assert_eq!(csd.capacity_bytes(), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_csd_c_size_uses_six_bits_of_byte_7() {
        let mut raw = [0u8; CSD_LEN];
        raw[7] = 0xFF; // top two bits are reserved, low six belong to C_SIZE
        let csd = Csd::new(raw);
        assert_eq!(csd.c_size() >> 16, 0x3F);
    }

    #[test]
    fn test_cid_fields() {
        let mut raw = [0u8; CID_LEN];
        raw[0] = 0x03; // manufacturer
        raw[1] = b'S';
        raw[2] = b'D';
        raw[3..8].copy_from_slice(b"SD04G");
        raw[8] = 0x80; // product revision 8.0
        raw[9..13].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        raw[13] = 0x01; // year high nibble
        raw[14] = 0x25; // year low nibble, month
        let cid = Cid::new(raw);
        assert_eq!(cid.mid(), 0x03);
        assert_eq!(cid.psn(), 0xDEAD_BEEF);
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn test_cid_fmt() {
        let mut raw = [0u8; CID_LEN];
        raw[0] = 0x03;
        raw[1] = b'S';
        raw[2] = b'D';
        raw[3..8].copy_from_slice(b"SD04G");
        raw[8] = 0x80;
        raw[13] = 0x01;
        raw[14] = 0x25;
        let cid = Cid::new(raw);
        assert_eq!(cid.oid(), "SD");
        assert_eq!(cid.pnm(), "SD04G");
        assert_eq!(cid.prv(), "8.0");
        assert_eq!(cid.mdt(), "2018-5");
    }
}
