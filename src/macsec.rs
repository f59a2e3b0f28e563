//! MACsec (IEEE 802.1AE) SecTag framing: the tag-control-information
//! (TCI) byte, the optional secure-channel identifier, and the
//! ciphertext/ICV region they bound within an Ethernet frame.
//!
//! This module only frames and unframes a MACsec packet; it does not
//! perform AES-GCM-GMAC itself, track security-association negotiation,
//! or maintain a replay window. A caller supplies those by implementing
//! [`AeadCipher`] and driving [`Frame::open`]/[`Frame::seal`].

use crate::eth::{EtherType, MacAddr};
use crate::io::{ArrayRead, Readable, Writeable};

/// EtherType carried by a MACsec-tagged frame, in place of the usual
/// inner protocol type.
pub const ETYPE_MACSEC: EtherType = EtherType(0x88E5);

/// TCI bit flags (802.1AE section 9.5).
pub const FLAG_VER: u8 = 0x80;
pub const FLAG_ES: u8 = 0x40;
pub const FLAG_SCI: u8 = 0x20;
pub const FLAG_SCB: u8 = 0x10;
/// Encrypted-payload bit.
pub const FLAG_E: u8 = 0x08;
/// Changed-text (authenticated, possibly-encrypted) bit.
pub const FLAG_C: u8 = 0x04;
const FLAG_AN_MASK: u8 = 0x03;

/// Short-length threshold: a `short_len` below this value gives the
/// exact plaintext length; zero means "use the frame's actual length"
/// (section 9.7).
pub const MAX_SHORT_LEN: u8 = 48;

pub const ICV_LEN: usize = 16;
pub const SCI_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame too short to hold a SecTag and ICV")]
    Truncated,
    #[error("TCI sets both end-station and SCI-present bits")]
    BadTci,
    #[error("MACsec version bit must be zero")]
    BadVersion,
    #[error("frame does not carry the MACsec EtherType")]
    NotMacsec,
    #[error("authentication failed")]
    AuthFailed,
}

/// Parsed SecTag (802.1AE section 9.3): TCI/AN byte, short length,
/// 32-bit packet-number LSBs, and an optional 64-bit SCI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecTag {
    pub tci_an: u8,
    pub short_len: u8,
    pub packet_number: u32,
    pub sci: Option<u64>,
}

impl SecTag {
    pub fn new(tci_an: u8, packet_number: u32, sci: Option<u64>) -> Result<Self, Error> {
        let tag = SecTag {
            tci_an,
            short_len: 0,
            packet_number,
            sci,
        };
        tag.validate()?;
        Ok(tag)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.tci_an & FLAG_VER != 0 {
            return Err(Error::BadVersion);
        }
        if self.has_sci() && self.is_end_station() {
            return Err(Error::BadTci);
        }
        Ok(())
    }

    pub fn association_number(&self) -> u8 {
        self.tci_an & FLAG_AN_MASK
    }

    pub fn is_end_station(&self) -> bool {
        self.tci_an & FLAG_ES != 0
    }

    pub fn has_sci(&self) -> bool {
        self.tci_an & FLAG_SCI != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.tci_an & FLAG_E != 0
    }

    /// Length of DstMAC + SrcMAC/SCI-prefix + EtherType + SecTag, i.e.
    /// the offset of the first ciphertext/plaintext byte.
    pub fn header_len(&self) -> usize {
        if self.has_sci() {
            28
        } else {
            20
        }
    }

    /// Bytes of the SecTag itself, not counting the preceding Ethernet
    /// header/EtherType.
    pub fn tag_len(&self) -> usize {
        if self.has_sci() {
            6 + SCI_LEN
        } else {
            6
        }
    }

    pub fn read_from(src: &mut dyn Readable) -> Result<Self, Error> {
        if src.read_ready() < 6 {
            return Err(Error::Truncated);
        }
        let tci_an = src.read_u8();
        let short_len = src.read_u8();
        let packet_number = src.read_u32();
        let sci = if tci_an & FLAG_SCI != 0 {
            if src.read_ready() < SCI_LEN {
                return Err(Error::Truncated);
            }
            Some(src.read_u64())
        } else {
            None
        };
        let tag = SecTag {
            tci_an,
            short_len,
            packet_number,
            sci,
        };
        tag.validate()?;
        Ok(tag)
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u8(self.tci_an);
        dst.write_u8(self.short_len);
        dst.write_u32(self.packet_number);
        if let Some(sci) = self.sci {
            dst.write_u64(sci);
        }
    }
}

/// Something that can open (authenticate + decrypt) or seal
/// (encrypt + authenticate) one AES-GCM frame. Implementations own the
/// key and IV-derivation scheme; this crate supplies only the additional
/// authenticated data (the Ethernet header + SecTag) and the
/// ciphertext/ICV region located by [`Frame`].
pub trait AeadCipher {
    /// Authenticate `aad || ciphertext` against `icv`, and if
    /// `decrypt` is set, decrypt `ciphertext` in place. Returns `false`
    /// on authentication failure (ciphertext must be left untouched).
    fn open(&mut self, packet_number: u64, aad: &[u8], ciphertext: &mut [u8], icv: &[u8; ICV_LEN], decrypt: bool) -> bool;

    /// Encrypt `plaintext` in place (if `encrypt` is set) and compute an
    /// ICV over `aad || plaintext`.
    fn seal(&mut self, packet_number: u64, aad: &[u8], plaintext: &mut [u8], encrypt: bool) -> [u8; ICV_LEN];
}

/// A MACsec frame located within a caller-owned buffer: the leading
/// DstMAC/SrcMAC-or-SCI-prefix/EtherType, the [`SecTag`], the
/// ciphertext region, and the trailing ICV.
pub struct Frame<'a> {
    pub dst_mac: MacAddr,
    pub src_prefix: MacAddr,
    pub tag: SecTag,
    buf: &'a mut [u8],
    /// Offset of the first ciphertext byte within `buf`.
    body_start: usize,
}

impl<'a> Frame<'a> {
    /// Parses the Ethernet header and SecTag from the front of `buf`,
    /// leaving the rest (ciphertext + ICV) addressable via
    /// [`Frame::body`]. `buf` must already have had any VLAN tag
    /// stripped; MACsec is defined outside VLAN tags.
    pub fn parse(buf: &'a mut [u8]) -> Result<Self, Error> {
        if buf.len() < 14 + 6 + ICV_LEN {
            return Err(Error::Truncated);
        }
        let dst_mac = MacAddr([buf[0], buf[1], buf[2], buf[3], buf[4], buf[5]]);
        let src_prefix = MacAddr([buf[6], buf[7], buf[8], buf[9], buf[10], buf[11]]);
        let etype = EtherType(u16::from_be_bytes([buf[12], buf[13]]));
        if etype != ETYPE_MACSEC {
            return Err(Error::NotMacsec);
        }
        let tag = {
            let mut cursor = ArrayRead::new(&buf[14..]);
            SecTag::read_from(&mut cursor)?
        };
        let body_start = 14 + tag.tag_len();
        if buf.len() < body_start + ICV_LEN {
            return Err(Error::Truncated);
        }
        Ok(Frame {
            dst_mac,
            src_prefix,
            tag,
            buf,
            body_start,
        })
    }

    /// Additional authenticated data: the bytes from the start of the
    /// frame through the end of the SecTag.
    pub fn aad(&self) -> &[u8] {
        &self.buf[..self.body_start]
    }

    /// Ciphertext (or plaintext, if the `E` bit is clear) length,
    /// honoring the short-length field when it is nonzero.
    pub fn body_len(&self) -> usize {
        let avail = self.buf.len() - self.body_start - ICV_LEN;
        let sl = self.tag.short_len as usize;
        if sl > 0 && sl < avail {
            sl
        } else {
            avail
        }
    }

    fn icv(&self) -> [u8; ICV_LEN] {
        let start = self.body_start + self.body_len();
        self.buf[start..start + ICV_LEN].try_into().unwrap()
    }

    /// Authenticate the frame and, if the `E` bit is set, decrypt the
    /// body in place. Returns the plaintext slice on success.
    pub fn open(&mut self, cipher: &mut dyn AeadCipher, packet_number: u64) -> Result<&[u8], Error> {
        let body_len = self.body_len();
        let icv = self.icv();
        let encrypted = self.tag.is_encrypted();
        let (aad, body) = self.buf[..self.body_start + body_len].split_at_mut(self.body_start);
        if !cipher.open(packet_number, aad, body, &icv, encrypted) {
            return Err(Error::AuthFailed);
        }
        Ok(&self.buf[self.body_start..self.body_start + body_len])
    }

    /// Seals `plaintext_len` bytes already written at [`Frame::body_mut`]
    /// starting from the SecTag, encrypting in place if the `E` bit is
    /// set, and writes the computed ICV right after.
    pub fn seal(&mut self, cipher: &mut dyn AeadCipher, packet_number: u64, plaintext_len: usize) {
        let encrypted = self.tag.is_encrypted();
        let (aad, body) = self.buf[..self.body_start + plaintext_len].split_at_mut(self.body_start);
        let icv = cipher.seal(packet_number, aad, body, encrypted);
        self.buf[self.body_start + plaintext_len..self.body_start + plaintext_len + ICV_LEN]
            .copy_from_slice(&icv);
    }

    /// Mutable access to the region starting at the first body byte,
    /// for a caller assembling plaintext before calling [`Frame::seal`].
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.body_start..]
    }
}
