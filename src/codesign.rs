//! Ad-hoc code signing: the SuperBlob/CodeDirectory tree of SHA-256 page
//! hashes Apple Silicon requires at the tail of `__LINKEDIT`. No signer
//! identity is involved; the directory is flagged `CS_ADHOC |
//! CS_LINKER_SIGNED` the way a fresh `ld` output is.

use sha2::{Digest, Sha256};

/// Magic number for embedded signature SuperBlob
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
/// Magic number for CodeDirectory blob
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
/// Magic number for the requirements vector
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
/// Magic number for the entitlements plist blob
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;
/// Magic number for the DER entitlements blob
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;
/// Magic number for the (empty, ad-hoc) CMS signature wrapper
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

/// Slot index for CodeDirectory
pub const CSSLOT_CODEDIRECTORY: u32 = 0;
pub const CSSLOT_REQUIREMENTS: u32 = 2;
pub const CSSLOT_ENTITLEMENTS: u32 = 5;
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 7;
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

/// SHA-256 hash type
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_HASH_SIZE: usize = 32;
/// Ad-hoc signature flag
pub const CS_ADHOC: u32 = 0x0002;
/// Linker-signed flag
pub const CS_LINKER_SIGNED: u32 = 0x20000;
/// Main binary exec segment flag
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;
/// Code signature page size (4KB)
pub const CS_PAGE_SIZE: usize = 4096;
/// Code signature page size as log2
pub const CS_PAGE_SIZE_LOG2: u8 = 12;
/// CodeDirectory version carrying the exec-segment fields
pub const CS_VERSION: u32 = 0x20400;

/// SuperBlob header for embedded signature
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct SuperBlob {
    magic: u32,
    length: u32,
    count: u32,
}

/// Blob index entry
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlobIndex {
    typ: u32,
    offset: u32,
}

/// CodeDirectory structure (version 0x20400)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct CodeDirectory {
    magic: u32,
    length: u32,
    version: u32,
    flags: u32,
    hash_offset: u32,
    ident_offset: u32,
    n_special_slots: u32,
    n_code_slots: u32,
    code_limit: u32,
    hash_size: u8,
    hash_type: u8,
    _pad1: u8,
    page_size: u8,
    _pad2: u32,
    scatter_offset: u32,
    team_offset: u32,
    _pad3: u32,
    code_limit64: u64,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
}

const SIZEOF_SUPERBLOB: usize = 12;
const SIZEOF_BLOB_INDEX: usize = 8;
const SIZEOF_CODE_DIRECTORY: usize = 88;
/// Generic blob header: magic + length
const SIZEOF_BLOB_HEADER: usize = 8;

impl SuperBlob {
    fn to_bytes(self) -> [u8; SIZEOF_SUPERBLOB] {
        let mut buf = [0u8; SIZEOF_SUPERBLOB];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.count.to_be_bytes());
        buf
    }
}

impl BlobIndex {
    fn to_bytes(self) -> [u8; SIZEOF_BLOB_INDEX] {
        let mut buf = [0u8; SIZEOF_BLOB_INDEX];
        buf[0..4].copy_from_slice(&self.typ.to_be_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }
}

impl CodeDirectory {
    fn to_bytes(self) -> [u8; SIZEOF_CODE_DIRECTORY] {
        let mut buf = [0u8; SIZEOF_CODE_DIRECTORY];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_be_bytes());
        buf[16..20].copy_from_slice(&self.hash_offset.to_be_bytes());
        buf[20..24].copy_from_slice(&self.ident_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.n_special_slots.to_be_bytes());
        buf[28..32].copy_from_slice(&self.n_code_slots.to_be_bytes());
        buf[32..36].copy_from_slice(&self.code_limit.to_be_bytes());
        buf[36] = self.hash_size;
        buf[37] = self.hash_type;
        buf[38] = self._pad1;
        buf[39] = self.page_size;
        buf[40..44].copy_from_slice(&self._pad2.to_be_bytes());
        buf[44..48].copy_from_slice(&self.scatter_offset.to_be_bytes());
        buf[48..52].copy_from_slice(&self.team_offset.to_be_bytes());
        buf[52..56].copy_from_slice(&self._pad3.to_be_bytes());
        buf[56..64].copy_from_slice(&self.code_limit64.to_be_bytes());
        buf[64..72].copy_from_slice(&self.exec_seg_base.to_be_bytes());
        buf[72..80].copy_from_slice(&self.exec_seg_limit.to_be_bytes());
        buf[80..88].copy_from_slice(&self.exec_seg_flags.to_be_bytes());
        buf
    }
}

/// Everything the signature generator needs from the link.
#[derive(Debug, Clone, Default)]
pub struct CodeSignature {
    /// identifier embedded in the directory, conventionally the output
    /// basename
    pub identifier: String,
    /// entitlements plist bytes, when supplied
    pub entitlements: Option<Vec<u8>>,
    /// DER-encoded entitlements, when supplied
    pub der_entitlements: Option<Vec<u8>>,
    pub text_fileoff: u64,
    pub text_filesize: u64,
    pub is_executable: bool,
}

impl CodeSignature {
    fn n_special_slots(&self) -> u32 {
        if self.der_entitlements.is_some() {
            CSSLOT_DER_ENTITLEMENTS
        } else if self.entitlements.is_some() {
            CSSLOT_ENTITLEMENTS
        } else {
            CSSLOT_REQUIREMENTS
        }
    }

    fn blob_count(&self) -> u32 {
        // directory + requirements + empty signature, plus entitlements
        3 + self.entitlements.is_some() as u32 + self.der_entitlements.is_some() as u32
    }

    fn code_directory_size(&self, code_limit: usize) -> usize {
        let n_hashes = code_limit.div_ceil(CS_PAGE_SIZE);
        SIZEOF_CODE_DIRECTORY
            + self.identifier.len()
            + 1
            + (self.n_special_slots() as usize + n_hashes) * CS_HASH_SIZE
    }

    /// The exact number of bytes the signature occupies for a file whose
    /// signable content ends at `code_limit`. The caller reserves this
    /// (16-byte aligned) before hashing.
    pub fn estimate_size(&self, code_limit: usize) -> usize {
        let mut size = SIZEOF_SUPERBLOB + self.blob_count() as usize * SIZEOF_BLOB_INDEX;
        size += self.code_directory_size(code_limit);
        size += SIZEOF_BLOB_HEADER; // empty requirements vector: header + count
        size += 4;
        if let Some(ent) = &self.entitlements {
            size += SIZEOF_BLOB_HEADER + ent.len();
        }
        if let Some(der) = &self.der_entitlements {
            size += SIZEOF_BLOB_HEADER + der.len();
        }
        size += SIZEOF_BLOB_HEADER; // empty signature wrapper
        (size + 15) & !15
    }

    /// Produce the SuperBlob for `data[..code_limit]`. `data` must already
    /// carry its final bytes up to `code_limit` (the signature region is
    /// excluded from hashing by construction).
    pub fn write(&self, data: &[u8], code_limit: usize) -> Vec<u8> {
        let n_hashes = code_limit.div_ceil(CS_PAGE_SIZE);
        let n_special = self.n_special_slots() as usize;
        let cd_size = self.code_directory_size(code_limit);

        // requirements: an empty vector
        let mut requirements = Vec::new();
        requirements.extend_from_slice(&CSMAGIC_REQUIREMENTS.to_be_bytes());
        requirements.extend_from_slice(&(SIZEOF_BLOB_HEADER as u32 + 4).to_be_bytes());
        requirements.extend_from_slice(&0u32.to_be_bytes());

        let entitlements = self.entitlements.as_ref().map(|plist| {
            let mut blob = Vec::with_capacity(SIZEOF_BLOB_HEADER + plist.len());
            blob.extend_from_slice(&CSMAGIC_EMBEDDED_ENTITLEMENTS.to_be_bytes());
            blob.extend_from_slice(&((SIZEOF_BLOB_HEADER + plist.len()) as u32).to_be_bytes());
            blob.extend_from_slice(plist);
            blob
        });
        let der = self.der_entitlements.as_ref().map(|bytes| {
            let mut blob = Vec::with_capacity(SIZEOF_BLOB_HEADER + bytes.len());
            blob.extend_from_slice(&CSMAGIC_EMBEDDED_DER_ENTITLEMENTS.to_be_bytes());
            blob.extend_from_slice(&((SIZEOF_BLOB_HEADER + bytes.len()) as u32).to_be_bytes());
            blob.extend_from_slice(bytes);
            blob
        });
        let mut signature = Vec::new();
        signature.extend_from_slice(&CSMAGIC_BLOBWRAPPER.to_be_bytes());
        signature.extend_from_slice(&(SIZEOF_BLOB_HEADER as u32).to_be_bytes());

        // layout: superblob, indices, directory, then the other blobs
        let index_area = SIZEOF_SUPERBLOB + self.blob_count() as usize * SIZEOF_BLOB_INDEX;
        let cd_offset = index_area;
        let req_offset = cd_offset + cd_size;
        let mut next = req_offset + requirements.len();
        let ent_offset = entitlements.as_ref().map(|e| {
            let off = next;
            next += e.len();
            off
        });
        let der_offset = der.as_ref().map(|d| {
            let off = next;
            next += d.len();
            off
        });
        let sig_offset = next;
        let total = sig_offset + signature.len();

        let mut indices = vec![
            BlobIndex { typ: CSSLOT_CODEDIRECTORY, offset: cd_offset as u32 },
            BlobIndex { typ: CSSLOT_REQUIREMENTS, offset: req_offset as u32 },
        ];
        if let Some(off) = ent_offset {
            indices.push(BlobIndex { typ: CSSLOT_ENTITLEMENTS, offset: off as u32 });
        }
        if let Some(off) = der_offset {
            indices.push(BlobIndex { typ: CSSLOT_DER_ENTITLEMENTS, offset: off as u32 });
        }
        indices.push(BlobIndex { typ: CSSLOT_SIGNATURESLOT, offset: sig_offset as u32 });

        let ident_offset = SIZEOF_CODE_DIRECTORY;
        let hash_offset = ident_offset + self.identifier.len() + 1 + n_special * CS_HASH_SIZE;
        let directory = CodeDirectory {
            magic: CSMAGIC_CODEDIRECTORY,
            length: cd_size as u32,
            version: CS_VERSION,
            flags: CS_ADHOC | CS_LINKER_SIGNED,
            hash_offset: hash_offset as u32,
            ident_offset: ident_offset as u32,
            n_special_slots: n_special as u32,
            n_code_slots: n_hashes as u32,
            code_limit: code_limit as u32,
            hash_size: CS_HASH_SIZE as u8,
            hash_type: CS_HASHTYPE_SHA256,
            _pad1: 0,
            page_size: CS_PAGE_SIZE_LOG2,
            _pad2: 0,
            scatter_offset: 0,
            team_offset: 0,
            _pad3: 0,
            code_limit64: 0,
            exec_seg_base: self.text_fileoff,
            exec_seg_limit: self.text_filesize,
            exec_seg_flags: if self.is_executable { CS_EXECSEG_MAIN_BINARY } else { 0 },
        };

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(
            &SuperBlob {
                magic: CSMAGIC_EMBEDDED_SIGNATURE,
                length: total as u32,
                count: self.blob_count(),
            }
            .to_bytes(),
        );
        for index in &indices {
            out.extend_from_slice(&index.to_bytes());
        }
        out.extend_from_slice(&directory.to_bytes());
        out.extend_from_slice(self.identifier.as_bytes());
        out.push(0);

        // special slots run backwards from the hash offset: slot -N first
        let mut special = vec![[0u8; CS_HASH_SIZE]; n_special];
        let mut place = |slot: u32, blob: &[u8]| {
            let mut hasher = Sha256::new();
            hasher.update(blob);
            special[n_special - slot as usize].copy_from_slice(&hasher.finalize());
        };
        place(CSSLOT_REQUIREMENTS, &requirements);
        if let Some(ent) = &entitlements {
            place(CSSLOT_ENTITLEMENTS, ent);
        }
        if let Some(d) = &der {
            place(CSSLOT_DER_ENTITLEMENTS, d);
        }
        for hash in &special {
            out.extend_from_slice(hash);
        }

        // page hashes over [0, code_limit)
        let mut hasher = Sha256::new();
        let mut offset = 0;
        while offset < code_limit {
            let end = core::cmp::min(offset + CS_PAGE_SIZE, code_limit);
            hasher.update(&data[offset..end]);
            out.extend_from_slice(&hasher.finalize_reset());
            offset = end;
        }
        debug_assert_eq!(out.len(), cd_offset + cd_size);

        out.extend_from_slice(&requirements);
        if let Some(ent) = entitlements {
            out.extend_from_slice(&ent);
        }
        if let Some(d) = der {
            out.extend_from_slice(&d);
        }
        out.extend_from_slice(&signature);
        debug_assert_eq!(out.len(), total);
        out.resize(self.estimate_size(code_limit), 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_matches_written_size() {
        let signature = CodeSignature {
            identifier: "a.out".to_string(),
            entitlements: None,
            der_entitlements: None,
            text_fileoff: 0,
            text_filesize: 0x4000,
            is_executable: true,
        };
        let data = vec![0xaau8; 0x5000];
        let blob = signature.write(&data, data.len());
        assert_eq!(blob.len(), signature.estimate_size(data.len()));
        // superblob magic, big-endian
        assert_eq!(&blob[0..4], &CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        // two pages of 0x5000 round up to 2 hashes... 0x5000 / 0x1000 = 5
        let count = u32::from_be_bytes(blob[8..12].try_into().unwrap());
        assert_eq!(count, 3);
    }

    #[test]
    fn page_hashes_cover_exactly_the_code_limit() {
        let signature = CodeSignature {
            identifier: "t".to_string(),
            entitlements: None,
            der_entitlements: None,
            text_fileoff: 0,
            text_filesize: 0,
            is_executable: false,
        };
        let data = vec![1u8; CS_PAGE_SIZE + 1];
        let blob = signature.write(&data, data.len());
        // directory reports two code slots
        let cd_off = {
            let off = u32::from_be_bytes(blob[16..20].try_into().unwrap());
            off as usize
        };
        let n_code_slots = u32::from_be_bytes(blob[cd_off + 28..cd_off + 32].try_into().unwrap());
        assert_eq!(n_code_slots, 2);
    }

    #[test]
    fn entitlements_get_a_special_slot() {
        let signature = CodeSignature {
            identifier: "t".to_string(),
            entitlements: Some(b"<plist/>".to_vec()),
            der_entitlements: None,
            text_fileoff: 0,
            text_filesize: 0,
            is_executable: true,
        };
        let data = vec![0u8; 64];
        let blob = signature.write(&data, data.len());
        let count = u32::from_be_bytes(blob[8..12].try_into().unwrap());
        assert_eq!(count, 4);
        let cd_off = u32::from_be_bytes(blob[16..20].try_into().unwrap()) as usize;
        let n_special = u32::from_be_bytes(blob[cd_off + 24..cd_off + 28].try_into().unwrap());
        assert_eq!(n_special, CSSLOT_ENTITLEMENTS);
    }
}
