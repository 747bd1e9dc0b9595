//! Content sniffing for disk image payloads.
//!
//! Classification is signature-only: a bounded prefix either carries a known
//! container or compression magic, or the payload is treated as a raw disk
//! image. Unrecognized content is never rejected here; only the caller can
//! decide that a stream is unusable (e.g. because it is empty or unreadable).

/// How many leading bytes [`detect_image_format`] inspects: one disk sector.
/// Every signature in the table below sits within the first 68 bytes.
pub const SNIFF_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Qcow2,
    Vmdk,
    Vhdx,
    Vdi,
    Gzip,
    Xz,
    /// No known container or compression signature.
    Raw,
}

impl ImageFormat {
    /// Container and compressed images need a scratch-space intermediate
    /// before conversion; raw images can be consumed where they land.
    pub fn needs_scratch(self) -> bool {
        !matches!(self, ImageFormat::Raw)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Gzip => "gzip",
            ImageFormat::Xz => "xz",
            ImageFormat::Raw => "raw",
        }
    }
}

const QCOW2_MAGIC: &[u8] = b"QFI\xfb";
const VMDK_MAGIC: &[u8] = b"KDMV";
const VHDX_MAGIC: &[u8] = b"vhdxfile";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
// VDI keeps its signature past the text preheader.
const VDI_MAGIC_OFFSET: usize = 64;
const VDI_MAGIC: &[u8] = &[0x7f, 0x10, 0xda, 0xbe];

/// Classifies the leading bytes of an image stream.
pub fn detect_image_format(prefix: &[u8]) -> ImageFormat {
    if prefix.starts_with(QCOW2_MAGIC) {
        ImageFormat::Qcow2
    } else if prefix.starts_with(VMDK_MAGIC) {
        ImageFormat::Vmdk
    } else if prefix.starts_with(VHDX_MAGIC) {
        ImageFormat::Vhdx
    } else if prefix.starts_with(GZIP_MAGIC) {
        ImageFormat::Gzip
    } else if prefix.starts_with(XZ_MAGIC) {
        ImageFormat::Xz
    } else if prefix.len() >= VDI_MAGIC_OFFSET + VDI_MAGIC.len()
        && &prefix[VDI_MAGIC_OFFSET..VDI_MAGIC_OFFSET + VDI_MAGIC.len()] == VDI_MAGIC
    {
        ImageFormat::Vdi
    } else {
        ImageFormat::Raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_magic_at(offset: usize, magic: &[u8]) -> Vec<u8> {
        let mut prefix = vec![0u8; SNIFF_BYTES];
        prefix[offset..offset + magic.len()].copy_from_slice(magic);
        prefix
    }

    #[test]
    fn detects_container_signatures() {
        assert_eq!(
            detect_image_format(&with_magic_at(0, QCOW2_MAGIC)),
            ImageFormat::Qcow2
        );
        assert_eq!(
            detect_image_format(&with_magic_at(0, VMDK_MAGIC)),
            ImageFormat::Vmdk
        );
        assert_eq!(
            detect_image_format(&with_magic_at(0, VHDX_MAGIC)),
            ImageFormat::Vhdx
        );
        assert_eq!(
            detect_image_format(&with_magic_at(0, GZIP_MAGIC)),
            ImageFormat::Gzip
        );
        assert_eq!(
            detect_image_format(&with_magic_at(0, XZ_MAGIC)),
            ImageFormat::Xz
        );
        assert_eq!(
            detect_image_format(&with_magic_at(VDI_MAGIC_OFFSET, VDI_MAGIC)),
            ImageFormat::Vdi
        );
    }

    #[test]
    fn unrecognized_content_is_raw() {
        assert_eq!(detect_image_format(&[0u8; SNIFF_BYTES]), ImageFormat::Raw);
        assert_eq!(detect_image_format(b"MBR boot sector"), ImageFormat::Raw);
        // A truncated signature does not match.
        assert_eq!(detect_image_format(b"QF"), ImageFormat::Raw);
        assert_eq!(detect_image_format(&[]), ImageFormat::Raw);
    }

    #[test]
    fn scratch_routing() {
        assert!(ImageFormat::Qcow2.needs_scratch());
        assert!(ImageFormat::Gzip.needs_scratch());
        assert!(!ImageFormat::Raw.needs_scratch());
    }
}
