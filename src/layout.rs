//! On-disk layout constants (§6).
//!
//! Every scalar named here is load-bearing for on-disk compatibility; do not
//! change a value without also changing the corresponding accessor.

/// `'BFS1'` — first superblock magic, encodes identity and (via its byte
/// order on read) the writer's endianness.
pub const SUPER_BLOCK_MAGIC1: u32 = 0x4245_5331;

pub const SUPER_BLOCK_MAGIC2: u32 = 0xdd12_1031;

pub const SUPER_BLOCK_MAGIC3: u32 = 0x15b6_830e;

/// Magic stamped into every inode block.
pub const INODE_MAGIC1: u32 = 0x3bbe_0ad9;

/// Magic stamped into a B+tree header (offset 0 of the tree's stream).
pub const BPLUS_TREE_MAGIC: u32 = 0x69f6_c2e8;

/// Volume is clean: log start == log end, safe to mount without replay.
pub const VOLUME_FLAG_CLEAN: u32 = 0x434c_454e;

/// Volume is dirty: journal replay is required before use.
pub const VOLUME_FLAG_DIRTY: u32 = 0x4449_5254;

/// Smallest legal block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest legal block size.
pub const MAX_BLOCK_SIZE: u32 = 16384;

/// Inode and B+tree node size is fixed; duplicate-fragment arithmetic in the
/// B+tree depends on this exact value.
pub const NODE_SIZE: usize = 1024;

/// Number of direct block-run slots carried inline in the inode.
pub const NUM_DIRECT_BLOCKS: usize = 12;

/// Maximum blocks addressable by a single [`crate::block_run::BlockRun`].
pub const MAX_BLOCK_RUN_LENGTH: u16 = u16::MAX;

/// Reserved record name for the filename record in the small-data area.
pub const FILE_NAME_NAME: u8 = 0x01;

pub const FILE_NAME_TYPE: u32 = 0x4e41_4d45; // 'NAME'

/// Small-data record type codes for user-defined attributes (§4.5, §4.9).
pub const ATTRIBUTE_STRING_TYPE: u32 = 0x4353_5452; // 'CSTR'
pub const ATTRIBUTE_INT64_TYPE: u32 = 0x4c4c_4e47; // 'LLNG'

/// Byte offset of the superblock within the volume's first logical block,
/// kept for boot-block compatibility.
pub const SUPER_BLOCK_OFFSET: u64 = 512;

/// Size in bytes of the on-disk superblock structure.
pub const SUPER_BLOCK_SIZE: usize = 512;

/// Maximum volume name length, not counting the NUL terminator.
pub const MAX_VOLUME_NAME_LENGTH: usize = 31;

// POSIX file-type bits packed into `InodeHeader::mode`, plus the BFS-specific
// extensions §3 calls out (index/attribute directories, attribute files,
// and the duplicate-key-allowed flag on a directory's B+tree).
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// BFS type bits, stored in the otherwise-unused high bits of `mode`.
pub const S_ATTR_DIR: u32 = 0x0040_0000;
pub const S_ATTR: u32 = 0x0080_0000;
pub const S_INDEX_DIR: u32 = 0x0100_0000;
pub const S_ALLOW_DUPS: u32 = 0x0200_0000;

/// Index key-type bits, also packed into `mode` for an index inode.
pub const S_STR_INDEX: u32 = 0x0000_0100;
pub const S_INT_INDEX: u32 = 0x0000_0200;
pub const S_LONG_LONG_INDEX: u32 = 0x0000_0400;
pub const S_FLOAT_INDEX: u32 = 0x0000_0800;
pub const S_DOUBLE_INDEX: u32 = 0x0000_1000;
