//! 9P2000.L wire format.
//!
//! Every message is a little-endian frame of `size[4] type[1] tag[2]`
//! followed by the typed payload. The deku derives below describe the
//! payload layouts; [`P9Message`] wraps a payload with its header and
//! back-patches `size` on serialization.

use deku::prelude::*;

pub const VERSION_9P2000L: &str = "9P2000.L";

/// Tag reserved for Tversion/Rversion.
pub const NOTAG: u16 = !0;
/// "No fid": the afid value for an unauthenticated attach.
pub const NOFID: u32 = !0;
/// "No numeric uname" in Tattach.
pub const NONUNAME: u32 = !0;

/// The fid bound to the attach root. Reserved in the pool at init.
pub const ROOT_FID: u32 = 0;

pub const HEADER_SIZE: u32 = 7;
pub const QID_SIZE: u32 = 13;

/// Smallest msize we will negotiate down to.
pub const MIN_MSIZE: u32 = 4096;
/// Largest frame the client ever proposes.
pub const MAX_MSIZE: u32 = 65536;
pub const DEFAULT_MSIZE: u32 = MAX_MSIZE;

/// Frame overhead of Tread/Rread and Twrite: header plus the count field.
pub const IO_OVERHEAD: u32 = HEADER_SIZE + 4;

// Message type codes. Each T-code is acknowledged by T+1 on success,
// or by RLERROR carrying a Linux errno.
pub const RLERROR: u8 = 7;
pub const TSTATFS: u8 = 8;
pub const TLOPEN: u8 = 12;
pub const TLCREATE: u8 = 14;
pub const TSYMLINK: u8 = 16;
pub const TREADLINK: u8 = 22;
pub const TGETATTR: u8 = 24;
pub const TSETATTR: u8 = 26;
pub const TREADDIR: u8 = 40;
pub const TFSYNC: u8 = 50;
pub const TLINK: u8 = 70;
pub const TMKDIR: u8 = 72;
pub const TRENAMEAT: u8 = 74;
pub const TUNLINKAT: u8 = 76;
pub const TVERSION: u8 = 100;
pub const TATTACH: u8 = 104;
pub const TFLUSH: u8 = 108;
pub const TWALK: u8 = 110;
pub const TREAD: u8 = 116;
pub const TWRITE: u8 = 118;
pub const TCLUNK: u8 = 120;
pub const TREMOVE: u8 = 122;

// Qid type bits
pub const QT_DIR: u8 = 0x80;
pub const QT_APPEND: u8 = 0x40;
pub const QT_EXCL: u8 = 0x20;
pub const QT_MOUNT: u8 = 0x10;
pub const QT_AUTH: u8 = 0x08;
pub const QT_TMP: u8 = 0x04;
pub const QT_SYMLINK: u8 = 0x02;
pub const QT_LINK: u8 = 0x01;
pub const QT_FILE: u8 = 0x00;

// Tlopen/Tlcreate flags (Linux open(2) semantics)
pub const L_O_RDONLY: u32 = 0x00000000;
pub const L_O_WRONLY: u32 = 0x00000001;
pub const L_O_RDWR: u32 = 0x00000002;
pub const L_O_ACCMODE: u32 = 0x00000003;
pub const L_O_CREAT: u32 = 0x00000040;
pub const L_O_EXCL: u32 = 0x00000080;
pub const L_O_TRUNC: u32 = 0x00000200;
pub const L_O_APPEND: u32 = 0x00000400;
pub const L_O_DSYNC: u32 = 0x00001000;
pub const L_O_DIRECT: u32 = 0x00004000;
pub const L_O_LARGEFILE: u32 = 0x00008000;
pub const L_O_DIRECTORY: u32 = 0x00010000;
pub const L_O_NOFOLLOW: u32 = 0x00020000;
pub const L_O_NOATIME: u32 = 0x00040000;
pub const L_O_SYNC: u32 = 0x00100000;

// Tgetattr request mask
pub const GETATTR_MODE: u64 = 0x00000001;
pub const GETATTR_NLINK: u64 = 0x00000002;
pub const GETATTR_UID: u64 = 0x00000004;
pub const GETATTR_GID: u64 = 0x00000008;
pub const GETATTR_RDEV: u64 = 0x00000010;
pub const GETATTR_ATIME: u64 = 0x00000020;
pub const GETATTR_MTIME: u64 = 0x00000040;
pub const GETATTR_CTIME: u64 = 0x00000080;
pub const GETATTR_INO: u64 = 0x00000100;
pub const GETATTR_SIZE: u64 = 0x00000200;
pub const GETATTR_BLOCKS: u64 = 0x00000400;
pub const GETATTR_BTIME: u64 = 0x00000800;
pub const GETATTR_GEN: u64 = 0x00001000;
pub const GETATTR_DATA_VERSION: u64 = 0x00002000;
pub const GETATTR_BASIC: u64 = 0x000007ff;
pub const GETATTR_ALL: u64 = 0x00003fff;

// Tsetattr valid bits
pub const SETATTR_MODE: u32 = 0x00000001;
pub const SETATTR_UID: u32 = 0x00000002;
pub const SETATTR_GID: u32 = 0x00000004;
pub const SETATTR_SIZE: u32 = 0x00000008;
pub const SETATTR_ATIME: u32 = 0x00000010;
pub const SETATTR_MTIME: u32 = 0x00000020;
pub const SETATTR_CTIME: u32 = 0x00000040;
pub const SETATTR_ATIME_SET: u32 = 0x00000080;
pub const SETATTR_MTIME_SET: u32 = 0x00000100;

/// Tunlinkat flag for directories.
pub const AT_REMOVEDIR: u32 = 0x200;

/// Server-assigned file identity: 13 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct Qid {
    pub type_: u8,
    #[deku(endian = "little")]
    pub version: u32,
    #[deku(endian = "little")]
    pub path: u64,
}

impl Qid {
    pub fn is_dir(&self) -> bool {
        self.type_ & QT_DIR != 0
    }

    pub fn is_symlink(&self) -> bool {
        self.type_ & QT_SYMLINK != 0
    }
}

impl Default for Qid {
    fn default() -> Self {
        Qid { type_: QT_FILE, version: 0, path: 0 }
    }
}

/// The 17-field attribute record carried by Rgetattr.
#[derive(Debug, Clone, Default, PartialEq, DekuRead, DekuWrite)]
pub struct Stat {
    pub qid: Qid,
    #[deku(endian = "little")]
    pub mode: u32,
    #[deku(endian = "little")]
    pub uid: u32,
    #[deku(endian = "little")]
    pub gid: u32,
    #[deku(endian = "little")]
    pub nlink: u64,
    #[deku(endian = "little")]
    pub rdev: u64,
    #[deku(endian = "little")]
    pub size: u64,
    #[deku(endian = "little")]
    pub blksize: u64,
    #[deku(endian = "little")]
    pub blocks: u64,
    #[deku(endian = "little")]
    pub atime_sec: u64,
    #[deku(endian = "little")]
    pub atime_nsec: u64,
    #[deku(endian = "little")]
    pub mtime_sec: u64,
    #[deku(endian = "little")]
    pub mtime_nsec: u64,
    #[deku(endian = "little")]
    pub ctime_sec: u64,
    #[deku(endian = "little")]
    pub ctime_nsec: u64,
    #[deku(endian = "little")]
    pub btime_sec: u64,
    #[deku(endian = "little")]
    pub btime_nsec: u64,
    #[deku(endian = "little")]
    pub r#gen: u64,
    #[deku(endian = "little")]
    pub data_version: u64,
}

/// Length-prefixed protocol string, no trailing NUL.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct P9String {
    #[deku(endian = "little", update = "self.data.len()")]
    pub len: u16,
    #[deku(count = "len")]
    pub data: Vec<u8>,
}

impl P9String {
    pub fn new(s: &str) -> Self {
        let data = s.as_bytes().to_vec();
        Self {
            len: data.len() as u16,
            data,
        }
    }

    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.data)
    }

    /// Encoded size on the wire.
    pub fn wire_len(&self) -> usize {
        2 + self.data.len()
    }
}

/// One Rreaddir entry: qid, continuation offset, dirent type, name.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct DirEntry {
    pub qid: Qid,
    #[deku(endian = "little")]
    pub offset: u64,
    pub type_: u8,
    pub name: P9String,
}

impl DirEntry {
    /// Parse one entry from the front of `data`, returning the entry and
    /// the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), DekuError> {
        let ((rest, _), entry) = Self::from_bytes((data, 0))?;
        Ok((entry, data.len() - rest.len()))
    }
}

/// Parse every entry in an Rreaddir payload.
pub fn parse_dir_entries(mut data: &[u8]) -> Result<Vec<DirEntry>, DekuError> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let (entry, used) = DirEntry::parse(data)?;
        entries.push(entry);
        data = &data[used..];
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tversion {
    #[deku(endian = "little")]
    pub msize: u32,
    pub version: P9String,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rversion {
    #[deku(endian = "little")]
    pub msize: u32,
    pub version: P9String,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tattach {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub afid: u32,
    pub uname: P9String,
    pub aname: P9String,
    #[deku(endian = "little")]
    pub n_uname: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rattach {
    pub qid: Qid,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tflush {
    #[deku(endian = "little")]
    pub oldtag: u16,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rflush;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Twalk {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub newfid: u32,
    #[deku(endian = "little", update = "self.wnames.len()")]
    pub nwname: u16,
    #[deku(count = "nwname")]
    pub wnames: Vec<P9String>,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rwalk {
    #[deku(endian = "little", update = "self.wqids.len()")]
    pub nwqid: u16,
    #[deku(count = "nwqid")]
    pub wqids: Vec<Qid>,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tlopen {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rlopen {
    pub qid: Qid,
    #[deku(endian = "little")]
    pub iounit: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tlcreate {
    #[deku(endian = "little")]
    pub fid: u32,
    pub name: P9String,
    #[deku(endian = "little")]
    pub flags: u32,
    #[deku(endian = "little")]
    pub mode: u32,
    #[deku(endian = "little")]
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rlcreate {
    pub qid: Qid,
    #[deku(endian = "little")]
    pub iounit: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tread {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub offset: u64,
    #[deku(endian = "little")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rread {
    #[deku(endian = "little", update = "self.data.len()")]
    pub count: u32,
    #[deku(count = "count")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Twrite {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub offset: u64,
    #[deku(endian = "little", update = "self.data.len()")]
    pub count: u32,
    #[deku(count = "count")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rwrite {
    #[deku(endian = "little")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tclunk {
    #[deku(endian = "little")]
    pub fid: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rclunk;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tremove {
    #[deku(endian = "little")]
    pub fid: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rremove;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tgetattr {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub request_mask: u64,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rgetattr {
    #[deku(endian = "little")]
    pub valid: u64,
    pub stat: Stat,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tsetattr {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub valid: u32,
    #[deku(endian = "little")]
    pub mode: u32,
    #[deku(endian = "little")]
    pub uid: u32,
    #[deku(endian = "little")]
    pub gid: u32,
    #[deku(endian = "little")]
    pub size: u64,
    #[deku(endian = "little")]
    pub atime_sec: u64,
    #[deku(endian = "little")]
    pub atime_nsec: u64,
    #[deku(endian = "little")]
    pub mtime_sec: u64,
    #[deku(endian = "little")]
    pub mtime_nsec: u64,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rsetattr;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Treaddir {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub offset: u64,
    #[deku(endian = "little")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rreaddir {
    #[deku(endian = "little", update = "self.data.len()")]
    pub count: u32,
    #[deku(count = "count")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tfsync {
    #[deku(endian = "little")]
    pub fid: u32,
    #[deku(endian = "little")]
    pub datasync: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rfsync;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tmkdir {
    #[deku(endian = "little")]
    pub dfid: u32,
    pub name: P9String,
    #[deku(endian = "little")]
    pub mode: u32,
    #[deku(endian = "little")]
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rmkdir {
    pub qid: Qid,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tsymlink {
    #[deku(endian = "little")]
    pub dfid: u32,
    pub name: P9String,
    pub symtgt: P9String,
    #[deku(endian = "little")]
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rsymlink {
    pub qid: Qid,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Treadlink {
    #[deku(endian = "little")]
    pub fid: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rreadlink {
    pub target: P9String,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tlink {
    #[deku(endian = "little")]
    pub dfid: u32,
    #[deku(endian = "little")]
    pub fid: u32,
    pub name: P9String,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rlink;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Trenameat {
    #[deku(endian = "little")]
    pub olddirfid: u32,
    pub oldname: P9String,
    #[deku(endian = "little")]
    pub newdirfid: u32,
    pub newname: P9String,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rrenameat;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tunlinkat {
    #[deku(endian = "little")]
    pub dirfid: u32,
    pub name: P9String,
    #[deku(endian = "little")]
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Runlinkat;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Tstatfs {
    #[deku(endian = "little")]
    pub fid: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rstatfs {
    #[deku(endian = "little")]
    pub r#type: u32,
    #[deku(endian = "little")]
    pub bsize: u32,
    #[deku(endian = "little")]
    pub blocks: u64,
    #[deku(endian = "little")]
    pub bfree: u64,
    #[deku(endian = "little")]
    pub bavail: u64,
    #[deku(endian = "little")]
    pub files: u64,
    #[deku(endian = "little")]
    pub ffree: u64,
    #[deku(endian = "little")]
    pub fsid: u64,
    #[deku(endian = "little")]
    pub namelen: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct Rlerror {
    #[deku(endian = "little")]
    pub ecode: u32,
}

/// Typed message payload. The discriminant comes from the frame header,
/// so the enum is read with the header's type byte as context.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(ctx = "_type: u8", id = "_type")]
pub enum Message {
    #[deku(id = "7")]
    Rlerror(Rlerror),
    #[deku(id = "8")]
    Tstatfs(Tstatfs),
    #[deku(id = "9")]
    Rstatfs(Rstatfs),
    #[deku(id = "12")]
    Tlopen(Tlopen),
    #[deku(id = "13")]
    Rlopen(Rlopen),
    #[deku(id = "14")]
    Tlcreate(Tlcreate),
    #[deku(id = "15")]
    Rlcreate(Rlcreate),
    #[deku(id = "16")]
    Tsymlink(Tsymlink),
    #[deku(id = "17")]
    Rsymlink(Rsymlink),
    #[deku(id = "22")]
    Treadlink(Treadlink),
    #[deku(id = "23")]
    Rreadlink(Rreadlink),
    #[deku(id = "24")]
    Tgetattr(Tgetattr),
    #[deku(id = "25")]
    Rgetattr(Rgetattr),
    #[deku(id = "26")]
    Tsetattr(Tsetattr),
    #[deku(id = "27")]
    Rsetattr(Rsetattr),
    #[deku(id = "40")]
    Treaddir(Treaddir),
    #[deku(id = "41")]
    Rreaddir(Rreaddir),
    #[deku(id = "50")]
    Tfsync(Tfsync),
    #[deku(id = "51")]
    Rfsync(Rfsync),
    #[deku(id = "70")]
    Tlink(Tlink),
    #[deku(id = "71")]
    Rlink(Rlink),
    #[deku(id = "72")]
    Tmkdir(Tmkdir),
    #[deku(id = "73")]
    Rmkdir(Rmkdir),
    #[deku(id = "74")]
    Trenameat(Trenameat),
    #[deku(id = "75")]
    Rrenameat(Rrenameat),
    #[deku(id = "76")]
    Tunlinkat(Tunlinkat),
    #[deku(id = "77")]
    Runlinkat(Runlinkat),
    #[deku(id = "100")]
    Tversion(Tversion),
    #[deku(id = "101")]
    Rversion(Rversion),
    #[deku(id = "104")]
    Tattach(Tattach),
    #[deku(id = "105")]
    Rattach(Rattach),
    #[deku(id = "108")]
    Tflush(Tflush),
    #[deku(id = "109")]
    Rflush(Rflush),
    #[deku(id = "110")]
    Twalk(Twalk),
    #[deku(id = "111")]
    Rwalk(Rwalk),
    #[deku(id = "116")]
    Tread(Tread),
    #[deku(id = "117")]
    Rread(Rread),
    #[deku(id = "118")]
    Twrite(Twrite),
    #[deku(id = "119")]
    Rwrite(Rwrite),
    #[deku(id = "120")]
    Tclunk(Tclunk),
    #[deku(id = "121")]
    Rclunk(Rclunk),
    #[deku(id = "122")]
    Tremove(Tremove),
    #[deku(id = "123")]
    Rremove(Rremove),
}

impl Message {
    /// Wire type code of this payload.
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Rlerror(_) => 7,
            Message::Tstatfs(_) => 8,
            Message::Rstatfs(_) => 9,
            Message::Tlopen(_) => 12,
            Message::Rlopen(_) => 13,
            Message::Tlcreate(_) => 14,
            Message::Rlcreate(_) => 15,
            Message::Tsymlink(_) => 16,
            Message::Rsymlink(_) => 17,
            Message::Treadlink(_) => 22,
            Message::Rreadlink(_) => 23,
            Message::Tgetattr(_) => 24,
            Message::Rgetattr(_) => 25,
            Message::Tsetattr(_) => 26,
            Message::Rsetattr(_) => 27,
            Message::Treaddir(_) => 40,
            Message::Rreaddir(_) => 41,
            Message::Tfsync(_) => 50,
            Message::Rfsync(_) => 51,
            Message::Tlink(_) => 70,
            Message::Rlink(_) => 71,
            Message::Tmkdir(_) => 72,
            Message::Rmkdir(_) => 73,
            Message::Trenameat(_) => 74,
            Message::Rrenameat(_) => 75,
            Message::Tunlinkat(_) => 76,
            Message::Runlinkat(_) => 77,
            Message::Tversion(_) => 100,
            Message::Rversion(_) => 101,
            Message::Tattach(_) => 104,
            Message::Rattach(_) => 105,
            Message::Tflush(_) => 108,
            Message::Rflush(_) => 109,
            Message::Twalk(_) => 110,
            Message::Rwalk(_) => 111,
            Message::Tread(_) => 116,
            Message::Rread(_) => 117,
            Message::Twrite(_) => 118,
            Message::Rwrite(_) => 119,
            Message::Tclunk(_) => 120,
            Message::Rclunk(_) => 121,
            Message::Tremove(_) => 122,
            Message::Rremove(_) => 123,
        }
    }
}

/// A complete frame: header plus typed payload.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct P9Message {
    #[deku(endian = "little")]
    pub size: u32,
    pub type_: u8,
    #[deku(endian = "little")]
    pub tag: u16,
    #[deku(ctx = "*type_")]
    pub body: Message,
}

impl P9Message {
    pub fn new(tag: u16, body: Message) -> Self {
        Self {
            size: 0, // patched in to_bytes
            type_: body.type_code(),
            tag,
            body,
        }
    }

    /// Serialize the frame, back-patching `size` with the final length.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DekuError> {
        use std::io::Cursor;

        let mut bytes = Vec::new();
        let mut cursor = Cursor::new(&mut bytes);
        let mut writer = Writer::new(&mut cursor);
        self.to_writer(&mut writer, ())?;
        drop(writer);

        let size = bytes.len() as u32;
        bytes[0..4].copy_from_slice(&size.to_le_bytes());

        Ok(bytes)
    }

    /// Parse one complete frame.
    pub fn parse(frame: &[u8]) -> Result<Self, DekuError> {
        let (_, msg) = Self::from_bytes((frame, 0))?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_is_backpatched() {
        let msg = P9Message::new(
            NOTAG,
            Message::Tversion(Tversion {
                msize: 65536,
                version: P9String::new(VERSION_9P2000L),
            }),
        );
        let bytes = msg.to_bytes().unwrap();

        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(size as usize, bytes.len());
        // header + msize[4] + strlen[2] + "9P2000.L"
        assert_eq!(bytes.len(), 7 + 4 + 2 + 8);
        assert_eq!(bytes[4], TVERSION);
        assert_eq!(u16::from_le_bytes(bytes[5..7].try_into().unwrap()), NOTAG);
    }

    #[test]
    fn version_roundtrip() {
        let msg = P9Message::new(
            NOTAG,
            Message::Rversion(Rversion {
                msize: 8192,
                version: P9String::new(VERSION_9P2000L),
            }),
        );
        let bytes = msg.to_bytes().unwrap();
        let parsed = P9Message::parse(&bytes).unwrap();
        assert_eq!(parsed.size as usize, bytes.len());
        assert_eq!(parsed.tag, NOTAG);
        assert_eq!(parsed.body, msg.body);
    }

    #[test]
    fn walk_roundtrip_preserves_names() {
        let msg = P9Message::new(
            3,
            Message::Twalk(Twalk {
                fid: 0,
                newfid: 7,
                nwname: 2,
                wnames: vec![P9String::new("usr"), P9String::new("share")],
            }),
        );
        let bytes = msg.to_bytes().unwrap();
        let parsed = P9Message::parse(&bytes).unwrap();
        match parsed.body {
            Message::Twalk(tw) => {
                assert_eq!(tw.fid, 0);
                assert_eq!(tw.newfid, 7);
                assert_eq!(tw.nwname, 2);
                assert_eq!(tw.wnames[0].as_str().unwrap(), "usr");
                assert_eq!(tw.wnames[1].as_str().unwrap(), "share");
            }
            other => panic!("expected Twalk, got {other:?}"),
        }
    }

    #[test]
    fn qid_is_13_bytes() {
        let msg = P9Message::new(
            1,
            Message::Rattach(Rattach {
                qid: Qid { type_: QT_DIR, version: 9, path: 0xDEADBEEF },
            }),
        );
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), 7 + QID_SIZE as usize);

        let parsed = P9Message::parse(&bytes).unwrap();
        match parsed.body {
            Message::Rattach(ra) => {
                assert!(ra.qid.is_dir());
                assert_eq!(ra.qid.version, 9);
                assert_eq!(ra.qid.path, 0xDEADBEEF);
            }
            other => panic!("expected Rattach, got {other:?}"),
        }
    }

    #[test]
    fn getattr_stat_roundtrip() {
        let stat = Stat {
            qid: Qid { type_: QT_FILE, version: 1, path: 42 },
            mode: 0o100644,
            uid: 1000,
            gid: 100,
            nlink: 1,
            size: 4096,
            blksize: 4096,
            blocks: 8,
            atime_sec: 1700000000,
            mtime_sec: 1700000001,
            ctime_sec: 1700000002,
            ..Default::default()
        };
        let msg = P9Message::new(
            5,
            Message::Rgetattr(Rgetattr { valid: GETATTR_BASIC, stat: stat.clone() }),
        );
        let bytes = msg.to_bytes().unwrap();
        let parsed = P9Message::parse(&bytes).unwrap();
        match parsed.body {
            Message::Rgetattr(rg) => {
                assert_eq!(rg.valid, GETATTR_BASIC);
                assert_eq!(rg.stat, stat);
            }
            other => panic!("expected Rgetattr, got {other:?}"),
        }
    }

    #[test]
    fn rlerror_carries_errno() {
        let msg = P9Message::new(2, Message::Rlerror(Rlerror { ecode: libc::ENOENT as u32 }));
        let bytes = msg.to_bytes().unwrap();
        let parsed = P9Message::parse(&bytes).unwrap();
        assert_eq!(parsed.type_, RLERROR);
        match parsed.body {
            Message::Rlerror(e) => assert_eq!(e.ecode, libc::ENOENT as u32),
            other => panic!("expected Rlerror, got {other:?}"),
        }
    }

    #[test]
    fn write_payload_is_embedded_once() {
        let data = vec![0xAB; 300];
        let msg = P9Message::new(
            9,
            Message::Twrite(Twrite {
                fid: 4,
                offset: 1024,
                count: data.len() as u32,
                data: data.clone(),
            }),
        );
        let bytes = msg.to_bytes().unwrap();
        // size[4] type[1] tag[2] fid[4] offset[8] count[4] data
        assert_eq!(bytes.len(), 23 + data.len());
        assert_eq!(&bytes[23..], &data[..]);
    }

    #[test]
    fn dir_entry_stream_parses_in_order() {
        let entries = vec![
            DirEntry {
                qid: Qid { type_: QT_FILE, version: 0, path: 2 },
                offset: 1,
                type_: 0,
                name: P9String::new("test.txt"),
            },
            DirEntry {
                qid: Qid { type_: QT_DIR, version: 0, path: 3 },
                offset: 2,
                type_: 4,
                name: P9String::new("sub"),
            },
        ];
        let mut data = Vec::new();
        for e in &entries {
            data.extend_from_slice(&DekuContainerWrite::to_bytes(e).unwrap());
        }

        let parsed = parse_dir_entries(&data).unwrap();
        assert_eq!(parsed, entries);

        // prefix parse consumes exactly one record
        let (first, used) = DirEntry::parse(&data).unwrap();
        assert_eq!(first, entries[0]);
        assert_eq!(used, 13 + 8 + 1 + 2 + "test.txt".len());
    }

    #[test]
    fn truncated_entry_is_rejected() {
        let entry = DirEntry {
            qid: Qid { type_: QT_FILE, version: 0, path: 2 },
            offset: 1,
            type_: 0,
            name: P9String::new("file"),
        };
        let data = DekuContainerWrite::to_bytes(&entry).unwrap();
        assert!(parse_dir_entries(&data[..data.len() - 1]).is_err());
    }
}
