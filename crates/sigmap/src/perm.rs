//! Open modes, permission bits, qids and stat records

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::ids::Qpath;

/// Open mode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Mode(pub u32);

impl Mode {
    pub const OREAD: Mode = Mode(0x0);
    pub const OWRITE: Mode = Mode(0x1);
    pub const ORDWR: Mode = Mode(0x2);
    pub const OEXEC: Mode = Mode(0x3);
    pub const OTRUNC: Mode = Mode(0x10);
    pub const ORCLOSE: Mode = Mode(0x40);
    pub const OAPPEND: Mode = Mode(0x80);
    /// Create: if the name exists, wait for it to be removed and retry
    pub const OWATCH: Mode = Mode(0x100);

    const ACCESS: u32 = 0x3;

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn can_read(self) -> bool {
        matches!(self.0 & Self::ACCESS, 0x0 | 0x2 | 0x3)
    }

    pub fn can_write(self) -> bool {
        matches!(self.0 & Self::ACCESS, 0x1 | 0x2)
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

/// Permission bits plus the directory and ephemeral type bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Perm(pub u32);

impl Perm {
    pub const DMDIR: Perm = Perm(0x8000_0000);
    /// Removed when the creating session ends or its lease expires
    pub const DMTMP: Perm = Perm(0x0400_0000);

    pub fn is_dir(self) -> bool {
        self.0 & Self::DMDIR.0 != 0
    }

    pub fn is_ephemeral(self) -> bool {
        self.0 & Self::DMTMP.0 != 0
    }
}

impl BitOr for Perm {
    type Output = Perm;

    fn bitor(self, rhs: Perm) -> Perm {
        Perm(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QType {
    Dir,
    File,
}

/// Server identity of an object at a given version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qid {
    pub kind: QType,
    pub version: u32,
    pub path: Qpath,
}

impl Qid {
    pub fn is_dir(&self) -> bool {
        self.kind == QType::Dir
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub qid: Qid,
    pub perm: Perm,
    pub length: u64,
    pub name: String,
}
