//! The fcall envelope and the sigmaP message set

use serde::{Deserialize, Serialize};

use crate::error::SigmaError;
use crate::fence::{Fence, FenceId};
use crate::ids::{ClientId, Fid, LeaseId, Seqno, SessionId, Tag};
use crate::perm::{Mode, Perm, Qid, Stat};

/// One request or reply on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fcall {
    pub tag: Tag,
    pub client: ClientId,
    pub session: SessionId,
    pub seqno: Seqno,
    /// Every reply for a seqno below this one has reached the client
    pub acked: Seqno,
    pub fence: Option<Fence>,
    pub msg: Msg,
}

impl Fcall {
    pub fn new(session: SessionId, client: ClientId, seqno: Seqno, msg: Msg) -> Self {
        Self {
            tag: Tag::NONE,
            client,
            session,
            seqno,
            acked: Seqno::default(),
            fence: None,
            msg,
        }
    }

    /// Reply envelope addressed to the sender of `self`
    pub fn reply(&self, msg: Msg) -> Fcall {
        Fcall {
            tag: self.tag,
            client: self.client,
            session: self.session,
            seqno: self.seqno,
            acked: Seqno::default(),
            fence: None,
            msg,
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_fence(mut self, fence: Option<Fence>) -> Self {
        self.fence = fence;
        self
    }
}

/// Directory listing entry returned by reads of a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub qid: Qid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tattach {
        fid: Fid,
        uname: String,
        aname: String,
    },
    Rattach {
        qid: Qid,
    },
    /// Walk `fid` along `wnames` binding the result to `newfid`; no names clones
    Twalk {
        fid: Fid,
        newfid: Fid,
        wnames: Vec<String>,
    },
    Rwalk {
        qids: Vec<Qid>,
    },
    Topen {
        fid: Fid,
        mode: Mode,
    },
    Ropen {
        qid: Qid,
    },
    Tcreate {
        fid: Fid,
        name: String,
        perm: Perm,
        mode: Mode,
        lease: Option<LeaseId>,
    },
    Rcreate {
        qid: Qid,
    },
    Tread {
        fid: Fid,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Vec<u8>,
    },
    Twrite {
        fid: Fid,
        offset: u64,
        data: Vec<u8>,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: Fid,
    },
    Rclunk,
    Tremove {
        fid: Fid,
    },
    Rremove,
    Tremovefile {
        fid: Fid,
        wnames: Vec<String>,
    },
    Tstat {
        fid: Fid,
    },
    Rstat {
        stat: Stat,
    },
    /// Change the name (within the same directory) and/or truncate
    Twstat {
        fid: Fid,
        name: Option<String>,
        length: Option<u64>,
    },
    Rwstat,
    Trenameat {
        oldfid: Fid,
        oldname: String,
        newfid: Fid,
        newname: String,
    },
    Rrenameat,
    Tgetfile {
        fid: Fid,
        wnames: Vec<String>,
        mode: Mode,
        offset: u64,
        count: u32,
    },
    Tputfile {
        fid: Fid,
        wnames: Vec<String>,
        mode: Mode,
        perm: Perm,
        offset: u64,
        data: Vec<u8>,
        lease: Option<LeaseId>,
    },
    /// Block until the directory differs from the version the fid last saw
    Twatch {
        fid: Fid,
    },
    Rwatch,
    Tdetach,
    Rdetach,
    Theartbeat {
        sessions: Vec<SessionId>,
    },
    Rheartbeat {
        sessions: Vec<SessionId>,
    },
    Tlease {
        ttl_ms: u64,
    },
    Rlease {
        lease: LeaseId,
    },
    Trenew {
        lease: LeaseId,
    },
    Rrenew,
    /// End a lease now, removing the files bound to it
    Trevoke {
        lease: LeaseId,
    },
    Rrevoke,
    Tfence {
        fence: Fence,
    },
    Rfence,
    Tunfence {
        id: FenceId,
    },
    Runfence,
    Rerror(SigmaError),
}

impl Msg {
    pub fn name(&self) -> &'static str {
        match self {
            Msg::Tversion { .. } => "Tversion",
            Msg::Rversion { .. } => "Rversion",
            Msg::Tattach { .. } => "Tattach",
            Msg::Rattach { .. } => "Rattach",
            Msg::Twalk { .. } => "Twalk",
            Msg::Rwalk { .. } => "Rwalk",
            Msg::Topen { .. } => "Topen",
            Msg::Ropen { .. } => "Ropen",
            Msg::Tcreate { .. } => "Tcreate",
            Msg::Rcreate { .. } => "Rcreate",
            Msg::Tread { .. } => "Tread",
            Msg::Rread { .. } => "Rread",
            Msg::Twrite { .. } => "Twrite",
            Msg::Rwrite { .. } => "Rwrite",
            Msg::Tclunk { .. } => "Tclunk",
            Msg::Rclunk => "Rclunk",
            Msg::Tremove { .. } => "Tremove",
            Msg::Rremove => "Rremove",
            Msg::Tremovefile { .. } => "Tremovefile",
            Msg::Tstat { .. } => "Tstat",
            Msg::Rstat { .. } => "Rstat",
            Msg::Twstat { .. } => "Twstat",
            Msg::Rwstat => "Rwstat",
            Msg::Trenameat { .. } => "Trenameat",
            Msg::Rrenameat => "Rrenameat",
            Msg::Tgetfile { .. } => "Tgetfile",
            Msg::Tputfile { .. } => "Tputfile",
            Msg::Twatch { .. } => "Twatch",
            Msg::Rwatch => "Rwatch",
            Msg::Tdetach => "Tdetach",
            Msg::Rdetach => "Rdetach",
            Msg::Theartbeat { .. } => "Theartbeat",
            Msg::Rheartbeat { .. } => "Rheartbeat",
            Msg::Tlease { .. } => "Tlease",
            Msg::Rlease { .. } => "Rlease",
            Msg::Trenew { .. } => "Trenew",
            Msg::Rrenew => "Rrenew",
            Msg::Trevoke { .. } => "Trevoke",
            Msg::Rrevoke => "Rrevoke",
            Msg::Tfence { .. } => "Tfence",
            Msg::Rfence => "Rfence",
            Msg::Tunfence { .. } => "Tunfence",
            Msg::Runfence => "Runfence",
            Msg::Rerror(_) => "Rerror",
        }
    }

    /// Requests that change server state and therefore honor fences
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Msg::Tcreate { .. }
                | Msg::Twrite { .. }
                | Msg::Tremove { .. }
                | Msg::Tremovefile { .. }
                | Msg::Twstat { .. }
                | Msg::Trenameat { .. }
                | Msg::Tputfile { .. }
        )
    }

    /// Turn an `Rerror` into an `Err`
    pub fn into_result(self) -> Result<Msg, SigmaError> {
        match self {
            Msg::Rerror(e) => Err(e),
            m => Ok(m),
        }
    }
}

impl From<SigmaError> for Msg {
    fn from(e: SigmaError) -> Self {
        Msg::Rerror(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_keeps_routing_fields() {
        let fc = Fcall::new(SessionId(3), ClientId(4), Seqno(5), Msg::Tclunk { fid: Fid(1) })
            .with_tag(Tag(9));
        let r = fc.reply(Msg::Rclunk);
        assert_eq!(r.tag, Tag(9));
        assert_eq!(r.session, SessionId(3));
        assert_eq!(r.client, ClientId(4));
        assert_eq!(r.seqno, Seqno(5));
        assert_eq!(r.msg, Msg::Rclunk);
    }

    #[test]
    fn test_mutations() {
        assert!(Msg::Twrite {
            fid: Fid(1),
            offset: 0,
            data: vec![]
        }
        .is_mutation());
        assert!(!Msg::Tread {
            fid: Fid(1),
            offset: 0,
            count: 1
        }
        .is_mutation());
    }

    #[test]
    fn test_into_result() {
        let err = Msg::Rerror(SigmaError::Exists("x".into())).into_result();
        assert_eq!(err, Err(SigmaError::Exists("x".into())));
        assert_eq!(Msg::Rwatch.into_result(), Ok(Msg::Rwatch));
    }
}
