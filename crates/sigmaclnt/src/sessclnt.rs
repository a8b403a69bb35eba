//! One session over one connection

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use demux::DemuxClnt;
use sigmap::{
    framed, CallReader, CallWriter, ClientId, Fcall, Fence, Msg, SeqCounter, Seqno, SessionId,
    SigmaError, Tag, MAX_FRAME, VERSION,
};

/// A client session
///
/// Every call gets a fresh tag for the demux layer and a fresh seqno for the
/// server's reply cache. Each fcall also carries the lowest seqno still
/// waiting for a reply, which lets the server drop cached replies below it.
pub struct SessClnt {
    dmx: DemuxClnt<Fcall>,
    sid: SessionId,
    client: ClientId,
    tags: SeqCounter,
    seqnos: SeqCounter,
    outstanding: Mutex<BTreeSet<u64>>,
    heartbeats: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps a seqno outstanding until its call returns or is dropped
struct InFlight<'a> {
    outstanding: &'a Mutex<BTreeSet<u64>>,
    seqno: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.outstanding.lock().remove(&self.seqno);
    }
}

impl SessClnt {
    /// Dial `addr` and negotiate the protocol version
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>, SigmaError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SigmaError::Unreachable(format!("{addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, "set_nodelay: {}", e);
        }
        let (reader, writer) = framed(stream);
        let sess = Arc::new(Self::from_transport(reader, writer));
        sess.version().await?;
        Ok(sess)
    }

    /// Session over an already established transport, with fresh random ids
    pub fn from_transport<R, W>(reader: R, writer: W) -> Self
    where
        R: CallReader<Fcall> + 'static,
        W: CallWriter<Fcall> + 'static,
    {
        Self {
            dmx: DemuxClnt::new(reader, writer),
            sid: SessionId(rand::random()),
            client: ClientId(rand::random()),
            tags: SeqCounter::new(0),
            seqnos: SeqCounter::new(0),
            outstanding: Mutex::new(BTreeSet::new()),
            heartbeats: Mutex::new(None),
        }
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub async fn version(&self) -> Result<u32, SigmaError> {
        let msg = Msg::Tversion {
            msize: MAX_FRAME as u32,
            version: VERSION.into(),
        };
        match self.rpc(msg, None).await? {
            Msg::Rversion { msize, version } if version == VERSION => Ok(msize),
            Msg::Rversion { version, .. } => Err(SigmaError::Version(version)),
            m => Err(unexpected(&m)),
        }
    }

    /// Send `msg` and wait for its reply; an `Rerror` comes back as `Err`
    pub async fn rpc(&self, msg: Msg, fence: Option<Fence>) -> Result<Msg, SigmaError> {
        let seqno = self.seqnos.next();
        let acked = {
            let mut outstanding = self.outstanding.lock();
            outstanding.insert(seqno);
            outstanding.first().copied().unwrap_or(seqno)
        };
        let _inflight = InFlight {
            outstanding: &self.outstanding,
            seqno,
        };

        let mut fc = Fcall::new(self.sid, self.client, Seqno(seqno), msg)
            .with_tag(Tag(self.tags.next()))
            .with_fence(fence);
        fc.acked = Seqno(acked);
        let reply = self.dmx.send_receive(fc).await?;
        reply.msg.into_result()
    }

    /// Keep the session alive with a heartbeat every `period`
    pub fn start_heartbeats(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let Some(sess) = weak.upgrade() else {
                    return;
                };
                let msg = Msg::Theartbeat {
                    sessions: vec![sess.sid],
                };
                match sess.rpc(msg, None).await {
                    Ok(Msg::Rheartbeat { sessions }) if sessions.contains(&sess.sid) => {}
                    Ok(_) => debug!(sid = %sess.sid, "server no longer knows the session"),
                    Err(e) if e.is_unreachable() => return,
                    Err(e) => debug!(sid = %sess.sid, "heartbeat: {}", e),
                }
            }
        });
        if let Some(old) = self.heartbeats.lock().replace(task) {
            old.abort();
        }
    }

    /// End the session on the server
    pub async fn detach(&self) -> Result<(), SigmaError> {
        match self.rpc(Msg::Tdetach, None).await? {
            Msg::Rdetach => Ok(()),
            m => Err(unexpected(&m)),
        }
    }

    /// Drop the connection; the server closes the session on its own
    pub async fn close(&self) {
        if let Some(task) = self.heartbeats.lock().take() {
            task.abort();
        }
        self.dmx.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.dmx.is_closed()
    }
}

impl Drop for SessClnt {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeats.lock().take() {
            task.abort();
        }
    }
}

pub(crate) fn unexpected(m: &Msg) -> SigmaError {
    SigmaError::BadFcall(format!("unexpected reply {}", m.name()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::oneshot;

    use super::*;
    use sigmap::Fid;

    #[tokio::test]
    async fn test_acked_trails_the_oldest_outstanding_call() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (r, w) = framed(client_io);
        let sess = Arc::new(SessClnt::from_transport(r, w));

        // seqno 1 stays unanswered until seqno 3 has arrived
        let (acks_tx, acks_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut sr, mut sw) = framed(server_io);
            let mut acks = BTreeMap::new();
            let mut held: Option<Fcall> = None;
            while acks.len() < 4 {
                let fc: Fcall = sr.read_call().await.unwrap();
                acks.insert(fc.seqno, fc.acked);
                if fc.seqno == Seqno(1) && !acks.contains_key(&Seqno(3)) {
                    held = Some(fc);
                    continue;
                }
                if fc.seqno == Seqno(3) {
                    if let Some(first) = held.take() {
                        sw.write_call(&first.reply(Msg::Rclunk)).await.unwrap();
                    }
                }
                sw.write_call(&fc.reply(Msg::Rclunk)).await.unwrap();
            }
            let _ = acks_tx.send(acks.into_values().collect::<Vec<_>>());
        });

        let clunk = |n| Msg::Tclunk { fid: Fid(n) };
        let first = tokio::spawn({
            let sess = sess.clone();
            async move { sess.rpc(clunk(1), None).await }
        });
        while sess.outstanding.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        sess.rpc(clunk(2), None).await.unwrap();
        sess.rpc(clunk(3), None).await.unwrap();
        first.await.unwrap().unwrap();
        sess.rpc(clunk(4), None).await.unwrap();

        let acks = acks_rx.await.unwrap();
        assert_eq!(acks, vec![Seqno(1), Seqno(1), Seqno(1), Seqno(4)]);
    }

    #[tokio::test]
    async fn test_rerror_is_an_err() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (r, w) = framed(client_io);
        let sess = SessClnt::from_transport(r, w);
        tokio::spawn(async move {
            let (mut sr, mut sw) = framed(server_io);
            let fc: Fcall = sr.read_call().await.unwrap();
            let e = SigmaError::UnknownFid(Fid(3));
            sw.write_call(&fc.reply(Msg::Rerror(e))).await.unwrap();
        });
        let r = sess.rpc(Msg::Tstat { fid: Fid(3) }, None).await;
        assert_eq!(r, Err(SigmaError::UnknownFid(Fid(3))));
    }
}
