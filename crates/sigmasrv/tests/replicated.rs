//! FsServer over the in-process replication log

mod common;

use std::sync::Arc;

use sigmap::{Fid, Mode, Msg, Perm, Seqno};
use sigmasrv::{FsServer, LocalLog};

use common::Conn;

async fn replicated() -> (Arc<FsServer>, Arc<LocalLog>) {
    let log = LocalLog::new();
    let fs = FsServer::builder()
        .replicator(log.clone())
        .build()
        .await
        .unwrap();
    assert!(fs.is_replicated());
    (Arc::new(fs), log)
}

fn create(name: &str) -> Msg {
    Msg::Tcreate {
        fid: Fid(0),
        name: name.into(),
        perm: Perm(0o644),
        mode: Mode::OWRITE,
        lease: None,
    }
}

#[tokio::test]
async fn test_redelivered_fcall_applies_once() {
    let (fs, log) = replicated().await;
    let mut c = Conn::new(&fs, 7);
    c.attach().await;
    let r = c.call(create("once")).await;
    let Msg::Rcreate { qid } = r else {
        panic!("{r:?}");
    };
    assert_eq!(log.len(), 2);

    // the create committed again, as after a leader change
    log.redeliver(2).unwrap().await.unwrap();
    assert_eq!(fs.stats().duplicates, 1);
    assert_eq!(c.ls_root().await, vec!["once"]);

    // a client retry gets the cached reply without a new log entry
    let mut retry = c.fcall(create("once"));
    retry.seqno = Seqno(2);
    let tag = c.send(retry);
    assert_eq!(c.reply(tag).await, Msg::Rcreate { qid });
    assert_eq!(log.len(), 2);
}

#[tokio::test]
async fn test_cached_errors_replay_identically() {
    let (fs, _log) = replicated().await;
    let mut c = Conn::new(&fs, 8);
    c.attach().await;
    let r = c.call(Msg::Tstat { fid: Fid(9) }).await;
    assert!(matches!(r, Msg::Rerror(_)));

    let mut retry = c.fcall(Msg::Tstat { fid: Fid(9) });
    retry.seqno = Seqno(2);
    let tag = c.send(retry);
    assert_eq!(c.reply(tag).await, r);
}

#[tokio::test]
async fn test_acked_replies_are_pruned() {
    let (fs, log) = replicated().await;
    let mut c = Conn::new(&fs, 9);
    c.attach().await;
    c.call(create("a")).await;

    // everything below seqno 3 has been seen, so those replies may go
    let mut fc = c.fcall(Msg::Tstat { fid: Fid(0) });
    fc.acked = Seqno(3);
    let tag = c.send(fc);
    assert!(matches!(c.reply(tag).await, Msg::Rstat { .. }));
    assert_eq!(log.len(), 3);

    // a late duplicate of a pruned fcall is skipped, and a client retry of
    // it is refused rather than run a second time
    log.redeliver(2).unwrap().await.unwrap();
    assert_eq!(fs.stats().duplicates, 1);
    let mut late = c.fcall(create("a"));
    late.seqno = Seqno(2);
    let tag = c.send(late);
    assert!(matches!(c.reply(tag).await, Msg::Rerror(e) if e.is_stale()));
    assert_eq!(fs.stats().duplicates, 2);
    assert_eq!(c.ls_root().await, vec!["a"]);
    assert!(matches!(c.call(Msg::Tstat { fid: Fid(0) }).await, Msg::Rstat { .. }));
}

#[tokio::test]
async fn test_detach_through_the_log() {
    let (fs, log) = replicated().await;
    let mut c = Conn::new(&fs, 10);
    c.attach().await;
    c.call(Msg::Tcreate {
        fid: Fid(0),
        name: "eph".into(),
        perm: Perm::DMTMP | Perm(0o644),
        mode: Mode::OWRITE,
        lease: None,
    })
    .await;
    assert_eq!(c.call(Msg::Tdetach).await, Msg::Rdetach);
    assert_eq!(log.len(), 3);
    common::until(|| fs.sessions().is_empty()).await;
    assert!(c.ls_root().await.is_empty());
}
