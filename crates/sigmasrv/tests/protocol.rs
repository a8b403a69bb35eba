//! Fcall semantics end to end through `FsServer::process`

mod common;

use std::sync::Arc;

use sigmap::{Fence, FenceId, Fid, Mode, Msg, Perm, SigmaError};
use sigmasrv::{FsServer, MemStore, StatsSnapshot, STATS_FILE};

use common::{entries, Conn};

async fn server() -> Arc<FsServer> {
    Arc::new(FsServer::new(Arc::new(MemStore::new())).await.unwrap())
}

fn create(fid: u32, name: &str, perm: Perm, mode: Mode) -> Msg {
    Msg::Tcreate {
        fid: Fid(fid),
        name: name.into(),
        perm,
        mode,
        lease: None,
    }
}

fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn put(path: &[&str], data: &[u8]) -> Msg {
    Msg::Tputfile {
        fid: Fid(0),
        wnames: names(path),
        mode: Mode::OWRITE | Mode::OTRUNC,
        perm: Perm(0o644),
        offset: 0,
        data: data.to_vec(),
        lease: None,
    }
}

fn get(path: &[&str]) -> Msg {
    Msg::Tgetfile {
        fid: Fid(0),
        wnames: names(path),
        mode: Mode::OREAD,
        offset: 0,
        count: 1 << 20,
    }
}

fn err(m: Msg) -> SigmaError {
    match m {
        Msg::Rerror(e) => e,
        m => panic!("expected an error, got {m:?}"),
    }
}

#[tokio::test]
async fn test_fenced_writes_reject_stale_epochs() {
    let fs = server().await;
    let mut a = Conn::new(&fs, 1);
    a.attach().await;
    a.walk(0, 1, &[]).await;
    a.call(create(1, "f", Perm(0o644), Mode::OWRITE)).await;

    let fenced = |conn: &Conn, epoch: u64| {
        conn.fcall(Msg::Twrite {
            fid: Fid(1),
            offset: 0,
            data: b"x".to_vec(),
        })
        .with_fence(Some(Fence::new("/f", epoch)))
    };

    let tag = a.send(fenced(&a, 1));
    assert_eq!(a.reply(tag).await, Msg::Rwrite { count: 1 });
    let tag = a.send(fenced(&a, 2));
    assert_eq!(a.reply(tag).await, Msg::Rwrite { count: 1 });
    let tag = a.send(fenced(&a, 1));
    assert!(err(a.reply(tag).await).is_stale());

    // the newer epoch is server wide
    let mut b = Conn::new(&fs, 2);
    b.attach().await;
    let r = b
        .call(Msg::Tfence {
            fence: Fence::new("/f", 1),
        })
        .await;
    assert!(err(r).is_stale());

    // a fence must cover what it guards
    let fc = a
        .fcall(Msg::Twrite {
            fid: Fid(1),
            offset: 0,
            data: b"x".to_vec(),
        })
        .with_fence(Some(Fence::new("/g", 9)));
    let tag = a.send(fc);
    assert!(matches!(err(a.reply(tag).await), SigmaError::Inval(_)));
}

#[tokio::test]
async fn test_session_fences_guard_mutations() {
    let fs = server().await;
    let mut old = Conn::new(&fs, 1);
    old.attach().await;
    assert_eq!(
        old.call(Msg::Tfence {
            fence: Fence::new("/cfg", 1)
        })
        .await,
        Msg::Rfence
    );
    old.walk(0, 1, &[]).await;
    assert!(matches!(
        old.call(create(1, "cfg", Perm::DMDIR | Perm(0o755), Mode::OREAD))
            .await,
        Msg::Rcreate { .. }
    ));

    let mut new = Conn::new(&fs, 2);
    new.attach().await;
    assert_eq!(
        new.call(Msg::Tfence {
            fence: Fence::new("/cfg", 2)
        })
        .await,
        Msg::Rfence
    );
    assert_eq!(new.call(put(&["cfg", "leader"], b"new")).await, Msg::Rwrite { count: 3 });

    // the old holder's registered fence is now stale for anything under /cfg
    assert!(err(old.call(put(&["cfg", "leader"], b"old")).await).is_stale());
    // but not for paths it does not cover
    assert_eq!(old.call(put(&["other"], b"ok")).await, Msg::Rwrite { count: 2 });

    assert_eq!(
        old.call(Msg::Tunfence {
            id: FenceId::new("/cfg")
        })
        .await,
        Msg::Runfence
    );
    assert!(matches!(
        err(old
            .call(Msg::Tunfence {
                id: FenceId::new("/cfg")
            })
            .await),
        SigmaError::UnknownFence(_)
    ));
    assert_eq!(new.call(get(&["cfg", "leader"])).await, Msg::Rread { data: b"new".to_vec() });
}

#[tokio::test]
async fn test_unnormalized_fence_path_matches_its_normal_form() {
    let fs = server().await;
    let mut a = Conn::new(&fs, 1);
    a.attach().await;
    let raw = Fence {
        id: FenceId {
            path: "cfg//".into(),
        },
        epoch: sigmap::Epoch(3),
    };
    assert_eq!(a.call(Msg::Tfence { fence: raw }).await, Msg::Rfence);

    let mut b = Conn::new(&fs, 2);
    b.attach().await;
    let fc = b
        .fcall(put(&["cfg"], b"x"))
        .with_fence(Some(Fence::new("/cfg", 2)));
    let tag = b.send(fc);
    assert!(err(b.reply(tag).await).is_stale());

    assert_eq!(
        a.call(Msg::Tunfence {
            id: FenceId::new("/cfg")
        })
        .await,
        Msg::Runfence
    );
}

#[tokio::test]
async fn test_exclusive_create_waits_for_removal() {
    let fs = server().await;
    let mut holder = Conn::new(&fs, 1);
    holder.attach().await;
    holder.walk(0, 1, &[]).await;
    holder
        .call(create(1, "lock", Perm::DMTMP | Perm(0o644), Mode::OWRITE))
        .await;

    let mut waiter = Conn::new(&fs, 2);
    waiter.attach().await;
    let r = waiter.call(create(0, "lock", Perm(0o644), Mode::OWRITE)).await;
    assert!(err(r).is_exists());

    let fc = waiter.fcall(create(0, "lock", Perm(0o644), Mode::OWRITE | Mode::OWATCH));
    let pending = waiter.send(fc);

    assert_eq!(holder.call(Msg::Tremove { fid: Fid(1) }).await, Msg::Rremove);
    assert!(matches!(waiter.reply(pending).await, Msg::Rcreate { .. }));
    assert_eq!(waiter.ls_root().await, vec!["lock"]);
}

#[tokio::test]
async fn test_walk_open_read_write() {
    let fs = server().await;
    let mut c = Conn::new(&fs, 1);
    c.attach().await;
    c.walk(0, 1, &[]).await;
    c.call(create(1, "d", Perm::DMDIR | Perm(0o755), Mode::OREAD))
        .await;
    c.walk(1, 2, &[]).await;
    c.call(create(2, "f", Perm(0o644), Mode::ORDWR)).await;
    assert_eq!(
        c.call(Msg::Twrite {
            fid: Fid(2),
            offset: 0,
            data: b"hello".to_vec(),
        })
        .await,
        Msg::Rwrite { count: 5 }
    );

    let r = c.walk(0, 3, &["d", "f"]).await;
    let Msg::Rwalk { qids } = r else {
        panic!("{r:?}");
    };
    assert_eq!(qids.len(), 2);
    assert!(qids[0].is_dir());

    let r = c.walk(3, 4, &["..", "f"]).await;
    assert!(matches!(r, Msg::Rwalk { .. }), "{r:?}");
    assert!(err(c.walk(0, 5, &["nope"]).await).is_not_found());
    assert!(err(c.walk(0, 3, &[]).await).to_string().contains("in use"));

    assert!(matches!(
        err(c
            .call(Msg::Tread {
                fid: Fid(3),
                offset: 0,
                count: 5,
            })
            .await),
        SigmaError::Inval(_)
    ));
    c.call(Msg::Topen {
        fid: Fid(3),
        mode: Mode::OREAD,
    })
    .await;
    assert_eq!(
        c.call(Msg::Tread {
            fid: Fid(3),
            offset: 1,
            count: 3,
        })
        .await,
        Msg::Rread {
            data: b"ell".to_vec()
        }
    );
    assert!(matches!(
        err(c
            .call(Msg::Twrite {
                fid: Fid(3),
                offset: 0,
                data: b"x".to_vec(),
            })
            .await),
        SigmaError::Inval(_)
    ));

    let Msg::Rstat { stat } = c.call(Msg::Tstat { fid: Fid(4) }).await else {
        panic!("stat");
    };
    assert_eq!(stat.length, 5);
    assert_eq!(stat.name, "f");
}

#[tokio::test]
async fn test_directory_reads_page_through_entries() {
    let fs = server().await;
    let mut c = Conn::new(&fs, 1);
    c.attach().await;
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        let fid = 10 + i as u32;
        c.walk(0, fid, &[]).await;
        c.call(create(fid, name, Perm(0o644), Mode::OWRITE)).await;
    }
    c.call(Msg::Topen {
        fid: Fid(0),
        mode: Mode::OREAD,
    })
    .await;

    let mut seen = Vec::new();
    loop {
        let r = c
            .call(Msg::Tread {
                fid: Fid(0),
                offset: seen.len() as u64,
                count: 64,
            })
            .await;
        let Msg::Rread { data } = r else {
            panic!("{r:?}");
        };
        let chunk = entries(&data);
        if chunk.is_empty() {
            break;
        }
        seen.extend(chunk.into_iter().map(|e| e.name));
    }
    assert_eq!(seen, names(&["a", "b", "c", "d"]));
}

#[tokio::test]
async fn test_rename_and_rename_at() {
    let fs = server().await;
    let mut c = Conn::new(&fs, 1);
    c.attach().await;
    for d in ["src", "dst"] {
        c.walk(0, 1, &[]).await;
        c.call(create(1, d, Perm::DMDIR | Perm(0o755), Mode::OREAD))
            .await;
        c.call(Msg::Tclunk { fid: Fid(1) }).await;
    }
    assert_eq!(c.call(put(&["src", "a"], b"1")).await, Msg::Rwrite { count: 1 });

    c.walk(0, 2, &["src", "a"]).await;
    assert_eq!(
        c.call(Msg::Twstat {
            fid: Fid(2),
            name: Some("b".into()),
            length: None,
        })
        .await,
        Msg::Rwstat
    );
    assert!(err(c.call(get(&["src", "a"])).await).is_not_found());
    assert_eq!(c.call(get(&["src", "b"])).await, Msg::Rread { data: b"1".to_vec() });

    c.walk(0, 3, &["src"]).await;
    c.walk(0, 4, &["dst"]).await;
    assert_eq!(
        c.call(Msg::Trenameat {
            oldfid: Fid(3),
            oldname: "b".into(),
            newfid: Fid(4),
            newname: "c".into(),
        })
        .await,
        Msg::Rrenameat
    );
    assert_eq!(c.call(get(&["dst", "c"])).await, Msg::Rread { data: b"1".to_vec() });
    assert!(err(c.call(get(&["src", "b"])).await).is_not_found());

    // moving onto an existing file replaces it
    c.call(put(&["src", "x"], b"22")).await;
    c.call(Msg::Trenameat {
        oldfid: Fid(3),
        oldname: "x".into(),
        newfid: Fid(4),
        newname: "c".into(),
    })
    .await;
    assert_eq!(c.call(get(&["dst", "c"])).await, Msg::Rread { data: b"22".to_vec() });
}

#[tokio::test]
async fn test_remove_variants() {
    let fs = server().await;
    let mut c = Conn::new(&fs, 1);
    c.attach().await;
    c.call(put(&["a"], b"")).await;
    c.call(put(&["b"], b"")).await;
    c.walk(0, 1, &[]).await;
    c.call(create(1, "d", Perm::DMDIR | Perm(0o755), Mode::OREAD))
        .await;
    c.call(put(&["d", "inner"], b"")).await;

    assert!(matches!(
        err(c
            .call(Msg::Tremovefile {
                fid: Fid(0),
                wnames: names(&["d"]),
            })
            .await),
        SigmaError::NotEmpty(_)
    ));
    assert_eq!(
        c.call(Msg::Tremovefile {
            fid: Fid(0),
            wnames: names(&["a"]),
        })
        .await,
        Msg::Rremove
    );

    // ORCLOSE removes on clunk
    c.walk(0, 2, &["b"]).await;
    c.call(Msg::Topen {
        fid: Fid(2),
        mode: Mode::OREAD | Mode::ORCLOSE,
    })
    .await;
    assert_eq!(c.call(Msg::Tclunk { fid: Fid(2) }).await, Msg::Rclunk);
    assert_eq!(c.ls_root().await, vec!["d"]);

    assert!(matches!(
        err(c.call(Msg::Tremove { fid: Fid(0) }).await),
        SigmaError::Inval(_)
    ));
}

#[tokio::test]
async fn test_put_appends_and_stats_file() {
    let fs = server().await;
    let mut c = Conn::new(&fs, 1);
    c.attach().await;
    c.call(put(&["log"], b"one")).await;
    let append = Msg::Tputfile {
        fid: Fid(0),
        wnames: names(&["log"]),
        mode: Mode::OWRITE | Mode::OAPPEND,
        perm: Perm(0o644),
        offset: 0,
        data: b"two".to_vec(),
        lease: None,
    };
    assert_eq!(c.call(append).await, Msg::Rwrite { count: 3 });
    assert_eq!(c.call(get(&["log"])).await, Msg::Rread { data: b"onetwo".to_vec() });

    let Msg::Rread { data } = c.call(get(&[STATS_FILE])).await else {
        panic!("stats");
    };
    let stats: StatsSnapshot = serde_json::from_slice(&data).unwrap();
    assert_eq!(stats.ops.get("Tputfile"), Some(&2));
    assert_eq!(stats.sessions, 1);
    assert_eq!(fs.stats().nops, stats.nops);
}
