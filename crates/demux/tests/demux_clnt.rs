//! Demux client behavior over an in-memory pipe

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::DuplexStream;

use demux::DemuxClnt;
use sigmap::{framed, CallReader, CallWriter, ClientId, Fcall, Fid, Msg, Seqno, SessionId, Tag};

fn call(tag: u64) -> Fcall {
    Fcall::new(
        SessionId(1),
        ClientId(1),
        Seqno(tag),
        Msg::Tread {
            fid: Fid(0),
            offset: 0,
            count: 8,
        },
    )
    .with_tag(Tag(tag))
}

fn pipe() -> (Arc<DemuxClnt<Fcall>>, DuplexStream) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (r, w) = framed(client_io);
    (Arc::new(DemuxClnt::new(r, w)), server_io)
}

#[tokio::test]
async fn test_replies_matched_by_tag_out_of_order() {
    let (clnt, server_io) = pipe();
    let (mut sr, mut sw) = framed(server_io);

    let server = tokio::spawn(async move {
        let mut reqs: Vec<Fcall> = Vec::new();
        for _ in 0..10 {
            reqs.push(sr.read_call().await.unwrap());
        }
        for req in reqs.into_iter().rev() {
            let data = req.tag.0.to_le_bytes().to_vec();
            sw.write_call(&req.reply(Msg::Rread { data })).await.unwrap();
        }
        (sr, sw)
    });

    let calls = (1..=10u64).map(|t| {
        let clnt = clnt.clone();
        async move { (t, clnt.send_receive(call(t)).await) }
    });
    for (t, reply) in join_all(calls).await {
        let reply = reply.unwrap();
        assert_eq!(reply.tag, Tag(t));
        assert_eq!(reply.msg, Msg::Rread { data: t.to_le_bytes().to_vec() });
    }
    assert_eq!(clnt.outstanding(), 0);
    let _halves = server.await.unwrap();
}

#[tokio::test]
async fn test_transport_failure_wakes_every_waiter() {
    let (clnt, server_io) = pipe();
    let (mut sr, sw) = framed(server_io);

    let waiters: Vec<_> = (1..=5u64)
        .map(|t| {
            let clnt = clnt.clone();
            tokio::spawn(async move { clnt.send_receive(call(t)).await })
        })
        .collect();

    // all five are on the wire before the server goes away
    for _ in 0..5 {
        let _: Fcall = sr.read_call().await.unwrap();
    }
    drop(sr);
    drop(sw);

    for w in waiters {
        let res = tokio::time::timeout(Duration::from_secs(5), w)
            .await
            .expect("waiter blocked after transport failure")
            .unwrap();
        assert!(res.unwrap_err().is_unreachable());
    }
    assert!(clnt.is_closed());

    let late = clnt.send_receive(call(99)).await;
    assert!(late.unwrap_err().is_unreachable());
}

#[tokio::test]
async fn test_close_is_idempotent_and_fails_pending() {
    let (clnt, server_io) = pipe();
    let (mut sr, _sw) = framed(server_io);

    let waiter = {
        let clnt = clnt.clone();
        tokio::spawn(async move { clnt.send_receive(call(1)).await })
    };
    let _: Fcall = sr.read_call().await.unwrap();

    clnt.close().await;
    clnt.close().await;

    assert!(waiter.await.unwrap().unwrap_err().is_unreachable());
    assert!(clnt.is_closed());
}

#[tokio::test]
async fn test_abandoned_call_withdraws_tag() {
    let (clnt, server_io) = pipe();
    let (mut sr, _sw) = framed(server_io);

    let res = tokio::time::timeout(Duration::from_millis(50), clnt.send_receive(call(7))).await;
    assert!(res.is_err());
    let _: Fcall = sr.read_call().await.unwrap();
    assert_eq!(clnt.outstanding(), 0);
}
