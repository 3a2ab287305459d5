use anyhow::Result;
use rudt::{OptValue, SockOpt, SocketType};

/// Verify a full connect/accept cycle over real loopback UDP with traffic
/// in both directions across the shared listener port.
#[tokio::test]
async fn stream_transfer_over_loopback() -> Result<()> {
    let transport = rudt::startup();
    let server = transport.socket(SocketType::Stream);
    let client = transport.socket(SocketType::Stream);

    transport.bind(server, "127.0.0.1:0".parse()?).await?;
    transport.listen(server, 4)?;
    let addr = transport.local_addr(server)?.expect("bound socket has an address");

    let t = transport.clone();
    let accepting = tokio::spawn(async move { t.accept(server).await });
    transport.connect(client, Some(addr)).await?;
    let (accepted, peer) = accepting.await??;
    assert!(peer.is_some());

    // A payload larger than one packet so cutting and reassembly both run.
    let blob: Vec<u8> = (0..100_000u32).map(|i| (i % 249) as u8).collect();
    transport.send_all(client, &blob).await?;
    let mut echoed = vec![0u8; blob.len()];
    transport.recv_all(accepted, &mut echoed).await?;
    assert_eq!(echoed, blob);

    transport.send_all(accepted, b"and back again").await?;
    let mut back = [0u8; 14];
    transport.recv_all(client, &mut back).await?;
    assert_eq!(&back, b"and back again");

    let perf = transport.perfmon(client)?;
    assert!(perf.pkt_sent > 0);
    assert!(perf.pkt_recv_ack > 0);

    transport.close(client).await?;
    transport.close(accepted).await?;
    transport.close(server).await?;
    rudt::cleanup().await;
    Ok(())
}

/// Message-mode sockets preserve boundaries end to end: one sendmsg, one
/// recvmsg, exact bytes.
#[tokio::test]
async fn message_transfer_over_loopback() -> Result<()> {
    let transport = rudt::startup();
    let server = transport.socket(SocketType::Dgram);
    let client = transport.socket(SocketType::Dgram);

    transport.bind(server, "127.0.0.1:0".parse()?).await?;
    transport.listen(server, 4)?;
    let addr = transport.local_addr(server)?.expect("bound socket has an address");

    let t = transport.clone();
    let accepting = tokio::spawn(async move { t.accept(server).await });
    transport.connect(client, Some(addr)).await?;
    let (accepted, _) = accepting.await??;

    let first = vec![0xA5u8; 300];
    let second = vec![0x5Au8; 9000];
    transport.sendmsg(client, &first, None, true).await?;
    transport.sendmsg(client, &second, None, true).await?;
    assert_eq!(transport.recvmsg(accepted, false).await?, first);
    assert_eq!(transport.recvmsg(accepted, false).await?, second);

    transport.close(client).await?;
    transport.close(accepted).await?;
    transport.close(server).await?;
    rudt::cleanup().await;
    Ok(())
}

/// Rendezvous mode: both sides initiate at once and adopt each other.
#[tokio::test]
async fn rendezvous_connect_over_loopback() -> Result<()> {
    let transport = rudt::startup();
    let a = transport.socket(SocketType::Stream);
    let b = transport.socket(SocketType::Stream);
    transport.set_opt(a, SockOpt::Rendezvous, OptValue::Bool(true))?;
    transport.set_opt(b, SockOpt::Rendezvous, OptValue::Bool(true))?;

    transport.bind(a, "127.0.0.1:0".parse()?).await?;
    transport.bind(b, "127.0.0.1:0".parse()?).await?;
    let addr_a = transport.local_addr(a)?.expect("bound");
    let addr_b = transport.local_addr(b)?.expect("bound");

    let (ra, rb) = tokio::join!(
        transport.connect(a, Some(addr_b)),
        transport.connect(b, Some(addr_a))
    );
    ra?;
    rb?;

    transport.send_all(a, b"meet me halfway").await?;
    let mut buf = [0u8; 15];
    transport.recv_all(b, &mut buf).await?;
    assert_eq!(&buf, b"meet me halfway");

    transport.close(a).await?;
    transport.close(b).await?;
    rudt::cleanup().await;
    Ok(())
}
