use anyhow::Result;
use rudt::framing;
use rudt::SocketType;
use tokio::io::AsyncWriteExt;

/// The canonical tiny transfer: a 3-byte file named "x" crosses the wire
/// as [name-len=1, "x", size=3, payload], and the server's output file
/// holds exactly those three payload bytes.
#[tokio::test]
async fn three_byte_file_arrives_intact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("x");
    let output = dir.path().join("filetest");
    {
        let mut f = tokio::fs::File::create(&input).await?;
        f.write_all(b"abc").await?;
        f.flush().await?;
    }

    let transport = rudt::startup();
    let server = transport.socket(SocketType::Stream);
    let client = transport.socket(SocketType::Stream);
    transport.bind(server, "127.0.0.1:0".parse()?).await?;
    transport.listen(server, 1)?;
    let addr = transport.local_addr(server)?.expect("bound");

    let t = transport.clone();
    let accepting = tokio::spawn(async move { t.accept(server).await });
    transport.connect(client, Some(addr)).await?;
    let (accepted, _) = accepting.await??;

    let t = transport.clone();
    let out_path = output.clone();
    let receiving =
        tokio::spawn(async move { framing::recv_file(&t, accepted, &out_path).await });

    let sent = framing::send_file(&transport, client, &input).await?;
    assert_eq!(sent, 3);

    let (name, received) = receiving.await??;
    assert_eq!(name, "x");
    assert_eq!(received, 3);
    let bytes = tokio::fs::read(&output).await?;
    assert_eq!(bytes, vec![0x61, 0x62, 0x63]);

    transport.close(client).await?;
    transport.close(server).await?;
    rudt::cleanup().await;
    Ok(())
}

/// A larger transfer exercises sendfile/recvfile chunking.
#[tokio::test]
async fn large_file_round_trips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("payload.bin");
    let output = dir.path().join("filetest");
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    tokio::fs::write(&input, &payload).await?;

    let transport = rudt::startup();
    let server = transport.socket(SocketType::Stream);
    let client = transport.socket(SocketType::Stream);
    transport.bind(server, "127.0.0.1:0".parse()?).await?;
    transport.listen(server, 1)?;
    let addr = transport.local_addr(server)?.expect("bound");

    let t = transport.clone();
    let accepting = tokio::spawn(async move { t.accept(server).await });
    transport.connect(client, Some(addr)).await?;
    let (accepted, _) = accepting.await??;

    let t = transport.clone();
    let out_path = output.clone();
    let receiving =
        tokio::spawn(async move { framing::recv_file(&t, accepted, &out_path).await });
    framing::send_file(&transport, client, &input).await?;
    let (name, received) = receiving.await??;
    assert_eq!(name, "payload.bin");
    assert_eq!(received, payload.len() as u64);
    assert_eq!(tokio::fs::read(&output).await?, payload);

    transport.close(client).await?;
    transport.close(server).await?;
    rudt::cleanup().await;
    Ok(())
}
