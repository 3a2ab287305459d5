use anyhow::Result;
use rudt::framing::{self, MediaFrame, Negotiation};
use rudt::SocketType;

async fn connected_pair(
    transport: &std::sync::Arc<rudt::Transport>,
) -> Result<(u32, u32, u32)> {
    let server = transport.socket(SocketType::Stream);
    let client = transport.socket(SocketType::Stream);
    transport.bind(server, "127.0.0.1:0".parse()?).await?;
    transport.listen(server, 1)?;
    let addr = transport.local_addr(server)?.expect("bound");
    let t = transport.clone();
    let accepting = tokio::spawn(async move { t.accept(server).await });
    transport.connect(client, Some(addr)).await?;
    let (accepted, _) = accepting.await??;
    Ok((server, client, accepted))
}

/// A capture client offering "h265x" with empty caps to a server with no
/// decode sink gets the four-byte `0x00 0x00 0x00 0x02` refusal.
#[tokio::test]
async fn offer_without_a_sink_is_declined_with_status_two() -> Result<()> {
    let transport = rudt::startup();
    let (server, client, accepted) = connected_pair(&transport).await?;

    let t = transport.clone();
    let serving = tokio::spawn(async move {
        let neg = framing::read_negotiation(&t, accepted).await?;
        assert_eq!(neg.encoder, "h265x");
        assert!(neg.caps.is_empty());
        framing::send_status(&t, accepted, framing::STATUS_NO_SINK).await?;
        Ok::<_, rudt::TransportError>(())
    });

    // Raw preamble bytes, as the reference capture tool writes them.
    let mut preamble = Vec::new();
    preamble.extend_from_slice(&[0, 0, 0, 5]);
    preamble.extend_from_slice(b"h265x");
    preamble.extend_from_slice(&[0, 0, 0, 0]);
    transport.send_all(client, &preamble).await?;

    let mut status = [0u8; 4];
    transport.recv_all(client, &mut status).await?;
    assert_eq!(status, [0x00, 0x00, 0x00, 0x02]);
    serving.await??;

    transport.close(client).await?;
    transport.close(server).await?;
    rudt::cleanup().await;
    Ok(())
}

/// When the offer is accepted, frames cross with their timestamps,
/// sentinel "none" values and flags preserved.
#[tokio::test]
async fn accepted_stream_carries_frames() -> Result<()> {
    let transport = rudt::startup();
    let (server, client, accepted) = connected_pair(&transport).await?;

    let t = transport.clone();
    let serving = tokio::spawn(async move {
        let neg = framing::read_negotiation(&t, accepted).await?;
        assert_eq!(neg.caps, "video/x-h265");
        framing::send_status(&t, accepted, framing::STATUS_ACCEPT).await?;
        let first = framing::read_frame(&t, accepted).await?;
        let second = framing::read_frame(&t, accepted).await?;
        Ok::<_, rudt::TransportError>((first, second))
    });

    let neg = Negotiation { encoder: "x265enc".into(), caps: "video/x-h265".into() };
    let status = framing::negotiate(&transport, client, &neg).await?;
    assert_eq!(status, framing::STATUS_ACCEPT);

    let keyframe = MediaFrame {
        pts: Some(0),
        duration: Some(33_000_000),
        flags: 0,
        payload: vec![0x42; 4096],
    };
    let unstamped = MediaFrame { pts: None, duration: None, flags: 0x2000, payload: vec![7; 10] };
    framing::send_frame(&transport, client, &keyframe).await?;
    framing::send_frame(&transport, client, &unstamped).await?;

    let (first, second) = serving.await??;
    assert_eq!(first, keyframe);
    assert_eq!(second, unstamped);

    transport.close(client).await?;
    transport.close(server).await?;
    rudt::cleanup().await;
    Ok(())
}
