mod common;

use std::time::Duration;

use common::{connect, options};
use tokio::io::AsyncReadExt;
use wsbase::{CancellationToken, CloseCode, MessageType, WebSocketError, WebSocketState};

#[tokio::test]
async fn test_concurrent_abort_is_idempotent() -> anyhow::Result<()> {
    let (ws, _client) = connect(options()).await?;

    let aborts = (0..8).map(|_| {
        let ws = ws.clone();
        tokio::spawn(async move { ws.abort() })
    });
    for result in futures::future::join_all(aborts).await {
        result?;
    }

    assert_eq!(ws.state(), WebSocketState::Aborted);
    ws.abort();
    assert_eq!(ws.state(), WebSocketState::Aborted);

    let token = CancellationToken::new();
    assert!(matches!(
        ws.send(&b"x"[..], MessageType::Binary, true, &token).await,
        Err(WebSocketError::InvalidState(WebSocketState::Aborted))
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(
        ws.receive(&mut buf, &token).await,
        Err(WebSocketError::InvalidState(WebSocketState::Aborted))
    ));
    Ok(())
}

#[tokio::test]
async fn test_caller_cancellation() -> anyhow::Result<()> {
    let (ws, _client) = connect(options()).await?;
    let token = CancellationToken::new();

    let pending = tokio::spawn({
        let ws = ws.clone();
        let token = token.clone();
        async move {
            let mut buf = [0u8; 8];
            ws.receive(&mut buf, &token).await.map(|_| ())
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    assert!(matches!(
        pending.await?,
        Err(WebSocketError::OperationCanceled)
    ));
    // a cut receive cannot be resumed
    assert_eq!(ws.state(), WebSocketState::Aborted);
    Ok(())
}

#[tokio::test]
async fn test_abort_under_pending_receive() -> anyhow::Result<()> {
    let (ws, mut client) = connect(options()).await?;

    let pending = tokio::spawn({
        let ws = ws.clone();
        async move {
            let mut buf = [0u8; 8];
            ws.receive(&mut buf, &CancellationToken::new())
                .await
                .map(|_| ())
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws.abort();

    let err = pending.await?.unwrap_err();
    assert!(
        matches!(err, WebSocketError::InvalidState(WebSocketState::Aborted)),
        "{err:?}"
    );

    // the receive held the read half during the abort and dropped it on the way out
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());
    drop(ws);
    Ok(())
}

#[tokio::test]
async fn test_dropped_receive_aborts() -> anyhow::Result<()> {
    let (ws, _client) = connect(options()).await?;
    let token = CancellationToken::new();

    let mut buf = [0u8; 8];
    let timed_out = tokio::time::timeout(Duration::from_millis(20), ws.receive(&mut buf, &token)).await;
    assert!(timed_out.is_err());
    assert_eq!(ws.state(), WebSocketState::Aborted);
    Ok(())
}

#[tokio::test]
async fn test_dispose() -> anyhow::Result<()> {
    let (ws, _client) = connect(options()).await?;
    let token = CancellationToken::new();

    ws.dispose();
    ws.dispose();
    ws.abort();
    assert_eq!(ws.state(), WebSocketState::Aborted);

    assert!(matches!(
        ws.send(&b"x"[..], MessageType::Text, true, &token).await,
        Err(WebSocketError::Disposed)
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(
        ws.receive(&mut buf, &token).await,
        Err(WebSocketError::Disposed)
    ));
    ws.close(CloseCode::Normal, None, &token).await?;
    Ok(())
}

#[tokio::test]
async fn test_dropping_last_handle_releases_stream() -> anyhow::Result<()> {
    let (ws, mut client) = connect(options()).await?;
    let other = ws.clone();

    drop(ws);
    assert_eq!(other.state(), WebSocketState::Open);

    drop(other);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());
    Ok(())
}
