//! One-off requests from the command line
//!
//! Unary replies are printed as a single JSON document. Streams are printed
//! as NDJSON, one envelope per line, in the same framing a web front end
//! relays to browsers:
//!
//! ```text
//! {"type":"chunk","content":"1"}
//! {"type":"chunk","content":"2"}
//! {"type":"end"}
//! ```

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;

use relay_core::transport::{AmqpBroker, Broker};
use relay_core::{RelayConfig, ResponseEnvelope, RpcClient, RpcError};

fn client(config: &RelayConfig) -> RpcClient {
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.broker.clone()));
    RpcClient::new(broker, config.client_config())
}

/// Send a unary request; returns whether it succeeded
pub async fn unary(config: &RelayConfig, message: &str, out: &mut impl Write) -> Result<bool> {
    let client = client(config);
    let ok = unary_with(&client, message, out).await?;
    client.close().await;
    Ok(ok)
}

/// Send a streaming request; returns whether it ended cleanly
pub async fn stream(config: &RelayConfig, message: &str, out: &mut impl Write) -> Result<bool> {
    let client = client(config);
    let ok = stream_with(&client, message, out).await?;
    client.close().await;
    Ok(ok)
}

async fn unary_with(client: &RpcClient, message: &str, out: &mut impl Write) -> Result<bool> {
    let (value, ok) = match client.call(message, None, None).await {
        Ok(value) => (value, true),
        Err(e) => (e.to_payload(), false),
    };
    writeln!(out, "{value}").context("Failed to write reply")?;
    Ok(ok)
}

async fn stream_with(client: &RpcClient, message: &str, out: &mut impl Write) -> Result<bool> {
    let mut chunks = client.stream(message, None, None);
    let mut ok = true;

    while let Some(item) = chunks.next().await {
        if item.is_err() {
            ok = false;
        }
        write_frame(out, &frame(item))?;
    }
    if ok {
        write_frame(out, &ResponseEnvelope::End)?;
    }
    Ok(ok)
}

fn frame(item: Result<String, RpcError>) -> ResponseEnvelope {
    match item {
        Ok(content) => ResponseEnvelope::chunk(content),
        Err(e) => ResponseEnvelope::error(e.to_string()),
    }
}

fn write_frame(out: &mut impl Write, envelope: &ResponseEnvelope) -> Result<()> {
    let line = envelope.to_bytes().context("Failed to encode frame")?;
    out.write_all(&line)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relay_core::transport::InProcessBroker;
    use relay_core::ClientConfig;

    fn lines(out: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn offline_client() -> RpcClient {
        // No worker consumes the task queue, so every request times out
        RpcClient::new(
            InProcessBroker::new(),
            ClientConfig {
                call_timeout: Duration::from_secs(1),
                stream_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_frames() {
        let mut out = Vec::new();
        write_frame(&mut out, &frame(Ok("1".to_string()))).unwrap();
        write_frame(&mut out, &frame(Err(RpcError::Worker("boom".to_string())))).unwrap();
        write_frame(&mut out, &ResponseEnvelope::End).unwrap();

        assert_eq!(
            lines(&out),
            vec![
                serde_json::json!({"type": "chunk", "content": "1"}),
                serde_json::json!({"type": "error", "content": "worker error: boom"}),
                serde_json::json!({"type": "end"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_unary_failure_prints_error_payload() {
        let client = offline_client();
        let mut out = Vec::new();

        let ok = unary_with(&client, "ping", &mut out).await.unwrap();

        assert!(!ok);
        assert_eq!(
            lines(&out),
            vec![serde_json::json!({"error": "timeout after 1 seconds"})]
        );
    }

    #[tokio::test]
    async fn test_stream_failure_ends_with_error_frame() {
        let client = offline_client();
        let mut out = Vec::new();

        let ok = stream_with(&client, "count to 3", &mut out).await.unwrap();

        assert!(!ok);
        let frames = lines(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
    }
}
