use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "causeway")]
#[command(about = "WebRTC relay signaling server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a running server for its stream directory and print it
    Streams {
        /// Server URL (e.g., ws://localhost:8443)
        #[arg(short, long, default_value = "ws://localhost:8443")]
        url: String,
    },
}

pub async fn run_streams_client(url: String) -> Result<()> {
    let ws_url = format!("{}/ws", url);
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "Connection timeout - is the signaling server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let request = serde_json::to_string(&ClientMessage::GetPipelines)?;
    write.send(Message::Text(request.into())).await?;

    let response = timeout(Duration::from_secs(10), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                match serde_json::from_str::<ServerMessage>(text.as_str())? {
                    ServerMessage::GetPipelinesResponse { info } => {
                        return Ok::<_, anyhow::Error>(info);
                    }
                    ServerMessage::Error { message } => {
                        return Err(anyhow::anyhow!("Server error: {}", message));
                    }
                    _ => {}
                }
            }
        }
        Err(anyhow::anyhow!("Connection closed before a response"))
    })
    .await;

    let streams = match response {
        Ok(Ok(streams)) => streams,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(anyhow::anyhow!("Timed out waiting for the stream list")),
    };

    if streams.is_empty() {
        println!("No playable streams available.");
    } else {
        println!("{} playable stream(s):", streams.len());
        for stream in streams {
            println!(
                "  [{}] {} (group {}, source {})",
                stream.id,
                stream.name.as_deref().unwrap_or("<unnamed>"),
                stream.group,
                stream.source
            );
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}
