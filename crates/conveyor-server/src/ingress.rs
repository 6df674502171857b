//! Line-oriented ingress: one JSON command per stdin line, one JSON reply
//! per stdout line.

use std::collections::HashMap;

use conveyor_core::{Conveyor, Event, ReplayOutcome, TriggerOutcome};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IngressCommand {
    Publish(PublishRequest),
    /// A direct notification or an S3-style envelope.
    ObjectCreated(Value),
    Replay(Uuid),
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct PublishRequest {
    pub payload: Value,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Read commands until stdin closes.
pub async fn run(conveyor: &Conveyor) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(conveyor, &line).await;
        stdout.write_all(reply.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    debug!("ingress reached end of input");
    Ok(())
}

pub async fn handle_line(conveyor: &Conveyor, line: &str) -> Value {
    let command: IngressCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "rejected ingress line");
            return json!({ "ok": false, "error": format!("invalid command: {e}") });
        }
    };

    match command {
        IngressCommand::Publish(request) => {
            let payload = request.payload.to_string().into_bytes();
            let event = Event::new(payload).with_attributes(request.attributes);
            let report = conveyor.publish(event).await;
            json!({
                "ok": report.all_delivered(),
                "event_id": report.event_id,
                "delivered": report.delivered,
                "failed": report
                    .failed
                    .iter()
                    .map(|f| json!({ "subscriber": f.subscriber, "error": f.error }))
                    .collect::<Vec<_>>(),
            })
        }
        IngressCommand::ObjectCreated(body) => {
            let body = body.to_string();
            match conveyor.handle_object_created(body.as_bytes()).await {
                Ok(outcomes) => {
                    let outcomes: Vec<Value> = outcomes
                        .into_iter()
                        .map(|outcome| match outcome {
                            Ok(outcome) => trigger_json(&outcome),
                            Err(e) => json!({ "outcome": "error", "error": e.to_string() }),
                        })
                        .collect();
                    json!({ "ok": true, "outcomes": outcomes })
                }
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            }
        }
        IngressCommand::Replay(id) => match conveyor.replay(id).await {
            Ok(ReplayOutcome::Requeued { message_id }) => {
                json!({ "ok": true, "replayed": "queue", "message_id": message_id })
            }
            Ok(ReplayOutcome::Redispatched { event_id }) => {
                json!({ "ok": true, "replayed": "function", "event_id": event_id })
            }
            Ok(ReplayOutcome::Reprocessed { results }) => {
                let outcomes: Vec<Value> = results
                    .iter()
                    .map(|r| match r {
                        Ok(outcome) => trigger_json(outcome),
                        Err(e) => json!({ "outcome": "error", "error": e.to_string() }),
                    })
                    .collect();
                json!({ "ok": true, "replayed": "object_trigger", "outcomes": outcomes })
            }
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        },
    }
}

fn trigger_json(outcome: &TriggerOutcome) -> Value {
    let result = outcome.result();
    json!({
        "outcome": outcome.label(),
        "key": result.key,
        "status": result.status.to_string(),
    })
}
